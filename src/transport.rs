//! The seam between the connection manager and the network.
//!
//! [`Connector`] opens [`Session`]s; [`TcpConnector`] does so over Modbus-TCP. Tests substitute
//! an in-memory implementation.

use crate::failure::FailureKind;
use crate::modbus::{ModbusTcpCodec, Operation, Request, Response, ResponseKind};
use futures::{SinkExt as _, StreamExt as _};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

/// How long a single request (or connection attempt) may take before it is considered failed.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PORT: u16 = 503;
pub const DEFAULT_UNIT_ID: u8 = 240;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the device closed the connection")]
    Closed,
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("the device responded with exception code {0}")]
    Exception(u8),
    #[error("the response does not match the request")]
    UnexpectedResponse,
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::LookupHost(e, _)
            | TransportError::Connect(e, _)
            | TransportError::Send(e)
            | TransportError::Receive(e)
            | TransportError::Shutdown(e) => FailureKind::from(e),
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Closed => FailureKind::Shutdown,
            TransportError::Exception(_) => FailureKind::Exception,
            TransportError::UnexpectedResponse => FailureKind::Protocol,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: DEFAULT_PORT, unit_id: DEFAULT_UNIT_ID }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live request/response channel to one device.
pub trait Session: Send + 'static {
    /// Read `count` holding registers starting at `address`.
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Write a single holding register, returning the value the device acknowledged.
    fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<u16, TransportError>> + Send;

    fn close(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub trait Connector: Send + Sync + 'static {
    type Session: Session;
    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Session = TcpSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<TcpSession, TransportError>> + Send {
        let address = endpoint.to_string();
        let unit_id = endpoint.unit_id;
        async move {
            info!(message = "connecting...", %address);
            let connecting = async {
                let addresses = tokio::net::lookup_host(&address)
                    .await
                    .map_err(|e| TransportError::LookupHost(e, address.clone()))?
                    .collect::<Vec<_>>();
                debug!(message = "resolved", ?addresses);
                TcpStream::connect(&*addresses)
                    .await
                    .map_err(|e| TransportError::Connect(e, address.clone()))
            };
            let socket = tokio::time::timeout(REQUEST_TIMEOUT, connecting)
                .await
                .map_err(|_| TransportError::Timeout(REQUEST_TIMEOUT))??;
            let nodelay_result = socket.set_nodelay(true);
            trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
            info!(message = "connected", %address);
            Ok(TcpSession {
                io: Framed::new(socket, ModbusTcpCodec {}),
                unit_id,
                timeout: REQUEST_TIMEOUT,
                next_transaction_id: 0,
            })
        }
    }
}

pub struct TcpSession {
    io: Framed<TcpStream, ModbusTcpCodec>,
    unit_id: u8,
    timeout: Duration,
    next_transaction_id: u16,
}

impl TcpSession {
    async fn request(&mut self, operation: Operation) -> Result<ResponseKind, TransportError> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        let unit_id = self.unit_id;
        let request = Request { unit_id, transaction_id, operation };
        let io = &mut self.io;
        let exchange = async move {
            io.send(request).await.map_err(TransportError::Send)?;
            loop {
                let response: Response = match io.next().await {
                    None => return Err(TransportError::Closed),
                    Some(Err(e)) => return Err(TransportError::Receive(e)),
                    Some(Ok(response)) => response,
                };
                if response.transaction_id == transaction_id && response.unit_id == unit_id {
                    return Ok(response.kind);
                }
                // Leftovers from a request that timed out earlier on this connection, or a
                // reply on behalf of another unit behind the same gateway.
                debug!(
                    message = "a response we were not expecting",
                    transaction = response.transaction_id,
                    expected = transaction_id,
                    unit = response.unit_id,
                    expected_unit = unit_id
                );
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }
}

impl Session for TcpSession {
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send {
        async move {
            match self.request(Operation::GetHoldings { address, count }).await? {
                ResponseKind::GetHoldings { values } => Ok(values),
                ResponseKind::Exception(code) => Err(TransportError::Exception(code)),
                ResponseKind::SetHolding { .. } => Err(TransportError::UnexpectedResponse),
            }
        }
    }

    fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<u16, TransportError>> + Send {
        async move {
            match self.request(Operation::SetHolding { address, value }).await? {
                ResponseKind::SetHolding { address: echoed, value } if echoed == address => {
                    Ok(value)
                }
                ResponseKind::Exception(code) => Err(TransportError::Exception(code)),
                _ => Err(TransportError::UnexpectedResponse),
            }
        }
    }

    fn close(mut self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move { self.io.close().await.map_err(TransportError::Shutdown) }
    }
}
