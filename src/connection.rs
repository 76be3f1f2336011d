use crate::failure::{Classification, FailureKind, classify};
use crate::throttle::ReconnectThrottle;
use crate::transport::{
    Connector, DEFAULT_PORT, DEFAULT_UNIT_ID, Endpoint, Session, TcpConnector, TransportError,
};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not connected to the device")]
    Disconnected,
    #[error("the device returned no data for register {0}")]
    EmptyResult(u16),
    #[error(
        "writing {requested:#06x} to register {address} failed, the device acknowledged \
         {acknowledged:#06x}"
    )]
    WriteMismatch { address: u16, requested: u16, acknowledged: u16 },
    #[error("modbus request for register {1} failed")]
    Transport(#[source] TransportError, u16),
}

impl Error {
    pub fn classification(&self) -> Classification {
        match self {
            Error::Transport(e, _) => classify(e.kind()),
            Error::Disconnected | Error::EmptyResult(_) | Error::WriteMismatch { .. } => {
                Classification::Other
            }
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::Transport(e, _) => Some(e.kind()),
            _ => None,
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the Neptun Smart controller.
    #[arg(long)]
    host: String,

    /// The Modbus-TCP port of the controller.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The modbus unit ID the controller answers to.
    #[arg(long, short = 'i', default_value_t = DEFAULT_UNIT_ID)]
    unit_id: u8,
}

impl Args {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint { host: self.host.clone(), port: self.port, unit_id: self.unit_id }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type OnConnect = Box<dyn Fn() + Send + Sync>;

struct Shared<C: Connector> {
    endpoint: Endpoint,
    connector: C,
    /// Held for the duration of a single request.
    session: Mutex<Option<C::Session>>,
    state: watch::Sender<ConnectionState>,
    throttle: ReconnectThrottle,
    on_connect: OnConnect,
}

/// Owns the Modbus session to a single controller and keeps it alive.
///
/// A worker task makes the initial connection and every reconnection after that, so connection
/// attempts never overlap. Register operations never wait for a connection: without a live
/// session they fail with [`Error::Disconnected`] straight away. Failures that look like network
/// trouble schedule a reconnect through the [`ReconnectThrottle`] and are still reported to the
/// caller. The failed request itself is never retried here.
pub struct Connection<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
    #[allow(unused)] // exists for its drop handler
    worker: AbortOnDropHandle<()>,
}

impl Connection<TcpConnector> {
    pub fn new(endpoint: Endpoint, on_connect: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_connector(endpoint, TcpConnector, ReconnectThrottle::default(), on_connect)
    }
}

impl<C: Connector> Connection<C> {
    /// Start maintaining a connection to `endpoint`.
    ///
    /// `on_connect` is called once after every successful (re)connection. Must be called within
    /// a tokio runtime.
    pub fn with_connector(
        endpoint: Endpoint,
        connector: C,
        throttle: ReconnectThrottle,
        on_connect: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            endpoint,
            connector,
            session: Mutex::new(None),
            state,
            throttle,
            on_connect: Box::new(on_connect),
        });
        let worker = AbortOnDropHandle::new(tokio::spawn(Arc::clone(&shared).maintain()));
        Self { shared, worker }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Resolves once a session is established, immediately if one already is.
    pub async fn wait_connected(&self) {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = state.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    /// Read a single holding register.
    pub async fn read_register(&self, address: u16) -> Result<u16, Error> {
        let result = {
            let mut session = self.shared.session.lock().await;
            let session = session.as_mut().ok_or(Error::Disconnected)?;
            session.read_holding_registers(address, 1).await
        };
        let words = result.map_err(|e| self.shared.on_failure(e, address))?;
        words.first().copied().ok_or(Error::EmptyResult(address))
    }

    /// Write a single holding register and check that the device stored exactly `value`.
    ///
    /// Returns the value acknowledged by the device.
    pub async fn write_register_verified(&self, address: u16, value: u16) -> Result<u16, Error> {
        let result = {
            let mut session = self.shared.session.lock().await;
            let session = session.as_mut().ok_or(Error::Disconnected)?;
            session.write_single_register(address, value).await
        };
        let acknowledged = result.map_err(|e| self.shared.on_failure(e, address))?;
        if acknowledged != value {
            return Err(Error::WriteMismatch { address, requested: value, acknowledged });
        }
        Ok(acknowledged)
    }
}

impl<C: Connector> Shared<C> {
    async fn maintain(self: Arc<Self>) {
        self.connect().await;
        loop {
            self.throttle.next_due().await;
            self.reconnect().await;
        }
    }

    async fn connect(&self) {
        self.state.send_replace(ConnectionState::Connecting);
        match self.connector.connect(&self.endpoint).await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                self.state.send_replace(ConnectionState::Connected);
                info!(message = "session established", endpoint = %self.endpoint);
                (self.on_connect)();
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!(
                    message = "connecting failed, will retry",
                    endpoint = %self.endpoint,
                    error = (&e as &dyn std::error::Error)
                );
                self.throttle.request();
            }
        }
    }

    async fn reconnect(&self) {
        // Requests still running against the stale session finish (or time out) before we get
        // the lock. Requests made from here on fail fast until the new session is stored.
        let stale = self.session.lock().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!(
                    message = "closing the stale session failed",
                    error = (&e as &dyn std::error::Error)
                );
            }
        }
        self.connect().await;
    }

    fn on_failure(&self, error: TransportError, address: u16) -> Error {
        let error = Error::Transport(error, address);
        match error.classification() {
            Classification::Transient => {
                let scheduled = self.throttle.request();
                warn!(
                    message = "network failure, reconnecting",
                    address,
                    scheduled,
                    kind = ?error.failure_kind(),
                    error = (&error as &dyn std::error::Error)
                );
            }
            Classification::Other => {
                debug!(
                    message = "request failed",
                    address,
                    error = (&error as &dyn std::error::Error)
                );
            }
        }
        error
    }
}
