use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const READ_HOLDING_REGISTERS: u8 = 3;
pub const WRITE_SINGLE_REGISTER: u8 = 6;

/// Transaction ID, protocol ID, length.
const MBAP_PREFIX_LEN: usize = 6;
/// Unit ID and function code are the shortest payload the length field can describe.
const MIN_LENGTH: usize = 2;
/// Unit ID plus the largest PDU.
const MAX_LENGTH: usize = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(u8),
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
}

/// Modbus-TCP ADU framing for the handful of function codes the controller understands.
pub struct ModbusTcpCodec {}

impl Encoder<Request> for ModbusTcpCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (function_code, address, word) = match req.operation {
            Operation::GetHoldings { address, count } => (READ_HOLDING_REGISTERS, address, count),
            Operation::SetHolding { address, value } => (WRITE_SINGLE_REGISTER, address, value),
        };
        dst.reserve(MBAP_PREFIX_LEN + 6);
        dst.extend(req.transaction_id.to_be_bytes());
        dst.extend(0u16.to_be_bytes());
        dst.extend(6u16.to_be_bytes());
        dst.extend([req.unit_id, function_code]);
        dst.extend(address.to_be_bytes());
        dst.extend(word.to_be_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTcpCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, _)) = src.split_first_chunk::<MBAP_PREFIX_LEN>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if protocol != 0 || !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
                // Not a frame boundary. Skip ahead until something resembling a header shows up.
                src.advance(1);
                continue;
            }
            if src.len() < MBAP_PREFIX_LEN + length {
                src.reserve(MBAP_PREFIX_LEN + length - src.len());
                return Ok(None);
            }
            let frame = src.split_to(MBAP_PREFIX_LEN + length);
            let [unit_id, function_code, pdu @ ..] = &frame[MBAP_PREFIX_LEN..] else {
                unreachable!("length is at least {MIN_LENGTH}");
            };
            let (unit_id, function_code) = (*unit_id, *function_code);
            let kind = if function_code & 0x80 != 0 {
                let [code, ..] = pdu else {
                    trace!(message = "exception response without a code", transaction_id);
                    continue;
                };
                ResponseKind::Exception(*code)
            } else {
                match function_code {
                    READ_HOLDING_REGISTERS => {
                        // The byte count duplicates what the MBAP length already says. Trust the
                        // latter and ignore an odd trailing byte, if any.
                        let [_byte_count, values @ ..] = pdu else {
                            continue;
                        };
                        let values = values
                            .chunks_exact(2)
                            .map(|w| u16::from_be_bytes([w[0], w[1]]))
                            .collect();
                        ResponseKind::GetHoldings { values }
                    }
                    WRITE_SINGLE_REGISTER => {
                        let [a0, a1, v0, v1] = pdu else {
                            trace!(message = "malformed write response", transaction_id);
                            continue;
                        };
                        ResponseKind::SetHolding {
                            address: u16::from_be_bytes([*a0, *a1]),
                            value: u16::from_be_bytes([*v0, *v1]),
                        }
                    }
                    _ => {
                        trace!(message = "unsupported function code", function_code);
                        continue;
                    }
                }
            };
            return Ok(Some(Response { unit_id, transaction_id, kind }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(response) => Ok(Some(response)),
            None if src.is_empty() => Ok(None),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream closed with {} bytes of an incomplete frame", src.len()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> (Vec<Response>, usize) {
        let mut buffer = BytesMut::from(bytes);
        let mut responses = Vec::new();
        let mut codec = ModbusTcpCodec {};
        while let Some(response) = codec.decode(&mut buffer).unwrap() {
            responses.push(response);
        }
        (responses, buffer.len())
    }

    #[test]
    fn encodes_read_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            unit_id: 240,
            transaction_id: 0x0102,
            operation: Operation::GetHoldings { address: 57, count: 1 },
        };
        ModbusTcpCodec {}.encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[1, 2, 0, 0, 0, 6, 240, 3, 0, 57, 0, 1]);
    }

    #[test]
    fn encodes_write_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            unit_id: 240,
            transaction_id: 7,
            operation: Operation::SetHolding { address: 0, value: 0x0300 },
        };
        ModbusTcpCodec {}.encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 7, 0, 0, 0, 6, 240, 6, 0, 0, 3, 0]);
    }

    #[test]
    fn decodes_read_response() {
        let (responses, rest) = decode_all(&[0, 9, 0, 0, 0, 5, 240, 3, 2, 0x13, 0x05]);
        assert_eq!(rest, 0);
        assert_eq!(
            responses,
            [Response {
                unit_id: 240,
                transaction_id: 9,
                kind: ResponseKind::GetHoldings { values: vec![0x1305] },
            }]
        );
    }

    #[test]
    fn decodes_empty_read_response() {
        let (responses, _) = decode_all(&[0, 1, 0, 0, 0, 3, 240, 3, 0]);
        assert_eq!(responses[0].kind, ResponseKind::GetHoldings { values: vec![] });
    }

    #[test]
    fn decodes_write_echo_and_exception() {
        let (responses, rest) = decode_all(&[
            0, 1, 0, 0, 0, 6, 240, 6, 0, 0, 7, 0, //
            0, 2, 0, 0, 0, 3, 240, 0x83, 2,
        ]);
        assert_eq!(rest, 0);
        assert_eq!(responses[0].kind, ResponseKind::SetHolding { address: 0, value: 0x0700 });
        assert_eq!(responses[1].transaction_id, 2);
        assert_eq!(responses[1].kind, ResponseKind::Exception(2));
    }

    #[test]
    fn waits_for_complete_frame() {
        let frame = [0, 4, 0, 0, 0, 5, 240, 3, 2, 0x01, 0x00];
        let mut codec = ModbusTcpCodec {};
        let mut buffer = BytesMut::from(&frame[..8]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&frame[8..]);
        let response = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![0x0100] });
    }

    #[test]
    fn skips_garbage_before_frame() {
        let (responses, rest) = decode_all(&[0xFF, 0xFF, 0, 3, 0, 0, 0, 5, 240, 3, 2, 0, 1]);
        assert_eq!(rest, 0);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].transaction_id, 3);
    }

    #[test]
    fn truncated_frame_at_eof_is_unexpected_eof() {
        let mut codec = ModbusTcpCodec {};
        let mut buffer = BytesMut::from(&[0, 4, 0, 0, 0, 5, 240, 3][..]);
        let error = codec.decode_eof(&mut buffer).unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);

        let mut empty = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut empty).unwrap(), None);

        let mut complete = BytesMut::from(&[0, 4, 0, 0, 0, 5, 240, 3, 2, 0, 7][..]);
        let response = codec.decode_eof(&mut complete).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![7] });
    }
}
