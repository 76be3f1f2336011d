//! Sorting transport failures into the ones that a fresh connection is likely to fix and the rest.

use std::io::ErrorKind;

/// What went wrong underneath a failed Modbus request, as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FailureKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    HostUnreachable,
    HostDown,
    NetworkUnreachable,
    NetworkDown,
    NotConnected,
    /// The stream was shut down, closed by the peer or the pipe broke.
    Shutdown,
    WouldBlock,
    /// The device answered with a Modbus exception.
    Exception,
    /// The device answered with something that does not match the request.
    Protocol,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Classification {
    /// Network-level trouble. Worth reconnecting over.
    Transient,
    Other,
}

const TRANSIENT: &[FailureKind] = &[
    FailureKind::Timeout,
    FailureKind::ConnectionReset,
    FailureKind::ConnectionRefused,
    FailureKind::ConnectionAborted,
    FailureKind::HostUnreachable,
    FailureKind::HostDown,
    FailureKind::NetworkUnreachable,
    FailureKind::NetworkDown,
    FailureKind::NotConnected,
    FailureKind::Shutdown,
    FailureKind::WouldBlock,
];

pub fn classify(kind: FailureKind) -> Classification {
    if TRANSIENT.contains(&kind) { Classification::Transient } else { Classification::Other }
}

/// Socket errors that `std` does not give an [`ErrorKind`] of their own.
#[cfg(unix)]
fn from_raw_os_error(code: i32) -> Option<FailureKind> {
    match code {
        libc::EHOSTDOWN => Some(FailureKind::HostDown),
        libc::ENETRESET => Some(FailureKind::ConnectionReset),
        libc::ESHUTDOWN => Some(FailureKind::Shutdown),
        _ => None,
    }
}

#[cfg(not(unix))]
fn from_raw_os_error(_: i32) -> Option<FailureKind> {
    None
}

impl From<&std::io::Error> for FailureKind {
    fn from(error: &std::io::Error) -> Self {
        if let Some(kind) = error.raw_os_error().and_then(from_raw_os_error) {
            return kind;
        }
        match error.kind() {
            ErrorKind::TimedOut => FailureKind::Timeout,
            ErrorKind::ConnectionReset => FailureKind::ConnectionReset,
            ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
            ErrorKind::ConnectionAborted => FailureKind::ConnectionAborted,
            ErrorKind::HostUnreachable => FailureKind::HostUnreachable,
            ErrorKind::NetworkUnreachable => FailureKind::NetworkUnreachable,
            ErrorKind::NetworkDown => FailureKind::NetworkDown,
            ErrorKind::NotConnected => FailureKind::NotConnected,
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => FailureKind::Shutdown,
            ErrorKind::WouldBlock => FailureKind::WouldBlock,
            ErrorKind::InvalidData => FailureKind::Protocol,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_conditions_are_transient() {
        for kind in [
            ErrorKind::TimedOut,
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionRefused,
            ErrorKind::ConnectionAborted,
            ErrorKind::HostUnreachable,
            ErrorKind::NetworkUnreachable,
            ErrorKind::NetworkDown,
            ErrorKind::NotConnected,
            ErrorKind::BrokenPipe,
            ErrorKind::WouldBlock,
        ] {
            let error = std::io::Error::from(kind);
            assert_eq!(classify(FailureKind::from(&error)), Classification::Transient, "{kind:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn uncategorized_socket_errors_are_transient() {
        for (code, expected) in [
            (libc::EHOSTDOWN, FailureKind::HostDown),
            (libc::ENETRESET, FailureKind::ConnectionReset),
            (libc::ESHUTDOWN, FailureKind::Shutdown),
        ] {
            let error = std::io::Error::from_raw_os_error(code);
            assert_eq!(FailureKind::from(&error), expected, "{error}");
            assert_eq!(classify(FailureKind::from(&error)), Classification::Transient, "{error}");
        }
        let denied = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(classify(FailureKind::from(&denied)), Classification::Other);
    }

    #[test]
    fn everything_else_is_not() {
        for kind in [ErrorKind::PermissionDenied, ErrorKind::InvalidData, ErrorKind::Other] {
            let error = std::io::Error::from(kind);
            assert_eq!(classify(FailureKind::from(&error)), Classification::Other, "{kind:?}");
        }
        assert_eq!(classify(FailureKind::Exception), Classification::Other);
        assert_eq!(classify(FailureKind::Protocol), Classification::Other);
    }
}
