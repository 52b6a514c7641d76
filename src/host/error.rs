use std::fmt;

use snafu::Snafu;

/// Outcome of a failed dial or ADD_PROVIDER exchange, as reported by the
/// DHT host.
///
/// Only [`DialError::is_transient`] outcomes are retried within a single
/// probe; everything else terminates the attempt loop.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum DialError {
    #[snafu(display("connection refused"))]
    ConnectionRefused,

    #[snafu(display("stream reset"))]
    StreamReset,

    #[snafu(display("dial timed out"))]
    Timeout,

    #[snafu(display("peer unreachable"))]
    PeerUnreachable,

    #[snafu(display("protocol not supported"))]
    ProtocolNotSupported,

    #[snafu(display("dial cancelled"))]
    Cancelled,

    #[snafu(display("dial failed: {message}"))]
    Other { message: String },
}

impl DialError {
    /// Worth another attempt within the same probe.
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::ConnectionRefused | DialError::StreamReset)
    }
}

/// Connection-error tag persisted with every holder probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    None,
    ConnectionRefused,
    StreamReset,
    Timeout,
    PeerUnreachable,
    ProtocolNotSupported,
    Cancelled,
    Unknown,
}

impl ConnError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnError::None => "none",
            ConnError::ConnectionRefused => "connection refused",
            ConnError::StreamReset => "stream reset",
            ConnError::Timeout => "timeout",
            ConnError::PeerUnreachable => "peer unreachable",
            ConnError::ProtocolNotSupported => "protocol not supported",
            ConnError::Cancelled => "cancelled",
            ConnError::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&DialError> for ConnError {
    fn from(err: &DialError) -> Self {
        match err {
            DialError::ConnectionRefused => ConnError::ConnectionRefused,
            DialError::StreamReset => ConnError::StreamReset,
            DialError::Timeout => ConnError::Timeout,
            DialError::PeerUnreachable => ConnError::PeerUnreachable,
            DialError::ProtocolNotSupported => ConnError::ProtocolNotSupported,
            DialError::Cancelled => ConnError::Cancelled,
            DialError::Other { .. } => ConnError::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_refused_and_reset_are_transient() {
        assert!(DialError::ConnectionRefused.is_transient());
        assert!(DialError::StreamReset.is_transient());
        assert!(!DialError::Timeout.is_transient());
        assert!(!DialError::PeerUnreachable.is_transient());
        assert!(!DialError::ProtocolNotSupported.is_transient());
        assert!(
            !DialError::Other {
                message: "weird".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn conn_error_tags_round_trip_from_dial_errors() {
        assert_eq!(
            ConnError::from(&DialError::ConnectionRefused),
            ConnError::ConnectionRefused
        );
        assert_eq!(ConnError::from(&DialError::StreamReset), ConnError::StreamReset);
        assert_eq!(
            ConnError::from(&DialError::Other {
                message: "mystery".into()
            }),
            ConnError::Unknown
        );
    }
}
