//! Error taxonomy for the session engine.
//!
//! Transport failures, protocol violations, authentication failures and
//! timeouts are all terminal for the operation that produced them. Stream
//! Management accounting problems are not errors; they are reported as
//! [`IntegrityViolation`](super::stream_management::IntegrityViolation) events.

use std::time::Duration;
use thiserror::Error;

use super::element::QName;
use super::packet::{SaslFailure, StanzaError, StreamErrorInfo};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to resolve XMPP server: {0}")]
    Resolve(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("authentication failed: {0}")]
    Authentication(SaslFailure),

    #[error("no response to {what} within {}s", after.as_secs_f32())]
    Timeout { what: String, after: Duration },

    #[error("connection closed")]
    Closed,

    #[error("request rejected: {0}")]
    Stanza(StanzaError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Timeouts and closed connections may succeed when retried on a fresh
    /// request or connection; everything else reflects a definite answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Closed)
    }
}

/// A negotiation step received something other than what it asked for.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("expected {expected}, received {received}")]
    UnexpectedElement {
        expected: &'static str,
        received: QName,
    },

    #[error("unsupported element {0}")]
    UnknownElement(QName),

    #[error("malformed element: {0}")]
    Malformed(String),

    #[error("server does not offer {0}")]
    MissingFeature(&'static str),

    #[error("stream error from server: {0}")]
    StreamError(StreamErrorInfo),

    #[error("stream closed by server during negotiation")]
    StreamClosed,

    #[error("incoming element exceeds {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("reply {received} does not answer request {expected}")]
    MismatchedId { expected: String, received: String },
}

/// Failures raised while turning bytes into envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Eof,

    #[error("unsupported element {0}")]
    Unexpected(QName),

    #[error("malformed element: {0}")]
    Malformed(String),

    /// A complete top-level element that could not be turned into a packet.
    /// `name` is `None` when the element itself did not parse.
    #[error("invalid stanza: {detail}")]
    InvalidStanza { name: Option<QName>, detail: String },

    /// Bytes that cannot be XML however much more input arrives.
    #[error("stream is not well-formed: {0}")]
    NotWellFormed(String),

    #[error("incoming element exceeds {limit} bytes")]
    Overflow { limit: usize },
}

impl CodecError {
    /// Whether the pipeline can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::Unexpected(_) | CodecError::Malformed(_) | CodecError::InvalidStanza { .. }
        )
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Error::Io(e),
            CodecError::Eof => Error::Closed,
            CodecError::Unexpected(name) => ProtocolViolation::UnknownElement(name).into(),
            CodecError::Malformed(detail)
            | CodecError::InvalidStanza { detail, .. }
            | CodecError::NotWellFormed(detail) => ProtocolViolation::Malformed(detail).into(),
            CodecError::Overflow { limit } => ProtocolViolation::BufferOverflow { limit }.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        let err = Error::timeout("ping", Duration::from_secs(2));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn test_protocol_violation_is_not_retryable() {
        let err: Error = ProtocolViolation::MissingFeature("STARTTLS").into();
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "protocol violation: server does not offer STARTTLS"
        );
    }

    #[test]
    fn test_codec_eof_maps_to_closed() {
        let err: Error = CodecError::Eof.into();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_codec_recoverability() {
        assert!(CodecError::Unexpected(QName::new("urn:x", "y")).is_recoverable());
        assert!(CodecError::Malformed("bad".into()).is_recoverable());
        assert!(!CodecError::Eof.is_recoverable());
        assert!(!CodecError::Overflow { limit: 1 }.is_recoverable());
    }
}
