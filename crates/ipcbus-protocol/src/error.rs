//! Protocol errors.
//!
//! Every variant describes bytes that cannot be trusted: a connection that
//! produces one of these is closed.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet does not start with a separator (found 0x{found:02x})")]
    MissingSeparator { found: u8 },

    #[error("unknown packet tag 0x{tag:02x}")]
    UnknownTag { tag: u8 },

    #[error("invalid packet size {size}")]
    InvalidSize { size: usize },

    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("packet does not end with a separator")]
    MissingTrailer,

    #[error("packet truncated")]
    Truncated,

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },

    #[error("arrays nested deeper than {max} levels")]
    NestingTooDeep { max: usize },

    #[error("unknown command code {0}")]
    UnknownCommand(u32),

    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

impl CodecError {
    pub(crate) fn json(err: serde_json::Error) -> Self {
        Self::InvalidJson(err.to_string())
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodecError::UnknownTag { tag: 0x7a };
        assert_eq!(err.to_string(), "unknown packet tag 0x7a");

        let err = CodecError::PacketTooLarge {
            size: 2_000_000,
            max: 1_000_000,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
