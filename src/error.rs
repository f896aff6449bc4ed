//! Fatal error types
//!
//! Most of the crate propagates `anyhow::Error`; the conditions below are
//! typed so the operator sees a precise message and callers can match on them.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutotestError {
    #[error("result server address {addr} is already in use (is another redgreen running?)")]
    AddressInUse {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_in_use_message() {
        let err = AutotestError::AddressInUse {
            addr: "127.0.0.1:41234".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };

        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:41234"));
        assert!(msg.contains("already in use"));
    }

    #[test]
    fn test_invalid_pattern_keeps_source() {
        let source = regex::Regex::new("(").unwrap_err();
        let err = AutotestError::InvalidPattern {
            pattern: "(".to_string(),
            source,
        };

        assert!(err.to_string().contains("'('"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
