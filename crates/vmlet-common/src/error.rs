//! Error types for vmlet configuration handling

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for configuration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for vmlet configuration
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_message() {
        let err = Error::configuration("pool 'x' has a relative path");
        assert_eq!(
            err.to_string(),
            "configuration error: pool 'x' has a relative path"
        );
    }
}
