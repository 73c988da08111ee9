//! Error types for the Gantry core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] gantry_config::ConfigError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("poller initialisation failed: {0}")]
    Poller(std::io::Error),

    #[error("signal handler installation failed: {0}")]
    Signals(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration mistakes exit 1; runtime failures exit 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::Bind { .. } => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let cfg_err = Error::Config(gantry_config::ConfigError::ParseError("x".into()));
        assert_eq!(cfg_err.exit_code(), 1);
        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(io_err.exit_code(), 2);
        let bind = Error::Bind {
            addr: "1.2.3.4:80".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(bind.exit_code(), 1);
        assert!(bind.to_string().contains("1.2.3.4:80"));
    }
}
