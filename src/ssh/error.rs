//! Bridge error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel {0} could not be resolved")]
    ChannelResolution(String),

    #[error("Forward setup failed: {0}")]
    ForwardEstablish(String),

    #[error("Relay helper startup failed: {0}")]
    RelayStartup(String),

    #[error("Relay helper I/O error: {0}")]
    SubprocessIo(String),

    #[error("Session broker error: {0}")]
    Broker(String),

    #[error("Host key error: {0}")]
    HostKey(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for BridgeError {
    fn from(err: russh::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for BridgeError {
    fn from(err: russh::keys::Error) -> Self {
        BridgeError::HostKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: BridgeError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(err.to_string(), "IO error: gone");
    }

    #[test]
    fn test_channel_resolution_message() {
        assert_eq!(
            BridgeError::ChannelResolution("7".into()).to_string(),
            "Channel 7 could not be resolved"
        );
    }
}
