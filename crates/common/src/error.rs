use std::time::Duration;
use thiserror::Error;

/// Errors raised while decoding or generating the onion service key
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid private key length: have {actual}, want {expected}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Failed to decode private key: {0}")]
    Decode(#[from] hex::FromHexError),
}

/// Errors reported by an anonymity-network gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to spawn gateway process: {0}")]
    Spawn(std::io::Error),

    #[error("Control port unavailable: {0}")]
    ControlPort(String),

    #[error("Control port authentication failed: {0}")]
    Authentication(String),

    #[error("Gateway replied {code}: {message}")]
    Protocol { code: u16, message: String },

    #[error("Gateway exited: {0}")]
    Exited(String),

    #[error("Onion service id mismatch: expected {expected}, gateway reported {actual}")]
    AddressMismatch { expected: String, actual: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn control_port(msg: impl Into<String>) -> Self {
        Self::ControlPort(msg.into())
    }

    pub fn exited(msg: impl Into<String>) -> Self {
        Self::Exited(msg.into())
    }
}

/// Lifecycle errors of the relay service
///
/// Every variant is fatal to the service. Per-request forwarding failures
/// never surface here, they are answered with a 500 on the affected request.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to start gateway: {0}")]
    GatewayStart(#[source] GatewayError),

    #[error("Failed to create onion listener: {0}")]
    Listen(#[source] GatewayError),

    #[error("Bootstrap did not complete within {0:?}")]
    BootstrapTimeout(Duration),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Gateway terminated: {0}")]
    GatewayTerminated(String),

    #[error("Relay shut down")]
    Shutdown,

    #[error("Relay already closed")]
    Closed,
}

impl RelayError {
    /// True when serving stopped because the owner asked it to
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// True for errors raised before the relay started serving
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::GatewayStart(_) | Self::Listen(_) | Self::BootstrapTimeout(_)
        )
    }
}

/// Result type for relay lifecycle operations
pub type Result<T> = std::result::Result<T, RelayError>;
