pub mod config;
pub mod error;
pub mod types;

pub use config::{protocol, ConfigError, DaemonConfig, TorConfig, TransportKind};
pub use error::{GatewayError, IdentityError, RelayError, Result};
pub use types::{AddressError, BackendAddr};
