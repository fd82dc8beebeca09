pub mod gateway;
pub mod identity;
pub mod relay;

pub use identity::{OnionAddress, OnionAddressError, ServiceIdentity};

// Re-export gateway types
pub use gateway::{
    Gateway, LocalGateway, LocalTransport, OnionListener, TorGateway, TorTransport, Transport,
};

// Re-export relay types
pub use relay::{
    ForwardError, Forwarder, HandleRequest, RelayBody, RelayConfig, RelayService, RelayState,
};
