/// Relay service
///
/// Accepts onion connections through a gateway and replays every request
/// against the backend over HTTP/1.1.
mod forward;
mod service;

#[cfg(test)]
mod tests;

pub use forward::{error_response, ForwardError, Forwarder, HandleRequest, RelayBody};
pub use service::{RelayConfig, RelayService, RelayState, GRACEFUL_SHUTDOWN_TIMEOUT};
