/// torfluxdb daemon library
///
/// Command line handling, key provisioning and the run loop of the
/// `torfluxdb` binary.
pub mod app;
pub mod cli;
pub mod keys;

pub use app::run;
pub use cli::Cli;
pub use keys::{configured_key, key_banner, load_identity};
