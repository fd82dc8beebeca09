/// Onion service identity
///
/// The service key is supplied by the operator or generated at startup and
/// deterministically yields the public `.onion` address.
mod address;
mod keypair;

pub use address::{OnionAddress, OnionAddressError, SERVICE_ID_LEN};
pub use keypair::{ServiceIdentity, SECRET_KEY_LEN};
