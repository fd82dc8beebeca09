use torfluxdb_common::{protocol::ONION_KEY_ENV, IdentityError};
use torfluxdb_core::ServiceIdentity;
use tracing::info;

const RULE_WIDTH: usize = 148;

/// The onion key from the environment
///
/// Only read from `TORFLUXDB_ONIONKEY`, never from flags, so the key stays
/// out of process listings.
pub fn configured_key() -> Option<String> {
    std::env::var(ONION_KEY_ENV).ok()
}

/// Decode the configured onion key, or generate a new one when none is set
pub fn load_identity(raw: Option<&str>) -> Result<ServiceIdentity, IdentityError> {
    if raw.map_or(true, |key| key.trim().is_empty()) {
        info!(
            "No pre-configured private key ({}), generating a new one...",
            ONION_KEY_ENV
        );
    }
    ServiceIdentity::derive_or_generate(raw)
}

/// Warning banner carrying the private key, shown with `--printkey`
pub fn key_banner(identity: &ServiceIdentity) -> Vec<String> {
    let rule = "-".repeat(RULE_WIDTH);
    vec![
        rule.clone(),
        format!("Your private key is {}", identity.secret_hex().as_str()),
        format!(
            "This key permits you to restart your service with the same Tor onion URL by setting the {ONION_KEY_ENV} environmental variable."
        ),
        "WARNING: Anyone getting hold of your key will also be able to impersonate your server, so protect it like your house keys!".to_string(),
        rule,
    ]
}
