/// Tor v3 onion service addresses
///
/// The address is `base32(pubkey || checksum || version)` where the checksum
/// is the first two bytes of `SHA3-256(".onion checksum" || pubkey || version)`.
use sha3::{Digest, Sha3_256};
use std::fmt;

const ONION_VERSION: u8 = 0x03;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const ONION_SUFFIX: &str = ".onion";

/// Length of the encoded service id, without the `.onion` suffix
pub const SERVICE_ID_LEN: usize = 56;

/// A v3 onion address (e.g. "xyz...abc.onion")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnionAddress([u8; 32]);

impl OnionAddress {
    /// Create an onion address from an ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get the public key bytes embedded in the address
    pub fn public_key(&self) -> &[u8; 32] {
        &self.0
    }

    /// The 56 character service id, as reported by Tor's `ServiceID`
    pub fn service_id(&self) -> String {
        let mut raw = [0u8; 35];
        raw[..32].copy_from_slice(&self.0);
        raw[32..34].copy_from_slice(&checksum(&self.0));
        raw[34] = ONION_VERSION;
        data_encoding::BASE32_NOPAD.encode(&raw).to_lowercase()
    }

    /// Convert to .onion hostname
    pub fn to_hostname(&self) -> String {
        format!("{}{}", self.service_id(), ONION_SUFFIX)
    }

    /// Parse from hostname (with or without .onion suffix)
    pub fn from_hostname(hostname: &str) -> Result<Self, OnionAddressError> {
        let hostname = hostname.trim().to_lowercase();
        let id = hostname.strip_suffix(ONION_SUFFIX).unwrap_or(&hostname);

        if id.len() != SERVICE_ID_LEN {
            return Err(OnionAddressError::InvalidLength(id.len()));
        }

        let raw = data_encoding::BASE32_NOPAD
            .decode(id.to_uppercase().as_bytes())
            .map_err(|_| OnionAddressError::InvalidEncoding)?;

        if raw[34] != ONION_VERSION {
            return Err(OnionAddressError::UnsupportedVersion(raw[34]));
        }

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&raw[..32]);
        if raw[32..34] != checksum(&public_key) {
            return Err(OnionAddressError::InvalidChecksum);
        }

        Ok(Self(public_key))
    }

    /// Check if a hostname is a .onion address
    pub fn is_onion_address(hostname: &str) -> bool {
        hostname.trim().to_lowercase().ends_with(ONION_SUFFIX)
    }

    /// Verify that this address matches the given public key
    pub fn verify_public_key(&self, public_key: &[u8; 32]) -> bool {
        &self.0 == public_key
    }
}

fn checksum(public_key: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(public_key);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hostname())
    }
}

/// Onion address errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OnionAddressError {
    #[error("Invalid base32 encoding")]
    InvalidEncoding,

    #[error("Invalid service id length: {0} (expected 56)")]
    InvalidLength(usize),

    #[error("Unsupported onion version: {0}")]
    UnsupportedVersion(u8),

    #[error("Onion address checksum mismatch")]
    InvalidChecksum,
}
