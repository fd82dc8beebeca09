use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{hazmat::ExpandedSecretKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::fmt;
use torfluxdb_common::IdentityError;
use zeroize::Zeroizing;

use super::OnionAddress;

/// Length of an expanded ed25519 secret key as stored by Tor
pub const SECRET_KEY_LEN: usize = 64;

/// Long-term signing key of the onion service
///
/// Holds the key in Tor's expanded form: the clamped secret scalar followed
/// by the 32 byte hash prefix. The public key, and with it the onion address,
/// is derived once at construction.
#[derive(Clone)]
pub struct ServiceIdentity {
    secret: Zeroizing<[u8; SECRET_KEY_LEN]>,
    public: VerifyingKey,
}

impl ServiceIdentity {
    /// Decode the supplied hex key, or generate a fresh one when none is given
    ///
    /// Blank input counts as absent.
    pub fn derive_or_generate(raw: Option<&str>) -> Result<Self, IdentityError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Self::generate()),
            Some(hex_key) => Self::from_hex(hex_key),
        }
    }

    /// Generate a new random identity
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);

        let digest = Sha512::digest(&seed[..]);
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LEN]);
        secret.copy_from_slice(&digest);
        secret[0] &= 248;
        secret[31] &= 127;
        secret[31] |= 64;

        Self::from_expanded(secret)
    }

    /// Decode a hex encoded expanded secret key
    pub fn from_hex(hex_key: &str) -> Result<Self, IdentityError> {
        let blob = Zeroizing::new(hex::decode(hex_key)?);
        Self::from_secret_bytes(&blob)
    }

    /// Create an identity from expanded secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != SECRET_KEY_LEN {
            return Err(IdentityError::InvalidKeyLength {
                expected: SECRET_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LEN]);
        secret.copy_from_slice(bytes);
        Ok(Self::from_expanded(secret))
    }

    fn from_expanded(secret: Zeroizing<[u8; SECRET_KEY_LEN]>) -> Self {
        let expanded = ExpandedSecretKey::from_bytes(&secret);
        let public = VerifyingKey::from(&expanded);
        Self { secret, public }
    }

    /// The onion address this key publishes under
    pub fn public_address(&self) -> OnionAddress {
        OnionAddress::from_public_key(&self.public_bytes())
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Hex encoding of the secret key, suitable for `TORFLUXDB_ONIONKEY`
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.secret[..]))
    }

    /// Key blob in the form expected by the `ADD_ONION` control command
    pub fn tor_key_blob(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("ED25519-V3:{}", STANDARD.encode(&self.secret[..])))
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("address", &self.public_address().to_hostname())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
