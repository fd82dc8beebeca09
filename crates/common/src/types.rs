use http::uri::Authority;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid backend address {addr:?}: {reason}")]
    Invalid { addr: String, reason: String },
    #[error("backend address {0:?} is missing a port")]
    MissingPort(String),
}

/// Plain `host:port` address of the backing database
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendAddr(Authority);

impl BackendAddr {
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        let authority = Authority::from_str(addr.trim()).map_err(|err| AddressError::Invalid {
            addr: addr.to_string(),
            reason: err.to_string(),
        })?;
        if authority.port_u16().is_none() {
            return Err(AddressError::MissingPort(addr.to_string()));
        }
        Ok(Self(authority))
    }

    pub fn host(&self) -> &str {
        self.0.host()
    }

    pub fn port(&self) -> u16 {
        // Checked in `parse`, the only constructor
        self.0.port_u16().unwrap_or_default()
    }

    pub fn authority(&self) -> &Authority {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendAddr({})", self.0)
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackendAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BackendAddr {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BackendAddr> for String {
    fn from(value: BackendAddr) -> Self {
        value.0.as_str().to_string()
    }
}
