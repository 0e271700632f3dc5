//! Peer Identity
//!
//! A node is identified by its (host, port) pair. Identities are compared
//! and hashed by value so that reconstructed identities match stale ones.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest host name accepted in a peer identity
pub const MAX_HOST_LEN: usize = 255;

/// Immutable (host, port) pair identifying a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    /// Create a new identity
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Socket address string for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that the identity can be encoded into a staged key.
    ///
    /// Hosts are restricted to printable ASCII so the staging marker and
    /// separator bytes can never appear inside an encoded identity.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("peer host cannot be empty".into()));
        }
        if self.host.len() > MAX_HOST_LEN {
            return Err(Error::Config(format!(
                "peer host longer than {} bytes: {}",
                MAX_HOST_LEN, self.host
            )));
        }
        if !self.host.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::Config(format!(
                "peer host must be printable ASCII: {:?}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("peer {} has port 0", self.host)));
        }
        Ok(())
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("peer address must be host:port: {}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid port in {}: {}", s, e)))?;
        let identity = PeerIdentity::new(host, port);
        identity.validate()?;
        Ok(identity)
    }
}
