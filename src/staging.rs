//! Staging Namespace Codec
//!
//! A staged record is a peer-tagged copy of a pending mutation, kept in the
//! local store until that peer has committed it. Staged keys are laid out as:
//!
//! ```text
//! 0xFF 's' 0xFF | port: 5 ASCII digits | host length: 3 ASCII digits | host | 0xFF | key
//! ```
//!
//! Ports and lengths are ASCII digits and hosts are printable ASCII, as
//! enforced by `PeerIdentity::validate`, so the `0xFF` marker and separator
//! bytes never occur inside an encoded identity.

use serde::{Deserialize, Serialize};

use crate::cluster::{PeerIdentity, MAX_HOST_LEN};
use crate::error::{Error, Result};
use crate::store::Mutation;

/// Prefix of every staged key
pub const STAGING_MARKER: &[u8] = b"\xffs\xff";

/// Byte between the encoded identity and the original key
pub const SEPARATOR: u8 = 0xff;

const PORT_WIDTH: usize = 5;
const HOST_LEN_WIDTH: usize = 3;

/// Check whether a key lives in the staging namespace
pub fn is_staged(key: &[u8]) -> bool {
    key.starts_with(STAGING_MARKER)
}

/// Prefix shared by every staged key of one peer
pub fn peer_prefix(peer: &PeerIdentity) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(STAGING_MARKER.len() + PORT_WIDTH + HOST_LEN_WIDTH + peer.host.len() + 1);
    out.extend_from_slice(STAGING_MARKER);
    out.extend_from_slice(format!("{:05}{:03}", peer.port, peer.host.len()).as_bytes());
    out.extend_from_slice(peer.host.as_bytes());
    out.push(SEPARATOR);
    out
}

/// Staged key for `key` tagged with `peer`
pub fn encode(peer: &PeerIdentity, key: &[u8]) -> Vec<u8> {
    let mut out = peer_prefix(peer);
    out.extend_from_slice(key);
    out
}

/// Split a staged key into its peer tag and original key
pub fn decode(staged: &[u8]) -> Result<(PeerIdentity, Vec<u8>)> {
    let invalid = |reason: &str| Error::InvalidStagedKey(reason.to_string());

    let rest = staged
        .strip_prefix(STAGING_MARKER)
        .ok_or_else(|| invalid("missing staging marker"))?;
    if rest.len() < PORT_WIDTH + HOST_LEN_WIDTH {
        return Err(invalid("truncated header"));
    }

    let (port, rest) = rest.split_at(PORT_WIDTH);
    let (host_len, rest) = rest.split_at(HOST_LEN_WIDTH);
    let port: u16 = parse_digits(port)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| invalid("bad port"))?;
    let host_len = parse_digits(host_len)
        .filter(|len| *len <= MAX_HOST_LEN)
        .ok_or_else(|| invalid("bad host length"))?;

    if rest.len() < host_len + 1 {
        return Err(invalid("truncated host"));
    }
    let (host, rest) = rest.split_at(host_len);
    let host = std::str::from_utf8(host).map_err(|_| invalid("host is not UTF-8"))?;
    let key = match rest.split_first() {
        Some((&SEPARATOR, key)) => key,
        _ => return Err(invalid("missing separator")),
    };

    Ok((PeerIdentity::new(host, port), key.to_vec()))
}

fn parse_digits(bytes: &[u8]) -> Option<usize> {
    if !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Scan bounds covering every staged key of one peer
pub fn peer_range(peer: &PeerIdentity) -> (Vec<u8>, Option<Vec<u8>>) {
    let lower = peer_prefix(peer);
    let upper = prefix_end(&lower);
    (lower, upper)
}

/// Payload stored under a staged key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagedValue {
    Put(Vec<u8>),
    Delete,
}

impl StagedValue {
    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Rebuild the mutation this record stages
    pub fn into_mutation(self, key: Vec<u8>) -> Mutation {
        match self {
            StagedValue::Put(value) => Mutation::Put { key, value },
            StagedValue::Delete => Mutation::Delete { key },
        }
    }
}

impl From<&Mutation> for StagedValue {
    fn from(m: &Mutation) -> Self {
        match m {
            Mutation::Put { value, .. } => StagedValue::Put(value.clone()),
            Mutation::Delete { .. } => StagedValue::Delete,
        }
    }
}

/// Staged copies of `mutations` tagged with `peer`
pub fn stage(peer: &PeerIdentity, mutations: &[Mutation]) -> Result<Vec<Mutation>> {
    mutations
        .iter()
        .map(|m| {
            Ok(Mutation::Put {
                key: encode(peer, m.key()),
                value: StagedValue::from(m).encode()?,
            })
        })
        .collect()
}

/// Deletes of the staged records of `keys` tagged with `peer`
pub fn unstage<'a>(
    peer: &PeerIdentity,
    keys: impl IntoIterator<Item = &'a [u8]>,
) -> Vec<Mutation> {
    keys.into_iter()
        .map(|key| Mutation::Delete {
            key: encode(peer, key),
        })
        .collect()
}
