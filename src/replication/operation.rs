//! Replicated Operations
//!
//! One client-visible mutation. Operations are immutable once created and
//! travel unchanged through the stage, quorum and commit phases.

use serde::{Deserialize, Serialize};

use crate::store::{Mutation, WriteOptions};

/// A client write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        options: WriteOptions,
    },
    Delete {
        key: Vec<u8>,
    },
    Batch {
        ops: Vec<Mutation>,
        options: WriteOptions,
    },
}

impl Operation {
    /// Put without options
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put {
            key: key.into(),
            value: value.into(),
            options: WriteOptions::default(),
        }
    }

    /// Delete a key
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Operation::Delete { key: key.into() }
    }

    /// Ordered batch without options
    pub fn batch(ops: Vec<Mutation>) -> Self {
        Operation::Batch {
            ops,
            options: WriteOptions::default(),
        }
    }

    /// The store mutations this operation expands to, in order
    pub fn mutations(&self) -> Vec<Mutation> {
        match self {
            Operation::Put { key, value, .. } => vec![Mutation::Put {
                key: key.clone(),
                value: value.clone(),
            }],
            Operation::Delete { key } => vec![Mutation::Delete { key: key.clone() }],
            Operation::Batch { ops, .. } => ops.clone(),
        }
    }

    /// Every key this operation touches
    pub fn keys(&self) -> Vec<&[u8]> {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => vec![key.as_slice()],
            Operation::Batch { ops, .. } => ops.iter().map(Mutation::key).collect(),
        }
    }

    /// Options carried by the operation
    pub fn options(&self) -> Option<&WriteOptions> {
        match self {
            Operation::Put { options, .. } | Operation::Batch { options, .. } => Some(options),
            Operation::Delete { .. } => None,
        }
    }

    /// Get the operation type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::Put { .. } => "put",
            Operation::Delete { .. } => "delete",
            Operation::Batch { .. } => "batch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_batch_expands_in_order() {
        let op = Operation::batch(vec![
            Mutation::put("b", "2"),
            Mutation::delete("a"),
            Mutation::put("c", "3"),
        ]);
        assert_eq!(op.keys(), vec![&b"b"[..], b"a", b"c"]);
        assert_eq!(op.mutations().len(), 3);
        assert_eq!(op.type_name(), "batch");
    }

    #[test]
    fn test_options() {
        let op = Operation::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            options: WriteOptions::with_ttl(Duration::from_secs(5)),
        };
        assert_eq!(op.options().and_then(|o| o.ttl), Some(Duration::from_secs(5)));
        assert!(Operation::delete("k").options().is_none());
    }

    #[test]
    fn test_wire_roundtrip_preserves_options() {
        let op = Operation::Batch {
            ops: vec![Mutation::put("k", "v")],
            options: WriteOptions::with_ttl(Duration::from_millis(1500)),
        };
        let bytes = bincode::serialize(&op).unwrap();
        let restored: Operation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, op);
    }
}
