//! Ordered key/value interface.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::StoreResult;

/// One write in a crank's batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvWrite {
    /// Set `key` to `value`
    Set { key: String, value: String },
    /// Remove `key`
    Delete { key: String },
}

impl KvWrite {
    /// Build a write from an optional value (`None` deletes).
    pub fn from_pair(key: String, value: Option<String>) -> Self {
        match value {
            Some(value) => KvWrite::Set { key, value },
            None => KvWrite::Delete { key },
        }
    }

    /// The key this write touches.
    pub fn key(&self) -> &str {
        match self {
            KvWrite::Set { key, .. } | KvWrite::Delete { key } => key,
        }
    }
}

/// Ordered key/value storage.
pub trait KvStore {
    /// Read a key.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a key.
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a key (absent keys are not an error).
    fn delete(&mut self, key: &str) -> StoreResult<()>;

    /// The smallest key strictly greater than `prior_key`.
    fn get_next_key(&self, prior_key: &str) -> StoreResult<Option<String>>;

    /// Whether a key is present.
    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply a crank's writes in order.
    ///
    /// Backends with real transactions should override this so the whole
    /// batch lands atomically.
    fn commit_batch(&mut self, writes: &[KvWrite]) -> StoreResult<()> {
        for write in writes {
            match write {
                KvWrite::Set { key, value } => self.set(key, value)?,
                KvWrite::Delete { key } => self.delete(key)?,
            }
        }
        Ok(())
    }

    /// All keys starting with `prefix`, in order.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = String::from(prefix);
        if self.has(prefix)? {
            keys.push(String::from(prefix));
        }
        while let Some(next) = self.get_next_key(&cursor)? {
            if !next.starts_with(prefix) {
                break;
            }
            cursor = next.clone();
            keys.push(next);
        }
        Ok(keys)
    }
}
