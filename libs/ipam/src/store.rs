// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Durable key-value blob persistence.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Errors returned by persistent stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying medium failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored content could not be decoded.
    #[error("malformed store content: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The stored content decoded but described an invalid state.
    #[error("invalid persisted state: {0}")]
    InvalidState(#[source] anyhow::Error),
}

/// A durable store of opaque blobs, keyed by namespace.
///
/// Consumers must not interpret the stored blobs.
#[cfg_attr(test, automock)]
pub trait KeyValueStore: Send + Sync {
    /// Reads the blob stored under `key`, if any.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the blob stored under `key`.
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// A [KeyValueStore] backed by a single JSON file.
///
/// The file holds one JSON object with a member per namespace key; blobs must
/// therefore themselves be valid JSON. A missing file reads as empty.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store backed by the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(buf) => serde_json::from_slice(&buf).map_err(StoreError::Malformed),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.load()?;
        match entries.get(key) {
            Some(value) => Ok(Some(
                serde_json::to_vec(value).map_err(StoreError::Malformed)?,
            )),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let blob: serde_json::Value =
            serde_json::from_slice(value).map_err(StoreError::Malformed)?;

        let mut entries = self.load()?;
        entries.insert(key.to_string(), blob);

        let buf = serde_json::to_vec_pretty(&entries).map_err(StoreError::Malformed)?;
        std::fs::write(&self.path, buf)?;
        Ok(())
    }
}

/// An in-memory [KeyValueStore], useful for tests and ephemeral managers.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
