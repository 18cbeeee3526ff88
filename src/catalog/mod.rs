//! The catalog layout's index: one JSON document per store recording where
//! every live value sits in the segment address space.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{fs::StoreDir, retry::RetryPolicy};

pub(crate) mod engine;

pub const CATALOG_VERSION: u32 = 1;

const CATALOG_FILE: &str = "catalog.json";
const CATALOG_TMP: &str = "catalog.json.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub key: String,
    pub size: u64,
    pub start: u64,
}

impl CatalogEntry {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub version: u32,
    /// Offset the next value is appended at.
    pub next_byte: u64,
    /// Block size buffers are allocated in.
    pub segment_size: u64,
    /// Capacity of one segment file.
    pub log_size: u64,
    pub map: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new(segment_size: u64, log_size: u64) -> Self {
        Catalog {
            version: CATALOG_VERSION,
            next_byte: 0,
            segment_size,
            log_size,
            map: BTreeMap::new(),
        }
    }

    pub fn is_file(name: &str) -> bool {
        name == CATALOG_FILE || name == CATALOG_TMP
    }

    /// Loads the catalog from `dir`, returning `None` if it doesn't exist,
    /// can't be parsed, or was written by another format version. Callers
    /// then start a fresh store.
    pub async fn load<D>(dir: &D) -> Option<Self>
    where
        D: StoreDir,
    {
        let contents = match dir.read(CATALOG_FILE).await {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "catalog unreadable, starting over");
                return None;
            }
        };
        let catalog: Catalog = match serde_json::from_slice(&contents) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, "catalog corrupt, starting over");
                return None;
            }
        };
        if catalog.version != CATALOG_VERSION {
            warn!(
                found = catalog.version,
                expected = CATALOG_VERSION,
                "catalog version mismatch, starting over"
            );
            return None;
        }
        if catalog.log_size == 0 {
            warn!("catalog has zero segment size, starting over");
            return None;
        }
        Some(catalog)
    }

    /// Writes the catalog next to its final name and renames it into place,
    /// so a torn write is never mistaken for a valid catalog.
    pub async fn persist<D>(&self, dir: &D, retry: &RetryPolicy) -> anyhow::Result<()>
    where
        D: StoreDir,
    {
        let encoded = serde_json::to_vec(self).context("encoding catalog")?;
        let encoded = encoded.as_slice();
        retry
            .run("catalog write", move || dir.write(CATALOG_TMP, encoded))
            .await?;
        retry
            .run("catalog rename", move || dir.rename(CATALOG_TMP, CATALOG_FILE))
            .await
    }

    /// Reserves `size` bytes at the write cursor for `key`, superseding any
    /// earlier entry.
    pub fn put(&mut self, key: &str, size: u64) -> CatalogEntry {
        let entry = CatalogEntry {
            key: key.to_owned(),
            size,
            start: self.next_byte,
        };
        self.next_byte += size;
        self.map.insert(key.to_owned(), entry.clone());
        entry
    }

    pub fn delete(&mut self, key: &str) -> Option<CatalogEntry> {
        self.map.remove(key)
    }

    pub fn live_bytes(&self) -> u64 {
        self.map.values().map(|e| e.size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.next_byte
    }

    /// Live entries in the order they sit on disk.
    pub fn entries_by_offset(&self) -> Vec<&CatalogEntry> {
        let mut entries: Vec<_> = self.map.values().collect();
        entries.sort_by_key(|e| e.start);
        entries
    }
}
