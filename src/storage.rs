use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{event, Level};

use crate::error::{Error, Result};

/// Named tables of the key-value store.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// zero-padded sequence number -> message id
    Log,
    /// message id -> sequence number
    LogPosition,
    /// id -> object json
    Objects,
    /// "{message}\n{document}" -> ""
    MessageDocuments,
    /// "{document}\n{message}" -> ""
    DocumentMessages,
    /// document id -> "" for documents gc must keep
    Pinned,
    /// object id -> view message json
    Views,
    /// view message id -> "" once the view reached a server
    AnnouncedViews,
    Tombstones,
    Follows,
    Servers,
    Meta,
}

pub type Entry = (String, Vec<u8>);

///
/// The persistent key-value store the local index and the registry are
/// built on. Keys within a table are ordered bytewise so that range scans
/// double as cursors and prefix scans double as secondary indexes.
///
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, table: Table, key: &str) -> Result<()>;
    /// All entries whose key starts with `prefix`, ascending.
    async fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>>;
    ///
    /// Up to `limit` entries with keys strictly below `before` (or from the
    /// end when `None`), in descending key order.
    ///
    async fn scan_before(&self, table: Table, before: Option<&str>, limit: usize)
        -> Result<Vec<Entry>>;
}

type Tables = BTreeMap<Table, BTreeMap<String, Vec<u8>>>;

fn scan_prefix_in(tables: &Tables, table: Table, prefix: &str) -> Vec<Entry> {
    match tables.get(&table) {
        Some(rows) => rows
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        None => vec![],
    }
}

fn scan_before_in(tables: &Tables, table: Table, before: Option<&str>, limit: usize) -> Vec<Entry> {
    let rows = match tables.get(&table) {
        Some(rows) => rows,
        None => return vec![],
    };
    let iter: Box<dyn DoubleEndedIterator<Item = (&String, &Vec<u8>)>> = match before {
        Some(before) => Box::new(rows.range(..before.to_string())),
        None => Box::new(rows.iter()),
    };
    iter.rev()
        .take(limit)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// In-memory store, the default for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>> {
        let tables = self.tables.read().await;
        Ok(scan_prefix_in(&tables, table, prefix))
    }

    async fn scan_before(
        &self,
        table: Table,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let tables = self.tables.read().await;
        Ok(scan_before_in(&tables, table, before, limit))
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotTable {
    table: Table,
    rows: BTreeMap<String, String>,
}

///
/// A `MemoryStore` that writes a JSON snapshot of itself to disk after every
/// mutation. Values are hex encoded in the snapshot.
///
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<FileStore> {
        let mut tables = Tables::new();
        if path.exists() {
            let data = std::fs::read(path)?;
            let snapshot: Vec<SnapshotTable> = serde_json::from_slice(&data)?;
            for entry in snapshot {
                let decoded = tables.entry(entry.table).or_default();
                for (key, value) in entry.rows {
                    let value = hex::decode(value).map_err(|err| Error::Storage(err.to_string()))?;
                    decoded.insert(key, value);
                }
            }
            event!(Level::INFO, "loaded store from {}", path.display());
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(FileStore {
            path: path.to_path_buf(),
            tables: RwLock::new(tables),
        })
    }

    fn write(&self, tables: &Tables) -> Result<()> {
        let snapshot: Vec<SnapshotTable> = tables
            .iter()
            .map(|(table, rows)| SnapshotTable {
                table: *table,
                rows: rows
                    .iter()
                    .map(|(key, value)| (key.clone(), hex::encode(value)))
                    .collect(),
            })
            .collect();
        let serialized = serde_json::to_vec(&snapshot)?;
        // write then rename so a crash never leaves half a snapshot behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table)
            .or_default()
            .insert(key.to_string(), value);
        self.write(&tables)
    }

    async fn delete(&self, table: Table, key: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let removed = match tables.get_mut(&table) {
            Some(rows) => rows.remove(key).is_some(),
            None => false,
        };
        if removed {
            self.write(&tables)?;
        }
        Ok(())
    }

    async fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>> {
        let tables = self.tables.read().await;
        Ok(scan_prefix_in(&tables, table, prefix))
    }

    async fn scan_before(
        &self,
        table: Table,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let tables = self.tables.read().await;
        Ok(scan_before_in(&tables, table, before, limit))
    }
}
