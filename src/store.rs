use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::StoreError;
use crate::record::{ArchivedPriceRecord, PriceRecord, RecordKey};

/// One atomic write against the store.
#[derive(Debug, Clone)]
pub enum Write {
    /// First observation of a key.
    Insert(PriceRecord),
    /// Archive the prior state and overwrite the current record in one step.
    Supersede {
        archived: ArchivedPriceRecord,
        current: PriceRecord,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub current: usize,
    pub archived: usize,
    pub sites: usize,
    pub categories: usize,
}

/// Document store keyed by (site, category, item key) with an append-only archive.
///
/// `apply` must make a `Supersede` atomic: no reader may see the new current
/// record without the archive entry for the value it replaced.
pub trait PriceStore: Send + Sync {
    fn find_current(&self, key: &RecordKey) -> Result<Option<PriceRecord>, StoreError>;

    fn apply(&self, write: &Write) -> Result<(), StoreError>;

    /// Current records in the given categories (all when empty), oldest insert first.
    fn current_records(&self, categories: &[String]) -> Result<Vec<PriceRecord>, StoreError>;

    /// Archive entries for a key, oldest first.
    fn history(&self, key: &RecordKey) -> Result<Vec<ArchivedPriceRecord>, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError>;
}

// ── In-memory store ──

#[derive(Default)]
struct MemoryInner {
    next_seq: u64,
    current: HashMap<RecordKey, (u64, PriceRecord)>,
    archive: Vec<ArchivedPriceRecord>,
}

/// Volatile store for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PriceStore for MemoryStore {
    fn find_current(&self, key: &RecordKey) -> Result<Option<PriceRecord>, StoreError> {
        Ok(self.inner.read().current.get(key).map(|(_, r)| r.clone()))
    }

    fn apply(&self, write: &Write) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match write {
            Write::Insert(record) => {
                if inner.current.contains_key(&record.key) {
                    return Err(StoreError::Corrupt(format!(
                        "insert over existing key {:?}",
                        record.key
                    )));
                }
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.current.insert(record.key.clone(), (seq, record.clone()));
            }
            Write::Supersede { archived, current } => {
                let seq = match inner.current.get(&current.key) {
                    Some((seq, _)) => *seq,
                    None => {
                        return Err(StoreError::Corrupt(format!(
                            "supersede of missing key {:?}",
                            current.key
                        )))
                    }
                };
                inner.archive.push(archived.clone());
                inner.current.insert(current.key.clone(), (seq, current.clone()));
            }
        }
        Ok(())
    }

    fn current_records(&self, categories: &[String]) -> Result<Vec<PriceRecord>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<_> = inner
            .current
            .values()
            .filter(|(_, r)| categories.is_empty() || categories.contains(&r.key.category_name))
            .collect();
        rows.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        Ok(rows.into_iter().map(|(_, r)| r.clone()).collect())
    }

    fn history(&self, key: &RecordKey) -> Result<Vec<ArchivedPriceRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .archive
            .iter()
            .filter(|a| &a.record.key == key)
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.inner.read();
        let mut sites: Vec<&str> = inner.current.keys().map(|k| k.site_name.as_str()).collect();
        sites.sort_unstable();
        sites.dedup();
        let mut categories: Vec<&str> =
            inner.current.keys().map(|k| k.category_name.as_str()).collect();
        categories.sort_unstable();
        categories.dedup();
        Ok(StoreStats {
            current: inner.current.len(),
            archived: inner.archive.len(),
            sites: sites.len(),
            categories: categories.len(),
        })
    }
}
