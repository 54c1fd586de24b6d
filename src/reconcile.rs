use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::UpsertError;
use crate::price;
use crate::record::{NewRecord, PriceRecord, RecordKey};
use crate::store::{PriceStore, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveMode {
    /// Archive the prior value on every call, even when unchanged.
    #[default]
    Always,
    /// Archive and update only when the price value changed.
    OnChange,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    pub archive_mode: ArchiveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First observation of the key.
    Inserted,
    /// Prior state archived, new state current.
    Archived,
    /// `on-change` and the value did not move.
    Unchanged,
}

/// Applies the upsert-and-archive contract on top of a [`PriceStore`].
///
/// Calls for one key run one at a time; calls for different keys only share
/// the store's own write lock.
pub struct Reconciler<S> {
    store: S,
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl<S: PriceStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Reconciler {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn upsert_and_archive(
        &self,
        record: &NewRecord,
        options: UpsertOptions,
    ) -> Result<UpsertOutcome, UpsertError> {
        let key = record.validate()?;
        let lock = self.lock_for(&key);
        let outcome = {
            let _guard = lock.lock();
            self.upsert_locked(key.clone(), record, options)
        };
        self.release(&key, lock);
        outcome
    }

    fn upsert_locked(
        &self,
        key: RecordKey,
        record: &NewRecord,
        options: UpsertOptions,
    ) -> Result<UpsertOutcome, UpsertError> {
        let now = Utc::now();
        let Some(prev) = self.store.find_current(&key)? else {
            self.store
                .apply(&Write::Insert(PriceRecord::first_seen(key, record, now)))?;
            return Ok(UpsertOutcome::Inserted);
        };

        if options.archive_mode == ArchiveMode::OnChange
            && prev.cents() == price::to_cents(record.sell_price_value)
        {
            debug!(item = %prev.key.item_key, "value unchanged, skipping");
            return Ok(UpsertOutcome::Unchanged);
        }

        let current = prev.superseded_by(record, now);
        self.store.apply(&Write::Supersede {
            archived: prev.archive(now),
            current,
        })?;
        Ok(UpsertOutcome::Archived)
    }

    fn lock_for(&self, key: &RecordKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().value().clone()
    }

    /// Drops the key's lock entry once no other caller holds or waits on it.
    fn release(&self, key: &RecordKey, lock: Arc<Mutex<()>>) {
        self.locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::error::ValidationError;
    use crate::store::MemoryStore;

    const ALWAYS: UpsertOptions = UpsertOptions {
        archive_mode: ArchiveMode::Always,
    };
    const ON_CHANGE: UpsertOptions = UpsertOptions {
        archive_mode: ArchiveMode::OnChange,
    };

    fn obs(value: f64) -> NewRecord {
        NewRecord::from_value(
            "btkgame",
            "btkgame-mlbb-global",
            "Mobile Legends Elmas Global 100",
            value,
            "TRY",
            "https://www.btkgame.com/mlbb",
        )
        .unwrap()
    }

    fn key() -> RecordKey {
        obs(1.0).validate().unwrap()
    }

    #[test]
    fn first_observation_inserts_without_archive() {
        let r = Reconciler::new(MemoryStore::new());
        assert_eq!(r.upsert_and_archive(&obs(39.9), ALWAYS).unwrap(), UpsertOutcome::Inserted);
        assert!(r.store().history(&key()).unwrap().is_empty());
        assert_eq!(r.store().find_current(&key()).unwrap().unwrap().sell_price, "39.90");
    }

    #[test]
    fn identical_second_call_depends_on_mode() {
        let always = Reconciler::new(MemoryStore::new());
        always.upsert_and_archive(&obs(39.9), ALWAYS).unwrap();
        assert_eq!(always.upsert_and_archive(&obs(39.9), ALWAYS).unwrap(), UpsertOutcome::Archived);
        assert_eq!(always.store().history(&key()).unwrap().len(), 1);

        let on_change = Reconciler::new(MemoryStore::new());
        on_change.upsert_and_archive(&obs(39.9), ON_CHANGE).unwrap();
        assert_eq!(
            on_change.upsert_and_archive(&obs(39.9), ON_CHANGE).unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(on_change.store().history(&key()).unwrap().len(), 0);
    }

    #[test]
    fn on_change_archives_when_value_moves() {
        let r = Reconciler::new(MemoryStore::new());
        r.upsert_and_archive(&obs(39.9), ON_CHANGE).unwrap();
        assert_eq!(r.upsert_and_archive(&obs(29.9), ON_CHANGE).unwrap(), UpsertOutcome::Archived);
        let history = r.store().history(&key()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record.sell_price_value, 39.9);
    }

    #[test]
    fn n_distinct_values_leave_n_minus_one_archives() {
        let r = Reconciler::new(SqliteStore::open_in_memory().unwrap());
        let values = [10.0, 12.5, 11.25, 9.99, 15.0];
        for v in values {
            r.upsert_and_archive(&obs(v), ALWAYS).unwrap();
        }

        let history = r.store().history(&key()).unwrap();
        assert_eq!(history.len(), values.len() - 1);
        let archived: Vec<f64> = history.iter().map(|a| a.record.sell_price_value).collect();
        assert_eq!(archived, values[..values.len() - 1]);

        let current = r.store().find_current(&key()).unwrap().unwrap();
        assert_eq!(current.sell_price_value, 15.0);
        assert_eq!(current.sell_price, "15.00");
    }

    #[test]
    fn created_at_survives_updates() {
        let r = Reconciler::new(MemoryStore::new());
        r.upsert_and_archive(&obs(39.9), ALWAYS).unwrap();
        let created = r.store().find_current(&key()).unwrap().unwrap().created_at;
        r.upsert_and_archive(&obs(29.9), ALWAYS).unwrap();
        let current = r.store().find_current(&key()).unwrap().unwrap();
        assert_eq!(current.created_at, created);
        assert!(current.updated_at >= created);
    }

    #[test]
    fn invalid_record_is_not_persisted() {
        let r = Reconciler::new(MemoryStore::new());
        let mut bad = obs(39.9);
        bad.site_name = " ".into();
        let err = r.upsert_and_archive(&bad, ALWAYS).unwrap_err();
        assert!(matches!(err, UpsertError::Validation(ValidationError::EmptyField("siteName"))));
        assert_eq!(r.store().stats().unwrap().current, 0);
    }

    #[test]
    fn region_variants_share_a_key_within_a_category() {
        let r = Reconciler::new(MemoryStore::new());
        let mut a = obs(39.9);
        a.item_name = "Mobile Legends Elmas TR 100".into();
        r.upsert_and_archive(&a, ALWAYS).unwrap();
        r.upsert_and_archive(&obs(38.9), ALWAYS).unwrap();
        assert_eq!(r.store().stats().unwrap().current, 1);
        assert_eq!(r.store().history(&key()).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_same_key_writes_lose_no_archive() {
        let r = Reconciler::new(MemoryStore::new());
        let threads = 8;
        let per_thread = 25;

        std::thread::scope(|s| {
            for t in 0..threads {
                let r = &r;
                s.spawn(move || {
                    for i in 0..per_thread {
                        let v = 100.0 + (t * per_thread + i) as f64;
                        r.upsert_and_archive(&obs(v), ALWAYS).unwrap();
                    }
                });
            }
        });

        let total = threads * per_thread;
        assert_eq!(r.store().history(&key()).unwrap().len(), total - 1);
        assert!(r.locks.is_empty());
    }

    #[test]
    fn concurrent_distinct_keys_are_independent() {
        let r = Reconciler::new(SqliteStore::open_in_memory().unwrap());
        std::thread::scope(|s| {
            for t in 0..4 {
                let r = &r;
                s.spawn(move || {
                    for i in 0..10 {
                        let mut rec = obs(50.0 + i as f64);
                        rec.item_name = format!("{} UC", 60 * (t + 1));
                        r.upsert_and_archive(&rec, ALWAYS).unwrap();
                    }
                });
            }
        });
        let stats = r.store().stats().unwrap();
        assert_eq!(stats.current, 4);
        assert_eq!(stats.archived, 4 * 9);
    }
}
