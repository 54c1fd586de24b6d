use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::record::{ArchivedPriceRecord, PriceRecord, RecordKey};
use crate::store::{PriceStore, StoreStats, Write};

pub fn connect(path: &Path) -> Result<Connection, StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
    }
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS prices (
            id               INTEGER PRIMARY KEY,
            site_name        TEXT NOT NULL,
            category_name    TEXT NOT NULL,
            item_key         TEXT NOT NULL,
            item_name        TEXT NOT NULL,
            sell_price       TEXT NOT NULL,
            sell_price_value REAL NOT NULL CHECK(sell_price_value > 0),
            currency         TEXT NOT NULL,
            url              TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            UNIQUE(site_name, category_name, item_key)
        );
        CREATE INDEX IF NOT EXISTS idx_prices_category ON prices(category_name);

        CREATE TABLE IF NOT EXISTS price_archive (
            id               INTEGER PRIMARY KEY,
            site_name        TEXT NOT NULL,
            category_name    TEXT NOT NULL,
            item_key         TEXT NOT NULL,
            item_name        TEXT NOT NULL,
            sell_price       TEXT NOT NULL,
            sell_price_value REAL NOT NULL,
            currency         TEXT NOT NULL,
            url              TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            archived_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_archive_key
            ON price_archive(site_name, category_name, item_key);

        -- History is append-only; current rows are never hard-deleted
        CREATE TRIGGER IF NOT EXISTS price_archive_no_update
            BEFORE UPDATE ON price_archive
            BEGIN SELECT RAISE(ABORT, 'price_archive is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS price_archive_no_delete
            BEFORE DELETE ON price_archive
            BEGIN SELECT RAISE(ABORT, 'price_archive is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS prices_no_delete
            BEFORE DELETE ON prices
            BEGIN SELECT RAISE(ABORT, 'prices rows are superseded, not deleted'); END;
        CREATE TRIGGER IF NOT EXISTS prices_created_at_fixed
            BEFORE UPDATE OF created_at ON prices
            WHEN NEW.created_at <> OLD.created_at
            BEGIN SELECT RAISE(ABORT, 'created_at is immutable'); END;
        ",
    )?;
    Ok(())
}

/// SQLite-backed [`PriceStore`]. Each write is one transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        init_schema(&conn).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        SqliteStore {
            conn: Mutex::new(conn),
        }
    }
}

const RECORD_COLUMNS: &str = "site_name, category_name, item_key, item_name, sell_price,
     sell_price_value, currency, url, created_at, updated_at";

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row) -> rusqlite::Result<PriceRecord> {
    Ok(PriceRecord {
        key: RecordKey {
            site_name: row.get(0)?,
            category_name: row.get(1)?,
            item_key: row.get(2)?,
        },
        item_name: row.get(3)?,
        sell_price: row.get(4)?,
        sell_price_value: row.get(5)?,
        currency: row.get(6)?,
        url: row.get(7)?,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
    })
}

impl PriceStore for SqliteStore {
    fn find_current(&self, key: &RecordKey) -> Result<Option<PriceRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM prices WHERE site_name = ?1 AND category_name = ?2 AND item_key = ?3",
            RECORD_COLUMNS
        );
        let row = conn
            .query_row(
                &sql,
                rusqlite::params![key.site_name, key.category_name, key.item_key],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn apply(&self, write: &Write) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        match write {
            Write::Insert(r) => {
                tx.execute(
                    &format!(
                        "INSERT INTO prices ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                        RECORD_COLUMNS
                    ),
                    rusqlite::params![
                        r.key.site_name, r.key.category_name, r.key.item_key, r.item_name,
                        r.sell_price, r.sell_price_value, r.currency, r.url,
                        ts(&r.created_at), ts(&r.updated_at),
                    ],
                )?;
            }
            Write::Supersede { archived, current } => {
                let a = &archived.record;
                tx.execute(
                    &format!(
                        "INSERT INTO price_archive ({}, archived_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                        RECORD_COLUMNS
                    ),
                    rusqlite::params![
                        a.key.site_name, a.key.category_name, a.key.item_key, a.item_name,
                        a.sell_price, a.sell_price_value, a.currency, a.url,
                        ts(&a.created_at), ts(&a.updated_at), ts(&archived.archived_at),
                    ],
                )?;
                let c = current;
                let changed = tx.execute(
                    "UPDATE prices
                     SET item_name = ?4, sell_price = ?5, sell_price_value = ?6,
                         currency = ?7, url = ?8, updated_at = ?9
                     WHERE site_name = ?1 AND category_name = ?2 AND item_key = ?3",
                    rusqlite::params![
                        c.key.site_name, c.key.category_name, c.key.item_key, c.item_name,
                        c.sell_price, c.sell_price_value, c.currency, c.url,
                        ts(&c.updated_at),
                    ],
                )?;
                if changed != 1 {
                    // Dropping the transaction rolls the archive insert back.
                    return Err(StoreError::Corrupt(format!(
                        "supersede touched {} rows for {:?}",
                        changed, c.key
                    )));
                }
            }
        }
        tx.commit()?;
        debug!("write committed");
        Ok(())
    }

    fn current_records(&self, categories: &[String]) -> Result<Vec<PriceRecord>, StoreError> {
        let conn = self.conn.lock();
        let where_clause = if categories.is_empty() {
            String::new()
        } else {
            let marks: Vec<String> = (1..=categories.len()).map(|i| format!("?{}", i)).collect();
            format!(" WHERE category_name IN ({})", marks.join(","))
        };
        let sql = format!(
            "SELECT {} FROM prices{} ORDER BY created_at, id",
            RECORD_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(categories.iter()), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn history(&self, key: &RecordKey) -> Result<Vec<ArchivedPriceRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, archived_at FROM price_archive
             WHERE site_name = ?1 AND category_name = ?2 AND item_key = ?3
             ORDER BY archived_at, id",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![key.site_name, key.category_name, key.item_key],
                |row| {
                    Ok(ArchivedPriceRecord {
                        record: record_from_row(row)?,
                        archived_at: parse_ts(row, 10)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();
        let current: usize = conn.query_row("SELECT COUNT(*) FROM prices", [], |r| r.get(0))?;
        let archived: usize =
            conn.query_row("SELECT COUNT(*) FROM price_archive", [], |r| r.get(0))?;
        let sites: usize =
            conn.query_row("SELECT COUNT(DISTINCT site_name) FROM prices", [], |r| r.get(0))?;
        let categories: usize = conn.query_row(
            "SELECT COUNT(DISTINCT category_name) FROM prices",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            current,
            archived,
            sites,
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::record::NewRecord;

    fn new_record(title: &str, value: f64) -> NewRecord {
        NewRecord::from_value("bynogame", "bynogame-pubgm-tr", title, value, "TRY", "u").unwrap()
    }

    fn first(title: &str, value: f64) -> PriceRecord {
        let new = new_record(title, value);
        PriceRecord::first_seen(new.validate().unwrap(), &new, Utc::now())
    }

    #[test]
    fn insert_then_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = first("60 UC", 29.9);
        store.apply(&Write::Insert(r.clone())).unwrap();
        let found = store.find_current(&r.key).unwrap().unwrap();
        assert_eq!(found, r);
    }

    #[test]
    fn supersede_archives_prior_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = first("60 UC", 29.9);
        store.apply(&Write::Insert(r.clone())).unwrap();

        let later = r.updated_at + Duration::seconds(10);
        let next = r.superseded_by(&new_record("60 UC", 27.5), later);
        store
            .apply(&Write::Supersede {
                archived: r.archive(later),
                current: next.clone(),
            })
            .unwrap();

        let current = store.find_current(&r.key).unwrap().unwrap();
        assert_eq!(current.sell_price, "27.50");
        assert_eq!(current.created_at, r.created_at);

        let history = store.history(&r.key).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record.sell_price, "29.90");
        assert_eq!(history[0].archived_at, later);
    }

    #[test]
    fn supersede_of_missing_key_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = first("60 UC", 29.9);
        let err = store.apply(&Write::Supersede {
            archived: r.archive(Utc::now()),
            current: r.clone(),
        });
        assert!(matches!(err, Err(StoreError::Corrupt(_))));
        assert!(store.history(&r.key).unwrap().is_empty());
    }

    #[test]
    fn archive_is_append_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = first("60 UC", 29.9);
        store.apply(&Write::Insert(r.clone())).unwrap();
        store
            .apply(&Write::Supersede {
                archived: r.archive(Utc::now()),
                current: r.superseded_by(&new_record("60 UC", 25.0), Utc::now()),
            })
            .unwrap();

        let conn = store.conn.lock();
        assert!(conn.execute("DELETE FROM price_archive", []).is_err());
        assert!(conn.execute("UPDATE price_archive SET sell_price = '1.00'", []).is_err());
        assert!(conn.execute("DELETE FROM prices", []).is_err());
    }

    #[test]
    fn current_records_by_category() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.apply(&Write::Insert(first("60 UC", 29.9))).unwrap();
        let other = NewRecord::from_value("bynogame", "bynogame-mlbb-tr", "100 Elmas", 39.9, "TRY", "u")
            .unwrap();
        store
            .apply(&Write::Insert(PriceRecord::first_seen(
                other.validate().unwrap(),
                &other,
                Utc::now(),
            )))
            .unwrap();

        let rows = store.current_records(&["bynogame-mlbb-tr".to_string()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_name, "100 Elmas");
        assert_eq!(store.current_records(&[]).unwrap().len(), 2);

        let stats = store.stats().unwrap();
        assert_eq!(stats.current, 2);
        assert_eq!(stats.archived, 0);
        assert_eq!(stats.categories, 2);
    }
}
