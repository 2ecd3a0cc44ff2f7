//! Durable backend over SQLite.
//!
//! Every mutation appends its event to the `enc_events` table inside the
//! same transaction as the row change and publishes it on the bus only
//! after commit. Counters are stored as decimal text so the full u64
//! range survives the round trip.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::StorageConfig;
use crate::error::{Result, VaultError};
use crate::events::{EventBus, VaultEvent};
use crate::record::{KeyId, KeyRecord, UsageDelta, UsageFlags, UsageStats};
use crate::storage::KeyBackend;

const EVENT_TABLE: &str = "enc_events";

fn flag(v: bool) -> &'static str {
    if v {
        "Y"
    } else {
        "N"
    }
}

fn parse_counter(text: &str, column: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| VaultError::InvalidArgument(format!("Bad counter in column {column}")))
}

/// Raw column values lifted out of a row before fallible decoding.
struct RawRow {
    record: KeyRecord,
    params_json: String,
    created: String,
    times: String,
    bytes: String,
    failures: String,
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    let id: String = row.get("id")?;
    let record = KeyRecord {
        id: KeyId::from(id),
        ext_id: row.get("ext_id")?,
        raw: None,
        data: row.get("data")?,
        flags: UsageFlags {
            encrypt: row.get::<_, String>("u_encrypt")? == "Y",
            sign: row.get::<_, String>("u_sign")? == "Y",
            derive: row.get::<_, String>("u_derive")? == "Y",
            shared: row.get::<_, String>("u_shared")? == "Y",
            temp: row.get::<_, String>("u_temp")? == "Y",
        },
        key_type: row.get("key_type")?,
        params: serde_json::Map::new(),
        created: None,
        stats: UsageStats::default(),
    };
    Ok(RawRow {
        record,
        params_json: row.get("params")?,
        created: row.get("created")?,
        times: row.get("stat_times")?,
        bytes: row.get("stat_bytes")?,
        failures: row.get("stat_failures")?,
    })
}

fn decode_row(raw: RawRow) -> Result<KeyRecord> {
    let mut record = raw.record;
    record.params = serde_json::from_str(&raw.params_json)?;
    record.created = Some(
        DateTime::parse_from_rfc3339(&raw.created)
            .map_err(|_| VaultError::InvalidArgument("Bad created timestamp".into()))?
            .with_timezone(&Utc),
    );
    record.stats = UsageStats {
        times: parse_counter(&raw.times, "stat_times")?,
        bytes: parse_counter(&raw.bytes, "stat_bytes")?,
        failures: parse_counter(&raw.failures, "stat_failures")?,
    };
    Ok(record)
}

fn append_event(tx: &rusqlite::Transaction<'_>, event: &VaultEvent) -> Result<()> {
    let payload = serde_json::to_string(event)?;
    tx.execute(
        &format!("INSERT INTO {EVENT_TABLE} (etype, payload) VALUES (?1, ?2)"),
        params![event.kind(), payload],
    )?;
    Ok(())
}

/// SQLite-backed [`KeyBackend`]. A single connection behind a mutex,
/// driven from `spawn_blocking` so statement execution never stalls the
/// async executor.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    bus: EventBus,
    key_table: Arc<str>,
}

impl SqliteBackend {
    pub fn open(config: &StorageConfig, bus: EventBus) -> Result<Self> {
        let table = config.key_table.as_str();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(VaultError::InvalidArgument(format!(
                "Bad key table name: {table}"
            )));
        }

        let conn = match &config.db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id            TEXT PRIMARY KEY,
                ext_id        TEXT NOT NULL UNIQUE,
                key_type      TEXT NOT NULL,
                params        TEXT NOT NULL,
                data          TEXT,
                u_encrypt     TEXT NOT NULL,
                u_sign        TEXT NOT NULL,
                u_derive      TEXT NOT NULL,
                u_shared      TEXT NOT NULL,
                u_temp        TEXT NOT NULL,
                created       TEXT NOT NULL,
                stat_times    TEXT NOT NULL,
                stat_bytes    TEXT NOT NULL,
                stat_failures TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {EVENT_TABLE} (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                etype   TEXT NOT NULL,
                payload TEXT NOT NULL
            );"
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            bus,
            key_table: Arc::from(table),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn run<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.key_table);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut guard, &table)
        })
        .await
        .map_err(|err| VaultError::Storage(err.to_string()))?
    }

    fn select_one(
        conn: &Connection,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<KeyRecord> {
        let sql = format!("SELECT * FROM {table} WHERE {column} = ?1");
        let raw = conn
            .query_row(&sql, params![value], row_to_raw)
            .optional()?
            .ok_or_else(|| VaultError::UnknownKeyID(value.to_string()))?;
        decode_row(raw)
    }
}

#[async_trait]
impl KeyBackend for SqliteBackend {
    async fn load(&self, id: &KeyId) -> Result<KeyRecord> {
        let id = id.to_string();
        self.run(move |conn, table| Self::select_one(conn, table, "id", &id))
            .await
    }

    async fn load_ext(&self, ext_id: &str) -> Result<KeyRecord> {
        let ext_id = ext_id.to_string();
        self.run(move |conn, table| Self::select_one(conn, table, "ext_id", &ext_id))
            .await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<()> {
        let mut stored = record.sealed();
        if stored.created.is_none() {
            stored.created = Some(Utc::now());
        }
        let event = self
            .run(move |conn, table| {
                let params_json = serde_json::to_string(&stored.params)?;
                let created = stored
                    .created
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO {table} (id, ext_id, key_type, params, data,
                            u_encrypt, u_sign, u_derive, u_shared, u_temp,
                            created, stat_times, stat_bytes, stat_failures)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                    ),
                    params![
                        stored.id.as_str(),
                        stored.ext_id,
                        stored.key_type,
                        params_json,
                        stored.data,
                        flag(stored.flags.encrypt),
                        flag(stored.flags.sign),
                        flag(stored.flags.derive),
                        flag(stored.flags.shared),
                        flag(stored.flags.temp),
                        created,
                        stored.stats.times.to_string(),
                        stored.stats.bytes.to_string(),
                        stored.stats.failures.to_string(),
                    ],
                )?;
                let event = VaultEvent::Created {
                    id: stored.id.clone(),
                    ext_id: stored.ext_id.clone(),
                    key_type: stored.key_type.clone(),
                };
                append_event(&tx, &event)?;
                tx.commit()?;
                Ok(event)
            })
            .await?;
        self.bus.publish(event);
        Ok(())
    }

    async fn remove(&self, id: &KeyId) -> Result<()> {
        let key = id.clone();
        let event = self
            .run(move |conn, table| {
                let tx = conn.transaction()?;
                let affected = tx.execute(
                    &format!("DELETE FROM {table} WHERE id = ?1"),
                    params![key.as_str()],
                )?;
                if affected == 0 {
                    return Err(VaultError::UnknownKeyID(key.to_string()));
                }
                let event = VaultEvent::Deleted { id: key };
                append_event(&tx, &event)?;
                tx.commit()?;
                Ok(event)
            })
            .await?;
        self.bus.publish(event);
        Ok(())
    }

    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let key = id.clone();
        let delta = *delta;
        let event = self
            .run(move |conn, table| {
                let tx = conn.transaction()?;
                // read-modify-write inside one transaction keeps the
                // counters consistent across concurrent flushers
                let current = tx
                    .query_row(
                        &format!(
                            "SELECT stat_times, stat_bytes, stat_failures
                             FROM {table} WHERE id = ?1"
                        ),
                        params![key.as_str()],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?
                    .ok_or_else(|| VaultError::UnknownKeyID(key.to_string()))?;
                let mut stats = UsageStats {
                    times: parse_counter(&current.0, "stat_times")?,
                    bytes: parse_counter(&current.1, "stat_bytes")?,
                    failures: parse_counter(&current.2, "stat_failures")?,
                };
                stats.apply(&delta);
                tx.execute(
                    &format!(
                        "UPDATE {table}
                         SET stat_times = ?2, stat_bytes = ?3, stat_failures = ?4
                         WHERE id = ?1"
                    ),
                    params![
                        key.as_str(),
                        stats.times.to_string(),
                        stats.bytes.to_string(),
                        stats.failures.to_string(),
                    ],
                )?;
                let event = VaultEvent::Updated { id: key, delta };
                append_event(&tx, &event)?;
                tx.commit()?;
                Ok(event)
            })
            .await?;
        self.bus.publish(event);
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        let prefix = prefix.map(str::to_string);
        self.run(move |conn, table| {
            let mut out = Vec::new();
            match prefix {
                Some(p) => {
                    // escape LIKE wildcards so the prefix is literal
                    let pattern = format!(
                        "{}%",
                        p.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
                    );
                    let mut stmt = conn.prepare(&format!(
                        "SELECT id FROM {table} WHERE ext_id LIKE ?1 ESCAPE '\\' ORDER BY id"
                    ))?;
                    let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
                    for row in rows {
                        out.push(KeyId::from(row?));
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare(&format!("SELECT id FROM {table} ORDER BY id"))?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    for row in rows {
                        out.push(KeyId::from(row?));
                    }
                }
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SqliteBackend {
        SqliteBackend::open(&StorageConfig::default(), EventBus::new()).unwrap()
    }

    fn record(ext_id: &str) -> KeyRecord {
        let mut rec = KeyRecord::new(ext_id, UsageFlags::default(), "AES", Default::default());
        rec.data = Some("ZW52ZWxvcGU=".into());
        rec
    }

    #[tokio::test]
    async fn round_trips_all_columns() {
        let backend = backend();
        let mut rec = record("full");
        rec.flags.encrypt = true;
        rec.flags.temp = true;
        rec.params
            .insert("bits".into(), serde_json::Value::from(256));
        backend.insert(&rec).await.unwrap();

        let loaded = backend.load(&rec.id).await.unwrap();
        assert_eq!(loaded.ext_id, "full");
        assert_eq!(loaded.key_type, "AES");
        assert_eq!(loaded.data.as_deref(), Some("ZW52ZWxvcGU="));
        assert!(loaded.flags.encrypt && loaded.flags.temp);
        assert!(!loaded.flags.sign);
        assert_eq!(loaded.params["bits"], serde_json::Value::from(256));
        assert!(loaded.created.is_some());
        assert!(loaded.raw.is_none());
    }

    #[tokio::test]
    async fn duplicate_maps_to_duplicate_error() {
        let backend = backend();
        backend.insert(&record("twice")).await.unwrap();
        assert!(matches!(
            backend.insert(&record("twice")).await,
            Err(VaultError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn update_usage_accumulates_and_checks_existence() {
        let backend = backend();
        let rec = record("counted");
        backend.insert(&rec).await.unwrap();

        backend
            .update_usage(&rec.id, &UsageDelta::new(2, 100, 0))
            .await
            .unwrap();
        backend
            .update_usage(&rec.id, &UsageDelta::new(1, 28, 1))
            .await
            .unwrap();
        let loaded = backend.load(&rec.id).await.unwrap();
        assert_eq!(loaded.stats, UsageStats {
            times: 3,
            bytes: 128,
            failures: 1
        });

        assert!(matches!(
            backend
                .update_usage(&KeyId::generate(), &UsageDelta::new(1, 0, 0))
                .await,
            Err(VaultError::UnknownKeyID(_))
        ));
    }

    #[tokio::test]
    async fn events_are_durable_and_ordered() {
        let backend = backend();
        let rec = record("evented");
        backend.insert(&rec).await.unwrap();
        backend
            .update_usage(&rec.id, &UsageDelta::new(1, 10, 0))
            .await
            .unwrap();
        backend.remove(&rec.id).await.unwrap();

        let kinds = backend
            .run(|conn, _| {
                let mut stmt =
                    conn.prepare("SELECT etype FROM enc_events ORDER BY seq")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(kinds, ["SV_NEW", "SV_UPD", "SV_DEL"]);
    }

    #[tokio::test]
    async fn list_prefix_is_literal() {
        let backend = backend();
        backend.insert(&record("app_a")).await.unwrap();
        backend.insert(&record("appxa")).await.unwrap();
        backend.insert(&record("other")).await.unwrap();

        // underscore in the prefix must not act as a wildcard
        let ids = backend.list(Some("app_")).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
    }

    #[test]
    fn rejects_hostile_table_name() {
        let config = StorageConfig {
            key_table: "keys; DROP TABLE x".into(),
            ..Default::default()
        };
        assert!(matches!(
            SqliteBackend::open(&config, EventBus::new()),
            Err(VaultError::InvalidArgument(_))
        ));
    }
}
