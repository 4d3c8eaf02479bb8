//! SQLite-backed inventory store.

use crate::error::{InventoryError, InventoryResult};
use crate::models::{ObjectRecord, TotalsRow, VolumeRow};
use crate::repos::{
    DatasetSummary, InventoryMutator, InventoryReader, InventoryStore, VolumeInfo, VolumeTotals,
};
use async_trait::async_trait;
use larder_core::{clock, CacheObject, VolumeStatus, DEFAULT_ALGORITHM, DEFAULT_PRIORITY, SIZE_UNKNOWN};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS algorithms (
    id   INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS volumes (
    id       INTEGER PRIMARY KEY,
    name     TEXT NOT NULL UNIQUE,
    priority INTEGER,
    capacity INTEGER,
    status   INTEGER NOT NULL DEFAULT 3,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS objects (
    objid     TEXT NOT NULL,
    name      TEXT NOT NULL,
    size      INTEGER NOT NULL DEFAULT -1,
    checksum  TEXT,
    algorithm INTEGER NOT NULL REFERENCES algorithms(id),
    priority  INTEGER NOT NULL DEFAULT 10,
    volume    INTEGER NOT NULL REFERENCES volumes(id),
    since     INTEGER NOT NULL,
    checked   INTEGER NOT NULL DEFAULT 0,
    metadata  TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_objects_volume_name ON objects(volume, name);
CREATE INDEX IF NOT EXISTS idx_objects_objid ON objects(objid);
CREATE INDEX IF NOT EXISTS idx_objects_checked ON objects(checked);
"#;

/// Base SELECT joining object rows with their volume and algorithm names.
const SELECT_OBJECT: &str = "SELECT d.objid AS objid, d.name AS name, v.name AS volume, \
     d.size AS size, d.checksum AS checksum, a.name AS algorithm, d.priority AS priority, \
     d.since AS since, d.checked AS checked, d.metadata AS metadata \
     FROM objects d JOIN volumes v ON d.volume = v.id JOIN algorithms a ON d.algorithm = a.id";

const DEFAULT_GRACE_MS: i64 = 24 * 3600 * 1000;
const DEFAULT_PROTECTION_MS: i64 = 24 * 3600 * 1000;

/// SQLite-based inventory store.
///
/// A single-connection pool serializes all writes; the name-to-id maps for
/// volumes and algorithms are cached in memory and reloaded whenever a
/// registration write occurs.
pub struct SqliteInventory {
    pool: Pool<Sqlite>,
    volids: RwLock<Option<HashMap<String, i64>>>,
    algids: RwLock<Option<HashMap<String, i64>>>,
    grace_ms: AtomicI64,
    protection_ms: AtomicI64,
}

impl SqliteInventory {
    /// Open (creating if missing) an inventory database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> InventoryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                InventoryError::Internal(format!("cannot create inventory directory: {e}"))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes writers, which is all this inventory needs.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            volids: RwLock::new(None),
            algids: RwLock::new(None),
            grace_ms: AtomicI64::new(DEFAULT_GRACE_MS),
            protection_ms: AtomicI64::new(DEFAULT_PROTECTION_MS),
        };
        store.migrate().await?;
        store.register_algorithm(DEFAULT_ALGORITHM).await?;
        tracing::debug!(path = %path.display(), "inventory database opened");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn load_volumes(&self) -> InventoryResult<HashMap<String, i64>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM volumes")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InventoryError::Search(format!("failed to load volume info: {e}")))?;
        let map: HashMap<String, i64> = rows.into_iter().map(|(id, name)| (name, id)).collect();
        *self.volids.write().expect("volume id cache poisoned") = Some(map.clone());
        Ok(map)
    }

    async fn load_algorithms(&self) -> InventoryResult<HashMap<String, i64>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM algorithms")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InventoryError::Search(format!("failed to load algorithm info: {e}")))?;
        let map: HashMap<String, i64> = rows.into_iter().map(|(id, name)| (name, id)).collect();
        *self.algids.write().expect("algorithm id cache poisoned") = Some(map.clone());
        Ok(map)
    }

    async fn volume_id(&self, name: &str) -> InventoryResult<i64> {
        if let Some(map) = self.volids.read().expect("volume id cache poisoned").as_ref() {
            if let Some(id) = map.get(name) {
                return Ok(*id);
            }
            return Err(InventoryError::VolumeNotFound(name.to_string()));
        }
        self.load_volumes()
            .await?
            .get(name)
            .copied()
            .ok_or_else(|| InventoryError::VolumeNotFound(name.to_string()))
    }

    async fn algorithm_id(&self, name: &str) -> InventoryResult<Option<i64>> {
        if let Some(map) = self.algids.read().expect("algorithm id cache poisoned").as_ref() {
            return Ok(map.get(name).copied());
        }
        Ok(self.load_algorithms().await?.get(name).copied())
    }

    async fn fetch_objects(
        &self,
        where_clause: &str,
        binds: &[SqlArg<'_>],
    ) -> InventoryResult<Vec<CacheObject>> {
        let sql = format!("{SELECT_OBJECT} WHERE {where_clause}");
        let mut query = sqlx::query_as::<_, ObjectRecord>(&sql);
        for bind in binds {
            query = match bind {
                SqlArg::Text(s) => query.bind(*s),
                SqlArg::Int(i) => query.bind(*i),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InventoryError::Search(e.to_string()))?;
        rows.into_iter().map(ObjectRecord::into_cache_object).collect()
    }

    fn totals_from(row: TotalsRow) -> VolumeTotals {
        VolumeTotals {
            filecount: row.filecount,
            totalsize: row.totalsize,
            since: row.since,
            since_date: clock::to_rfc3339(row.since),
            checked: row.checked,
            checked_date: clock::to_rfc3339(row.checked),
        }
    }
}

enum SqlArg<'a> {
    Text(&'a str),
    Int(i64),
}

fn lift_i64(md: &Value, key: &str, default: i64) -> InventoryResult<i64> {
    match md.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
            InventoryError::Metadata(format!("{key}: metadatum is not an integer"))
        }),
        Some(_) => Err(InventoryError::Metadata(format!(
            "{key}: metadatum has unexpected type"
        ))),
    }
}

fn lift_str(md: &Value, key: &str) -> InventoryResult<Option<String>> {
    match md.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InventoryError::Metadata(format!(
            "{key}: metadatum has unexpected type"
        ))),
    }
}

#[async_trait]
impl InventoryReader for SqliteInventory {
    async fn find_object(
        &self,
        id: &str,
        volume: Option<&str>,
    ) -> InventoryResult<Vec<CacheObject>> {
        match volume {
            Some(vol) => {
                self.fetch_objects(
                    "d.objid = ? AND v.name = ?",
                    &[SqlArg::Text(id), SqlArg::Text(vol)],
                )
                .await
            }
            None => self.fetch_objects("d.objid = ?", &[SqlArg::Text(id)]).await,
        }
    }

    async fn select_objects_like_id(
        &self,
        pattern: &str,
        min_status: VolumeStatus,
    ) -> InventoryResult<Vec<CacheObject>> {
        self.fetch_objects(
            "d.objid LIKE ? AND v.status >= ? ORDER BY d.since DESC",
            &[SqlArg::Text(pattern), SqlArg::Int(min_status.as_int())],
        )
        .await
    }

    async fn select_due_for_check(
        &self,
        volume: Option<&str>,
        max: usize,
    ) -> InventoryResult<Vec<CacheObject>> {
        let cutoff = clock::now_ms() - self.grace_ms.load(Ordering::Relaxed);
        let limit = max as i64;
        let min_status = VolumeStatus::ForUpdate.as_int();
        match volume {
            Some(vol) => {
                self.fetch_objects(
                    "v.status >= ? AND d.checked <= ? AND v.name = ? \
                     ORDER BY d.checked ASC LIMIT ?",
                    &[
                        SqlArg::Int(min_status),
                        SqlArg::Int(cutoff),
                        SqlArg::Text(vol),
                        SqlArg::Int(limit),
                    ],
                )
                .await
            }
            None => {
                self.fetch_objects(
                    "v.status >= ? AND d.checked <= ? ORDER BY d.checked ASC LIMIT ?",
                    &[
                        SqlArg::Int(min_status),
                        SqlArg::Int(cutoff),
                        SqlArg::Int(limit),
                    ],
                )
                .await
            }
        }
    }

    async fn select_objects_to_purge(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> InventoryResult<Vec<CacheObject>> {
        // Nonzero refcounts protect an object only within the protection
        // window; after that the hold is presumed stale.
        let hold_cutoff = clock::now_ms() - self.protection_ms.load(Ordering::Relaxed);
        let candidates = self
            .fetch_objects(
                "v.name = ? AND v.status >= ? \
                 AND (COALESCE(json_extract(d.metadata, '$.refcount'), 0) <= 0 OR d.since <= ?) \
                 ORDER BY d.priority DESC, d.since ASC, d.size DESC",
                &[
                    SqlArg::Text(volume),
                    SqlArg::Int(VolumeStatus::ForUpdate.as_int()),
                    SqlArg::Int(hold_cutoff),
                ],
            )
            .await?;

        let mut selected = Vec::new();
        let mut total: i64 = 0;
        for co in candidates {
            if total >= required_bytes {
                break;
            }
            total += co.size.max(0);
            selected.push(co);
        }
        Ok(selected)
    }

    async fn get_volume_info(&self, name: &str) -> InventoryResult<VolumeInfo> {
        let row = sqlx::query_as::<_, VolumeRow>(
            "SELECT id, name, priority, capacity, status, metadata FROM volumes WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| InventoryError::VolumeNotFound(name.to_string()))?;

        let metadata = match &row.metadata {
            Some(text) => serde_json::from_str::<Value>(text)
                .map_err(|e| InventoryError::Metadata(format!("JSON parsing error: {e}")))?,
            None => Value::Object(Default::default()),
        };
        let roles = metadata
            .get("roles")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(VolumeInfo {
            name: row.name,
            capacity: row.capacity,
            priority: row.priority,
            status: VolumeStatus::from_int(row.status),
            roles,
            metadata,
        })
    }

    async fn get_volume_totals(&self, name: &str) -> InventoryResult<VolumeTotals> {
        let volid = self.volume_id(name).await?;
        let row = sqlx::query_as::<_, TotalsRow>(
            "SELECT COUNT(*) AS filecount, \
                    COALESCE(SUM(MAX(size, 0)), 0) AS totalsize, \
                    COALESCE(MAX(since), 0) AS since, \
                    COALESCE(MIN(checked), 0) AS checked \
             FROM objects WHERE volume = ?",
        )
        .bind(volid)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| InventoryError::Search(e.to_string()))?;
        Ok(Self::totals_from(row))
    }

    async fn volumes(&self) -> InventoryResult<Vec<String>> {
        let cached = self
            .volids
            .read()
            .expect("volume id cache poisoned")
            .as_ref()
            .map(|m| m.keys().cloned().collect::<Vec<_>>());
        let mut names = match cached {
            Some(names) => names,
            None => self.load_volumes().await?.into_keys().collect(),
        };
        names.sort();
        Ok(names)
    }

    async fn checksum_algorithms(&self) -> InventoryResult<Vec<String>> {
        let cached = self
            .algids
            .read()
            .expect("algorithm id cache poisoned")
            .as_ref()
            .map(|m| m.keys().cloned().collect::<Vec<_>>());
        let mut names = match cached {
            Some(names) => names,
            None => self.load_algorithms().await?.into_keys().collect(),
        };
        names.sort();
        Ok(names)
    }

    async fn summarize_dataset(&self, dsid: &str) -> InventoryResult<DatasetSummary> {
        let pattern = format!("{dsid}/%");
        let row: (i64, i64, i64, i64, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(MAX(d.size, 0)), 0), \
                    COALESCE(MAX(d.since), 0), \
                    COALESCE(MIN(d.checked), 0), \
                    MAX(json_extract(d.metadata, '$.ediid')), \
                    MAX(json_extract(d.metadata, '$.pdrid')) \
             FROM objects d JOIN volumes v ON d.volume = v.id \
             WHERE (d.objid = ? OR d.objid LIKE ?) AND v.status >= ?",
        )
        .bind(dsid)
        .bind(&pattern)
        .bind(VolumeStatus::ForGet.as_int())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| InventoryError::Search(e.to_string()))?;

        Ok(DatasetSummary {
            aipid: dsid.to_string(),
            filecount: row.0,
            totalsize: row.1,
            since: row.2,
            since_date: clock::to_rfc3339(row.2),
            checked: row.3,
            checked_date: clock::to_rfc3339(row.3),
            ediid: row.4,
            pdrid: row.5,
        })
    }

    async fn summarize_contents(
        &self,
        volume: Option<&str>,
    ) -> InventoryResult<Vec<DatasetSummary>> {
        let base = "SELECT CASE WHEN instr(d.objid, '/') > 0 \
                           THEN substr(d.objid, 1, instr(d.objid, '/') - 1) \
                           ELSE d.objid END AS aipid, \
                    COUNT(*), \
                    COALESCE(SUM(MAX(d.size, 0)), 0), \
                    COALESCE(MAX(d.since), 0), \
                    COALESCE(MIN(d.checked), 0), \
                    MAX(json_extract(d.metadata, '$.ediid')), \
                    MAX(json_extract(d.metadata, '$.pdrid')) \
             FROM objects d JOIN volumes v ON d.volume = v.id WHERE v.status >= ?";

        type Row = (String, i64, i64, i64, i64, Option<String>, Option<String>);
        let rows: Vec<Row> = match volume {
            Some(vol) => {
                let sql = format!("{base} AND v.name = ? GROUP BY aipid ORDER BY aipid");
                sqlx::query_as(&sql)
                    .bind(VolumeStatus::ForGet.as_int())
                    .bind(vol)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("{base} GROUP BY aipid ORDER BY aipid");
                sqlx::query_as(&sql)
                    .bind(VolumeStatus::ForGet.as_int())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| InventoryError::Search(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| DatasetSummary {
                aipid: row.0,
                filecount: row.1,
                totalsize: row.2,
                since: row.3,
                since_date: clock::to_rfc3339(row.3),
                checked: row.4,
                checked_date: clock::to_rfc3339(row.4),
                ediid: row.5,
                pdrid: row.6,
            })
            .collect())
    }
}

#[async_trait]
impl InventoryMutator for SqliteInventory {
    async fn add_object(
        &self,
        id: &str,
        volume: &str,
        name: &str,
        metadata: Option<&Value>,
    ) -> InventoryResult<CacheObject> {
        let since = clock::now_ms();
        let volid = self.volume_id(volume).await?;

        let mut size = SIZE_UNKNOWN;
        let mut checksum = None;
        let mut algorithm = DEFAULT_ALGORITHM.to_string();
        let mut priority = DEFAULT_PRIORITY as i64;
        if let Some(md) = metadata {
            size = lift_i64(md, "size", size)?;
            checksum = lift_str(md, "checksum")?;
            if let Some(alg) = lift_str(md, "checksumAlgorithm")? {
                algorithm = alg;
            }
            priority = lift_i64(md, "priority", priority)?;
        }

        // Algorithm names are registered lazily on first reference.
        let algid = match self.algorithm_id(&algorithm).await? {
            Some(id) => id,
            None => {
                self.register_algorithm(&algorithm).await?;
                self.algorithm_id(&algorithm).await?.ok_or_else(|| {
                    InventoryError::Internal(format!("algorithm vanished: {algorithm}"))
                })?
            }
        };

        let blob = metadata.map(|m| m.to_string());

        // Replace-then-insert at the (volume, name) coordinate, atomically
        // with respect to other readers and writers of the volume.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM objects WHERE volume = ? AND name = ?")
            .bind(volid)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO objects (objid, name, size, checksum, algorithm, priority, volume, \
                                  since, checked, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(size)
        .bind(&checksum)
        .bind(algid)
        .bind(priority)
        .bind(volid)
        .bind(since)
        .bind(&blob)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(CacheObject {
            id: id.to_string(),
            name: name.to_string(),
            volume: volume.to_string(),
            size,
            checksum,
            algorithm,
            priority: priority as i32,
            since,
            checked: 0,
            metadata: metadata.cloned().unwrap_or_else(|| Value::Object(Default::default())),
        })
    }

    async fn remove_object(&self, volume: &str, name: &str) -> InventoryResult<()> {
        let volid = self.volume_id(volume).await?;
        sqlx::query("DELETE FROM objects WHERE volume = ? AND name = ?")
            .bind(volid)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_checked(
        &self,
        volume: &str,
        name: &str,
        when_ms: i64,
    ) -> InventoryResult<()> {
        let volid = self.volume_id(volume).await?;
        sqlx::query("UPDATE objects SET checked = ? WHERE volume = ? AND name = ?")
            .bind(when_ms)
            .bind(volid)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_algorithm(&self, name: &str) -> InventoryResult<()> {
        if self.algorithm_id(name).await?.is_some() {
            return Ok(());
        }
        sqlx::query("INSERT OR IGNORE INTO algorithms (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.load_algorithms().await?;
        Ok(())
    }

    async fn register_volume(
        &self,
        name: &str,
        capacity: i64,
        metadata: Option<&Value>,
    ) -> InventoryResult<()> {
        let mut priority = None;
        let mut status = VolumeStatus::ForUpdate.as_int();
        if let Some(md) = metadata {
            priority = match md.get("priority") {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => Some(n.as_i64().ok_or_else(|| {
                    InventoryError::Metadata("priority: metadatum is not an integer".into())
                })?),
                Some(_) => {
                    return Err(InventoryError::Metadata(
                        "priority: metadatum has unexpected type".into(),
                    ))
                }
            };
            status = lift_i64(md, "status", status)?;
        }
        let blob = metadata.map(|m| m.to_string());

        sqlx::query(
            "INSERT INTO volumes (name, capacity, priority, status, metadata) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET capacity = excluded.capacity, \
                 priority = excluded.priority, status = excluded.status, \
                 metadata = excluded.metadata",
        )
        .bind(name)
        .bind(capacity)
        .bind(priority)
        .bind(status)
        .bind(&blob)
        .execute(&self.pool)
        .await?;

        self.load_volumes().await?;
        Ok(())
    }

    fn set_check_grace_period(&self, ms: i64) {
        self.grace_ms.store(ms.max(0), Ordering::Relaxed);
    }

    fn set_purge_protection_ttl(&self, ms: i64) {
        self.protection_ms.store(ms.max(0), Ordering::Relaxed);
    }
}

#[async_trait]
impl InventoryStore for SqliteInventory {
    async fn migrate(&self) -> InventoryResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> InventoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
