use crate::error::{Result, TideError};
use crate::store::SnapshotPayload;
use crate::types::{ObjectId, TransId};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A named snapshot recorded in the durable catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSnapshot {
    pub name: String,
    pub tid: TransId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Durable central tier. Persist writes flattened per-object payloads here;
/// fetch reads the latest payload at or below a TID back.
#[async_trait]
pub trait CentralBackend: Send + Sync {
    async fn put_snapshot(
        &self,
        container: &str,
        object: ObjectId,
        tid: TransId,
        payload: &SnapshotPayload,
    ) -> Result<()>;

    /// Latest payload at or below `tid`, with the TID it was persisted under.
    async fn get_snapshot(
        &self,
        container: &str,
        object: ObjectId,
        tid: TransId,
    ) -> Result<Option<(TransId, SnapshotPayload)>>;

    async fn record_named_snapshot(&self, container: &str, name: &str, tid: TransId) -> Result<()>;

    async fn list_named_snapshots(&self, container: &str) -> Result<Vec<NamedSnapshot>>;
}

/// Filesystem-backed central tier: content-hashed payload files written
/// tmp-then-rename, indexed by a single-file sqlite catalog.
pub struct FsCentralStore {
    base_path: PathBuf,
    db_path: PathBuf,
}

impl FsCentralStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let db_path = base_path.join("catalog.db");
        Self::with_catalog(base_path, db_path)
    }

    /// Open with the catalog at an explicit path instead of inside the base
    /// directory.
    pub fn with_catalog(base_path: PathBuf, db_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("payloads"))?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { base_path, db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                container TEXT NOT NULL,
                object_id TEXT NOT NULL,
                tid INTEGER NOT NULL,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (container, object_id, tid)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_lookup
             ON snapshots(container, object_id, tid)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS named_snapshots (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                container TEXT NOT NULL,
                name TEXT NOT NULL,
                tid INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (container, name)
            )",
            [],
        )?;

        Ok(())
    }

    fn payload_path(&self, hash: &str) -> PathBuf {
        let prefix = &hash[..2.min(hash.len())];
        self.base_path.join("payloads").join(prefix).join(hash)
    }

    async fn write_payload(&self, data: &[u8]) -> Result<String> {
        let hash = hex::encode(Sha256::digest(data));
        let path = self.payload_path(&hash);

        // Content-addressed: an existing file is already the right bytes.
        if path.exists() {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        Ok(hash)
    }

    async fn read_payload(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.payload_path(hash);
        if !path.exists() {
            return Err(TideError::NotFound(format!(
                "central payload missing: {}",
                hash
            )));
        }
        let data = fs::read(&path).await?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != hash {
            return Err(TideError::Internal(format!(
                "central payload corrupted: expected {}, got {}",
                hash, actual
            )));
        }
        Ok(data)
    }
}

#[async_trait]
impl CentralBackend for FsCentralStore {
    async fn put_snapshot(
        &self,
        container: &str,
        object: ObjectId,
        tid: TransId,
        payload: &SnapshotPayload,
    ) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        let size = data.len() as i64;
        let hash = self.write_payload(&data).await?;

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots
             (container, object_id, tid, hash, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                container,
                object.to_string(),
                tid as i64,
                hash,
                size,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        tracing::debug!(
            "persisted object {} of container {} at transaction {} ({} bytes)",
            object,
            container,
            tid,
            size
        );
        Ok(())
    }

    async fn get_snapshot(
        &self,
        container: &str,
        object: ObjectId,
        tid: TransId,
    ) -> Result<Option<(TransId, SnapshotPayload)>> {
        let row = {
            let conn = self.get_conn()?;
            conn.query_row(
                "SELECT tid, hash FROM snapshots
                 WHERE container = ?1 AND object_id = ?2 AND tid <= ?3
                 ORDER BY tid DESC LIMIT 1",
                params![container, object.to_string(), tid as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        };

        let Some((snap_tid, hash)) = row else {
            return Ok(None);
        };
        let data = self.read_payload(&hash).await?;
        let payload: SnapshotPayload = serde_json::from_slice(&data)?;
        Ok(Some((snap_tid as TransId, payload)))
    }

    async fn record_named_snapshot(&self, container: &str, name: &str, tid: TransId) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO named_snapshots (container, name, tid, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![container, name, tid as i64, chrono::Utc::now().to_rfc3339()],
        )?;
        tracing::info!(
            "recorded snapshot '{}' of container {} at transaction {}",
            name,
            container,
            tid
        );
        Ok(())
    }

    async fn list_named_snapshots(&self, container: &str) -> Result<Vec<NamedSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, tid, created_at FROM named_snapshots
             WHERE container = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![container], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, tid, created_at) = row?;
            let created_at = created_at.parse().map_err(|e| {
                TideError::Internal(format!("bad timestamp in catalog: {}", e))
            })?;
            out.push(NamedSnapshot {
                name,
                tid: tid as TransId,
                created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Extent;
    use bytes::Bytes;

    fn payload(data: &'static [u8]) -> SnapshotPayload {
        SnapshotPayload::Extents(vec![Extent {
            offset: 0,
            data: Bytes::from_static(data),
        }])
    }

    #[tokio::test]
    async fn test_put_get_latest_at_or_below_tid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCentralStore::new(dir.path().to_path_buf()).unwrap();
        let object = ObjectId::mint();

        store.put_snapshot("c1", object, 2, &payload(b"v2")).await.unwrap();
        store.put_snapshot("c1", object, 5, &payload(b"v5")).await.unwrap();

        let (tid, got) = store.get_snapshot("c1", object, 4).await.unwrap().unwrap();
        assert_eq!(tid, 2);
        match got {
            SnapshotPayload::Extents(extents) => assert_eq!(extents[0].data.as_ref(), b"v2"),
            other => panic!("unexpected payload: {:?}", other),
        }

        let (tid, _) = store.get_snapshot("c1", object, 9).await.unwrap().unwrap();
        assert_eq!(tid, 5);

        assert!(store.get_snapshot("c1", object, 1).await.unwrap().is_none());
        assert!(store
            .get_snapshot("other", object, 9)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_named_snapshots_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCentralStore::new(dir.path().to_path_buf()).unwrap();
        store.record_named_snapshot("c1", "weekly", 7).await.unwrap();
        store.record_named_snapshot("c1", "daily", 9).await.unwrap();
        store.record_named_snapshot("c2", "other", 1).await.unwrap();

        let snaps = store.list_named_snapshots("c1").await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "daily");
        assert_eq!(snaps[1].name, "weekly");
        assert_eq!(snaps[1].tid, 7);
    }
}
