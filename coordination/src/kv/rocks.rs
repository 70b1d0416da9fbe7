//! RocksDB-backed KV backend.
//!
//! Values are stored as JSON envelopes carrying an optional wall-clock
//! expiry so TTLs survive restarts. Read-modify-write operations
//! (`set_nx`, `incr`, `expire`) are serialised through a single mutex.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{parse_counter, KvError, KvResult, KvStore};

/// Column family holding every chatroom key
pub const CF_KV: &str = "kv";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    value: String,
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: ttl.map(|t| now_ms() + t.as_millis() as i64),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms() < at)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Persistent KV store on a single RocksDB column family
pub struct RocksKv {
    db: RwLock<DB>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RocksKv {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> KvResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_KV, Options::default())];
        let db = DB::open_cf_descriptors(&opts, &path, cfs)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_envelope(&self, key: &str) -> KvResult<Option<Envelope>> {
        let db = self
            .db
            .read()
            .map_err(|_| KvError::LockPoisoned)?;
        let cf = db
            .cf_handle(CF_KV)
            .ok_or_else(|| KvError::ColumnFamilyNotFound(CF_KV.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let env: Envelope =
                    serde_json::from_slice(&bytes).map_err(|e| KvError::Deserialization {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(env))
            }
            None => Ok(None),
        }
    }

    fn live(&self, key: &str) -> KvResult<Option<Envelope>> {
        match self.read_envelope(key)? {
            Some(env) if env.is_live() => Ok(Some(env)),
            Some(_) => {
                self.remove(key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn write_envelope(&self, key: &str, env: &Envelope) -> KvResult<()> {
        let db = self
            .db
            .read()
            .map_err(|_| KvError::LockPoisoned)?;
        let cf = db
            .cf_handle(CF_KV)
            .ok_or_else(|| KvError::ColumnFamilyNotFound(CF_KV.to_string()))?;
        let bytes = serde_json::to_vec(env).map_err(|e| KvError::Serialization(e.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        let db = self
            .db
            .read()
            .map_err(|_| KvError::LockPoisoned)?;
        let cf = db
            .cf_handle(CF_KV)
            .ok_or_else(|| KvError::ColumnFamilyNotFound(CF_KV.to_string()))?;
        db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RocksKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.live(key)?.map(|env| env.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_envelope(key, &Envelope::new(value, ttl))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let _guard = self.write_lock.lock().await;
        if self.live(key)?.is_some() {
            return Ok(false);
        }
        self.write_envelope(key, &Envelope::new(value, ttl))?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let _guard = self.write_lock.lock().await;
        let existed = self.live(key)?.is_some();
        self.remove(key)?;
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        let _guard = self.write_lock.lock().await;
        let current = self.live(key)?;
        let next = parse_counter(key, current.as_ref().map(|e| e.value.as_str()))? + 1;
        let env = Envelope {
            value: next.to_string(),
            expires_at_ms: current.and_then(|e| e.expires_at_ms),
        };
        self.write_envelope(key, &env)?;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let _guard = self.write_lock.lock().await;
        match self.live(key)? {
            Some(env) => {
                self.write_envelope(key, &Envelope::new(&env.value, Some(ttl)))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (RocksKv, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksKv::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_roundtrip_and_counter() {
        let (kv, _dir) = temp_store();
        kv.set("chatroom:state", "{\"phase\":\"DEBATE\"}", None)
            .await
            .unwrap();
        assert_eq!(
            kv.get("chatroom:state").await.unwrap().as_deref(),
            Some("{\"phase\":\"DEBATE\"}")
        );
        assert_eq!(kv.incr("chatroom:msg_index").await.unwrap(), 1);
        assert_eq!(kv.incr("chatroom:msg_index").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lock_semantics_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = RocksKv::open(dir.path()).unwrap();
            assert!(kv
                .set_nx("chatroom:lock", "sse_1", Some(Duration::from_secs(120)))
                .await
                .unwrap());
        }
        let kv = RocksKv::open(dir.path()).unwrap();
        assert!(!kv.set_nx("chatroom:lock", "sse_2", None).await.unwrap());
        assert!(kv.del("chatroom:lock").await.unwrap());
        assert!(kv.set_nx("chatroom:lock", "sse_2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_reads_as_absent() {
        let (kv, _dir) = temp_store();
        kv.set("gone", "x", Some(Duration::from_millis(0)))
            .await
            .unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);
    }
}
