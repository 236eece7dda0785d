//! Key stores: the authoritative SQLite table and the Redis-fronted cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use super::Principal;

const CACHE_TTL_SECS: u64 = 5 * 60;
const CACHE_KEY_PREFIX: &str = "aegis:key:";
const LAST_USED_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolve a key fingerprint to its principal. `Ok(None)` means the key is
/// unknown, revoked, or expired; that is not an error.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn lookup(&self, key_hash: &str) -> Result<Option<Principal>, StoreError>;
}

/// Full persisted row, used by the minting path and by tests.
#[derive(Clone, Debug)]
pub struct PersistedKey {
    pub key_hash: String,
    pub key_prefix: String,
    pub principal: Principal,
    pub status: String,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct SqliteKeyStore {
    path: PathBuf,
}

impl SqliteKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = Connection::open(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_key(&self, key: &PersistedKey) -> Result<(), StoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let allowed_models = serde_json::to_string(&key.principal.allowed_models)?;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = Connection::open(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO api_keys (
                    key_hash, key_prefix, id, organization_id, team_id, user_id,
                    name, status, max_classification, allowed_models,
                    rpm_limit, tpm_limit, daily_spend_limit_cents,
                    created_at, expires_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                rusqlite::params![
                    key.key_hash,
                    key.key_prefix,
                    key.principal.id,
                    key.principal.organization_id,
                    key.principal.team_id,
                    key.principal.user_id,
                    key.principal.name,
                    key.status,
                    key.principal.max_classification.as_str(),
                    allowed_models,
                    key.principal.rpm_limit,
                    key.principal.tpm_limit,
                    key.principal.daily_spend_limit_cents,
                    key.created_at,
                    key.principal.expires_at,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    fn query_active(
        conn: &Connection,
        key_hash: &str,
        now: i64,
    ) -> Result<Option<Principal>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, organization_id, team_id, user_id, name, max_classification,
                        allowed_models, rpm_limit, tpm_limit, daily_spend_limit_cents, expires_at
                 FROM api_keys
                 WHERE key_hash = ?1 AND status = 'active' AND expires_at > ?2",
                rusqlite::params![key_hash, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<u32>>(7)?,
                        row.get::<_, Option<u32>>(8)?,
                        row.get::<_, Option<i64>>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            organization_id,
            team_id,
            user_id,
            name,
            max_classification,
            allowed_models,
            rpm_limit,
            tpm_limit,
            daily_spend_limit_cents,
            expires_at,
        )) = row
        else {
            return Ok(None);
        };

        let allowed_models = match allowed_models {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => Vec::new(),
        };

        Ok(Some(Principal {
            id,
            organization_id,
            team_id,
            user_id,
            name,
            max_classification: crate::types::Classification::parse(&max_classification)
                .unwrap_or_default(),
            allowed_models,
            rpm_limit,
            tpm_limit,
            daily_spend_limit_cents,
            expires_at,
        }))
    }

    /// Best-effort `last_used_at` stamp. Detached; failures are invisible to
    /// the request that triggered it.
    fn touch_last_used(&self, key_id: String) {
        let path = self.path.clone();
        tokio::spawn(async move {
            let update = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
                let conn = Connection::open(path)?;
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                conn.execute(
                    "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, key_id],
                )?;
                Ok(())
            });
            match tokio::time::timeout(LAST_USED_DEADLINE, update).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => debug!(error = %err, "last_used_at update failed"),
                Ok(Err(err)) => debug!(error = %err, "last_used_at task failed"),
                Err(_) => debug!("last_used_at update timed out"),
            }
        });
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn lookup(&self, key_hash: &str) -> Result<Option<Principal>, StoreError> {
        let path = self.path.clone();
        let key_hash = key_hash.to_string();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let principal = tokio::task::spawn_blocking(
            move || -> Result<Option<Principal>, StoreError> {
                let conn = Connection::open(path)?;
                init_schema(&conn)?;
                Self::query_active(&conn, &key_hash, now)
            },
        )
        .await??;

        if let Some(principal) = &principal {
            self.touch_last_used(principal.id.clone());
        }
        Ok(principal)
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_keys (
            key_hash TEXT PRIMARY KEY,
            key_prefix TEXT NOT NULL,
            id TEXT NOT NULL,
            organization_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            user_id TEXT,
            name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            max_classification TEXT NOT NULL DEFAULT 'PUBLIC',
            allowed_models TEXT,
            rpm_limit INTEGER,
            tpm_limit INTEGER,
            daily_spend_limit_cents INTEGER,
            created_at INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER NOT NULL,
            last_used_at INTEGER,
            revoked_at INTEGER,
            revoked_reason TEXT
         );",
    )
}

/// Redis tier in front of the authoritative store. Cache failures degrade to
/// authoritative lookups; they never fail the request.
pub struct CachedKeyStore {
    redis: Option<redis::Client>,
    authoritative: Arc<dyn KeyStore>,
}

impl CachedKeyStore {
    pub fn new(redis: Option<redis::Client>, authoritative: Arc<dyn KeyStore>) -> Self {
        Self {
            redis,
            authoritative,
        }
    }

    async fn cache_get(&self, key_hash: &str) -> Option<Principal> {
        let client = self.redis.as_ref()?;
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        let cached: Option<Vec<u8>> = conn
            .get(format!("{CACHE_KEY_PREFIX}{key_hash}"))
            .await
            .ok()?;
        serde_json::from_slice(&cached?).ok()
    }

    async fn cache_put(&self, key_hash: &str, principal: &Principal) {
        let Some(client) = self.redis.as_ref() else {
            return;
        };
        let Ok(data) = serde_json::to_vec(principal) else {
            return;
        };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            return;
        };
        let result: Result<(), redis::RedisError> = conn
            .set_ex(format!("{CACHE_KEY_PREFIX}{key_hash}"), data, CACHE_TTL_SECS)
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to cache principal");
        }
    }
}

#[async_trait]
impl KeyStore for CachedKeyStore {
    async fn lookup(&self, key_hash: &str) -> Result<Option<Principal>, StoreError> {
        if let Some(principal) = self.cache_get(key_hash).await {
            return Ok(Some(principal));
        }

        let principal = self.authoritative.lookup(key_hash).await?;
        if let Some(principal) = &principal {
            self.cache_put(key_hash, principal).await;
        }
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Classification;

    fn temp_db(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "aegis-keys-{tag}-{}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn principal(expires_at: i64) -> Principal {
        Principal {
            id: "key-1".to_string(),
            organization_id: "org-1".to_string(),
            team_id: "team-1".to_string(),
            user_id: Some("user-1".to_string()),
            name: "ci".to_string(),
            max_classification: Classification::Confidential,
            allowed_models: vec!["test-model".to_string()],
            rpm_limit: Some(120),
            tpm_limit: None,
            daily_spend_limit_cents: Some(5_000),
            expires_at,
        }
    }

    fn persisted(expires_at: i64) -> PersistedKey {
        PersistedKey {
            key_hash: "abc123".to_string(),
            key_prefix: "aegis-test-abcdefgh".to_string(),
            principal: principal(expires_at),
            status: "active".to_string(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn round_trips_an_active_key() {
        let store = SqliteKeyStore::new(temp_db("roundtrip"));
        store.init().await.unwrap();
        let future = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
        store.insert_key(&persisted(future)).await.unwrap();

        let found = store.lookup("abc123").await.unwrap().unwrap();
        assert_eq!(found.id, "key-1");
        assert_eq!(found.max_classification, Classification::Confidential);
        assert_eq!(found.allowed_models, vec!["test-model".to_string()]);
        assert_eq!(found.rpm_limit, Some(120));
    }

    #[tokio::test]
    async fn expired_key_is_not_found() {
        let store = SqliteKeyStore::new(temp_db("expired"));
        store.init().await.unwrap();
        let past = time::OffsetDateTime::now_utc().unix_timestamp() - 10;
        store.insert_key(&persisted(past)).await.unwrap();

        assert!(store.lookup("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoked_key_is_not_found() {
        let store = SqliteKeyStore::new(temp_db("revoked"));
        store.init().await.unwrap();
        let future = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
        let mut key = persisted(future);
        key.status = "revoked".to_string();
        store.insert_key(&key).await.unwrap();

        assert!(store.lookup("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_hash_is_none_not_error() {
        let store = SqliteKeyStore::new(temp_db("unknown"));
        store.init().await.unwrap();
        assert!(store.lookup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cached_store_without_redis_delegates() {
        let sqlite = SqliteKeyStore::new(temp_db("cached"));
        sqlite.init().await.unwrap();
        let future = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
        sqlite.insert_key(&persisted(future)).await.unwrap();

        let cached = CachedKeyStore::new(None, Arc::new(sqlite));
        assert!(cached.lookup("abc123").await.unwrap().is_some());
        assert!(cached.lookup("missing").await.unwrap().is_none());
    }
}
