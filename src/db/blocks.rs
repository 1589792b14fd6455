//! Block intent model and repository.

use super::DbError;
use serde::Serialize;
use sqlx::SqlitePool;
use std::net::IpAddr;
use tracing::warn;

/// The unit of desired state: one source that should currently be blocked.
///
/// At most one active intent exists per `(address, port)` key; a new intent
/// for the same key replaces the previous one, resetting `created_at` and
/// `expires_at`. The store is the single source of truth for *intended*
/// state; the live rule set is a derived projection of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockIntent {
    /// Blocked source address.
    pub address: IpAddr,
    /// Destination port scope; absent covers all ports from the address.
    pub port: Option<u16>,
    /// Free-text classification (e.g. "auth_bruteforce"), advisory only.
    pub reason: Option<String>,
    /// Unix timestamp of intent creation.
    pub created_at: i64,
    /// Absolute expiry timestamp; absent means "block indefinitely".
    pub expires_at: Option<i64>,
}

impl BlockIntent {
    /// The uniqueness key. A whole-address intent and a port-scoped intent
    /// for the same source are distinct keys and coexist.
    pub fn key(&self) -> (IpAddr, Option<u16>) {
        (self.address, self.port)
    }
}

/// Repository for block intent bookkeeping.
pub struct BlockRepository<'a> {
    pool: &'a SqlitePool,
}

type IntentRow = (String, Option<i64>, Option<String>, i64, Option<i64>);

impl<'a> BlockRepository<'a> {
    /// Create a new block repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert-or-replace by `(address, port)` key, stamping creation time
    /// from the wall clock.
    pub async fn upsert(
        &self,
        address: IpAddr,
        port: Option<u16>,
        reason: Option<&str>,
        ttl: Option<i64>,
    ) -> Result<BlockIntent, DbError> {
        self.upsert_at(address, port, reason, ttl, chrono::Utc::now().timestamp())
            .await
    }

    /// Insert-or-replace with an explicit creation time.
    ///
    /// NULL ports defeat SQL UNIQUE constraints, so key replacement is a
    /// null-safe delete plus insert inside one transaction.
    pub async fn upsert_at(
        &self,
        address: IpAddr,
        port: Option<u16>,
        reason: Option<&str>,
        ttl: Option<i64>,
        now: i64,
    ) -> Result<BlockIntent, DbError> {
        let expires_at = ttl.map(|t| now + t);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blocks WHERE address = ? AND port IS ?")
            .bind(address.to_string())
            .bind(port.map(i64::from))
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO blocks (address, port, reason, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(address.to_string())
        .bind(port.map(i64::from))
        .bind(reason)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(BlockIntent {
            address,
            port,
            reason: reason.map(str::to_string),
            created_at: now,
            expires_at,
        })
    }

    /// Delete matching row(s); no-op if absent. Omitting the port removes
    /// every intent for the address, port-scoped ones included.
    pub async fn remove(&self, address: IpAddr, port: Option<u16>) -> Result<u64, DbError> {
        let result = match port {
            Some(p) => {
                sqlx::query("DELETE FROM blocks WHERE address = ? AND port = ?")
                    .bind(address.to_string())
                    .bind(i64::from(p))
                    .execute(self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM blocks WHERE address = ?")
                    .bind(address.to_string())
                    .execute(self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Delete exactly one `(address, port)` key, treating an absent port as
    /// part of the key rather than a wildcard. Used by expiry and rollback.
    pub async fn remove_key(&self, address: IpAddr, port: Option<u16>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM blocks WHERE address = ? AND port IS ?")
            .bind(address.to_string())
            .bind(port.map(i64::from))
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All current intents, most recent first.
    pub async fn list_all(&self) -> Result<Vec<BlockIntent>, DbError> {
        let rows = sqlx::query_as::<_, IntentRow>(
            r#"
            SELECT address, port, reason, created_at, expires_at
            FROM blocks
            ORDER BY created_at DESC, address
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_intent).collect())
    }

    /// Intents whose expiry has passed at `now`.
    pub async fn list_expired(&self, now: i64) -> Result<Vec<BlockIntent>, DbError> {
        let rows = sqlx::query_as::<_, IntentRow>(
            r#"
            SELECT address, port, reason, created_at, expires_at
            FROM blocks
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_intent).collect())
    }
}

fn row_to_intent((address, port, reason, created_at, expires_at): IntentRow) -> Option<BlockIntent> {
    let Ok(address) = address.parse() else {
        // Writes go through typed IpAddr, so this indicates external tampering.
        warn!(address = %address, "skipping intent row with unparsable address");
        return None;
    };
    Some(BlockIntent {
        address,
        port: port.and_then(|p| u16::try_from(p).ok()),
        reason,
        created_at,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::net::IpAddr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_key() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("1.2.3.4"), Some(22), Some("first"), Some(60), 100)
            .await
            .unwrap();
        repo.upsert_at(addr("1.2.3.4"), Some(22), Some("second"), None, 200)
            .await
            .unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason.as_deref(), Some("second"));
        assert_eq!(all[0].created_at, 200);
        assert_eq!(all[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_distinct_keys_coexist() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("1.2.3.4"), None, None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("1.2.3.4"), Some(22), None, None, 200)
            .await
            .unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_list_all_most_recent_first() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("10.0.0.1"), None, None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("10.0.0.2"), None, None, None, 300)
            .await
            .unwrap();
        repo.upsert_at(addr("10.0.0.3"), None, None, None, 200)
            .await
            .unwrap();

        let all = repo.list_all().await.unwrap();
        let order: Vec<i64> = all.iter().map(|i| i.created_at).collect();
        assert_eq!(order, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn test_remove_with_port_is_exact() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("1.2.3.4"), None, None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("1.2.3.4"), Some(22), None, None, 100)
            .await
            .unwrap();

        assert_eq!(repo.remove(addr("1.2.3.4"), Some(22)).await.unwrap(), 1);
        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, None);
    }

    #[tokio::test]
    async fn test_remove_without_port_covers_address() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("1.2.3.4"), None, None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("1.2.3.4"), Some(22), None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("5.6.7.8"), None, None, None, 100)
            .await
            .unwrap();

        assert_eq!(repo.remove(addr("1.2.3.4"), None).await.unwrap(), 2);
        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, addr("5.6.7.8"));
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();
        assert_eq!(repo.remove(addr("9.9.9.9"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_key_null_port_is_not_wildcard() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        repo.upsert_at(addr("1.2.3.4"), None, None, None, 100)
            .await
            .unwrap();
        repo.upsert_at(addr("1.2.3.4"), Some(22), None, None, 100)
            .await
            .unwrap();

        assert_eq!(repo.remove_key(addr("1.2.3.4"), None).await.unwrap(), 1);
        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, Some(22));
    }

    #[tokio::test]
    async fn test_list_expired_boundary() {
        let db = Database::new(":memory:").await.unwrap();
        let repo = db.blocks();

        // expires at 160
        repo.upsert_at(addr("1.2.3.4"), None, None, Some(60), 100)
            .await
            .unwrap();
        // unbounded
        repo.upsert_at(addr("5.6.7.8"), None, None, None, 100)
            .await
            .unwrap();

        assert!(repo.list_expired(159).await.unwrap().is_empty());
        let expired = repo.list_expired(160).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].address, addr("1.2.3.4"));
    }
}
