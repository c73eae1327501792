//! Reference-data cache used by the enricher.
//!
//! (env, company, kind, code) -> description with a TTL. The enricher
//! consults the cache first and only goes upstream on a miss; expired
//! entries read as misses and are overwritten in place.

use chrono::{Duration, SecondsFormat, Utc};
use millrace_db::{MillraceDb, Result};
use millrace_protocol::{defaults, EnvId};
use sqlx::SqlitePool;

use crate::now_rfc3339;

#[derive(Clone)]
pub struct ReferenceCache {
    pool: SqlitePool,
    ttl_secs: i64,
}

impl ReferenceCache {
    pub fn new(db: &MillraceDb) -> Self {
        Self::with_ttl(db, defaults::REFERENCE_CACHE_TTL_SECS)
    }

    pub fn with_ttl(db: &MillraceDb, ttl_secs: i64) -> Self {
        Self {
            pool: db.pool().clone(),
            ttl_secs,
        }
    }

    /// Cached description, or None on miss/expiry.
    pub async fn get(
        &self,
        env: &EnvId,
        company: &str,
        kind: &str,
        code: &str,
    ) -> Result<Option<String>> {
        let now = now_rfc3339();
        let description: Option<String> = sqlx::query_scalar(
            r#"
            SELECT description FROM mr_reference_cache
            WHERE env = ? AND company = ? AND kind = ? AND code = ? AND expires_at > ?
            "#,
        )
        .bind(env.as_str())
        .bind(company)
        .bind(kind)
        .bind(code)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(description)
    }

    pub async fn put(
        &self,
        env: &EnvId,
        company: &str,
        kind: &str,
        code: &str,
        description: &str,
    ) -> Result<()> {
        let expires_at = (Utc::now() + Duration::seconds(self.ttl_secs))
            .to_rfc3339_opts(SecondsFormat::Millis, false);
        sqlx::query(
            r#"
            INSERT INTO mr_reference_cache (env, company, kind, code, description, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (env, company, kind, code) DO UPDATE SET
                description = excluded.description,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(env.as_str())
        .bind(company)
        .bind(kind)
        .bind(code)
        .bind(description)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop expired entries. Called opportunistically after enrichment.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM mr_reference_cache WHERE expires_at <= ?")
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> MillraceDb {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    fn env() -> EnvId {
        EnvId::new("TRN").unwrap()
    }

    #[tokio::test]
    async fn hit_and_overwrite() {
        let cache = ReferenceCache::new(&db().await);
        cache.put(&env(), "100", "order_type", "MT1", "Make to order").await.unwrap();
        assert_eq!(
            cache.get(&env(), "100", "order_type", "MT1").await.unwrap(),
            Some("Make to order".to_string())
        );

        cache.put(&env(), "100", "order_type", "MT1", "Make to stock").await.unwrap();
        assert_eq!(
            cache.get(&env(), "100", "order_type", "MT1").await.unwrap(),
            Some("Make to stock".to_string())
        );
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let cache = ReferenceCache::with_ttl(&db().await, -1);
        cache.put(&env(), "100", "customer", "C1", "Acme").await.unwrap();
        assert_eq!(cache.get(&env(), "100", "customer", "C1").await.unwrap(), None);
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keyed_by_env_company_kind_code() {
        let cache = ReferenceCache::new(&db().await);
        cache.put(&env(), "100", "order_type", "MT1", "Make to order").await.unwrap();

        assert_eq!(cache.get(&env(), "200", "order_type", "MT1").await.unwrap(), None);
        assert_eq!(cache.get(&env(), "100", "customer", "MT1").await.unwrap(), None);
        let prd = EnvId::new("PRD").unwrap();
        assert_eq!(cache.get(&prd, "100", "order_type", "MT1").await.unwrap(), None);
    }
}
