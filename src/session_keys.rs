//! Delegated session keys with scoped allowances.
//!
//! The in-memory cache is the hot lookup path for request-signature
//! resolution; it is loaded once at startup and mutated strictly after the
//! corresponding database commit.

use std::collections::HashMap;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::{PgConnection, PgPool};
use tokio::sync::RwLock;
use tracing::info;

use crate::db::models::{AssetAllowance, SessionKey};
use crate::ledger;

/// Session keys issued for this application bypass spending and expiry
/// checks; they are the broker's own operator keys.
pub const CLEARNODE_APPLICATION: &str = "clearnode";

#[derive(Debug, thiserror::Error)]
pub enum SessionKeyError {
    #[error("session key not found")]
    NotFound,
    #[error("session key expired")]
    Expired,
    #[error("session key is bound to a different wallet")]
    BoundElsewhere,
    #[error("session key expiry must be in the future")]
    PastExpiry,
    #[error("no allowance for asset {0}")]
    NoAllowance(String),
    #[error("allowance exceeded for asset {asset}: spent {spent} + requested {requested} > {allowance}")]
    AllowanceExceeded {
        asset: String,
        spent: BigDecimal,
        requested: BigDecimal,
        allowance: BigDecimal,
    },
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

#[derive(Debug, Clone)]
struct CachedKey {
    wallet: String,
    application: String,
    allowances: Vec<AssetAllowance>,
    expires_at: DateTime<Utc>,
}

impl CachedKey {
    fn expired(&self) -> bool {
        self.application != CLEARNODE_APPLICATION && self.expires_at <= Utc::now()
    }
}

pub struct SessionKeyStore {
    db: PgPool,
    cache: RwLock<HashMap<String, CachedKey>>,
}

impl SessionKeyStore {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Populate the cache with every non-expired key. Called once at startup.
    pub async fn load_from_db(&self) -> Result<()> {
        let rows = sqlx::query_as::<_, SessionKey>(
            r#"SELECT address, wallet, application, allowances, scope, expires_at, created_at
               FROM session_keys
               WHERE expires_at > NOW() OR application = $1"#,
        )
        .bind(CLEARNODE_APPLICATION)
        .fetch_all(&self.db)
        .await
        .wrap_err("Failed to load session keys")?;

        let mut cache = self.cache.write().await;
        cache.clear();
        for row in &rows {
            cache.insert(row.address.to_lowercase(), cached_from_row(row));
        }
        info!(count = rows.len(), "Session key cache loaded");
        Ok(())
    }

    /// Store a session key, atomically replacing any prior key for the same
    /// (wallet, application). The cache is updated only after commit.
    pub async fn add(
        &self,
        wallet: &str,
        address: &str,
        application: &str,
        scope: &str,
        allowances: &[AssetAllowance],
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionKeyError> {
        if expires_at <= Utc::now() {
            return Err(SessionKeyError::PastExpiry);
        }

        let address = address.to_lowercase();
        let wallet = wallet.to_lowercase();

        let mut tx = self
            .db
            .begin()
            .await
            .wrap_err("Failed to begin session key transaction")
            .map_err(SessionKeyError::Other)?;

        let existing: Option<(String,)> =
            sqlx::query_as(r#"SELECT wallet FROM session_keys WHERE address = $1"#)
                .bind(&address)
                .fetch_optional(&mut *tx)
                .await
                .wrap_err("Failed to check session key binding")
                .map_err(SessionKeyError::Other)?;
        if let Some((bound,)) = existing {
            if bound.to_lowercase() != wallet {
                return Err(SessionKeyError::BoundElsewhere);
            }
        }

        let evicted: Vec<(String,)> = sqlx::query_as(
            r#"DELETE FROM session_keys
               WHERE (wallet = $1 AND application = $2) OR address = $3
               RETURNING address"#,
        )
        .bind(&wallet)
        .bind(application)
        .bind(&address)
        .fetch_all(&mut *tx)
        .await
        .wrap_err("Failed to evict prior session key")
        .map_err(SessionKeyError::Other)?;

        let allowances_json =
            serde_json::to_value(allowances).unwrap_or(serde_json::Value::Array(vec![]));
        sqlx::query(
            r#"
            INSERT INTO session_keys (address, wallet, application, allowances, scope, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&address)
        .bind(&wallet)
        .bind(application)
        .bind(&allowances_json)
        .bind(scope)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to insert session key")
        .map_err(SessionKeyError::Other)?;

        tx.commit()
            .await
            .wrap_err("Failed to commit session key")
            .map_err(SessionKeyError::Other)?;

        let mut cache = self.cache.write().await;
        for (evicted_address,) in evicted {
            cache.remove(&evicted_address.to_lowercase());
        }
        cache.insert(
            address,
            CachedKey {
                wallet,
                application: application.to_string(),
                allowances: allowances.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    /// The wallet an active session key signs for. Expired entries are
    /// lazily evicted.
    pub async fn resolve(&self, address: &str) -> Option<String> {
        let address = address.to_lowercase();
        {
            let cache = self.cache.read().await;
            match cache.get(&address) {
                Some(key) if !key.expired() => return Some(key.wallet.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.cache.write().await.remove(&address);
        None
    }

    /// Like [`resolve`](Self::resolve), but the key must also have been
    /// issued for the given application. Keys delegated to one application
    /// carry no authority in another.
    pub async fn resolve_for_application(
        &self,
        address: &str,
        application: &str,
    ) -> Option<String> {
        let address = address.to_lowercase();
        {
            let cache = self.cache.read().await;
            match cache.get(&address) {
                Some(key) if !key.expired() => {
                    if key.application == application {
                        return Some(key.wallet.clone());
                    }
                    return None;
                }
                Some(_) => {}
                None => return None,
            }
        }
        self.cache.write().await.remove(&address);
        None
    }

    /// Distinguish active / expired / bound-elsewhere for (wallet, address).
    pub async fn check_exists(&self, wallet: &str, address: &str) -> Result<(), SessionKeyError> {
        let cache = self.cache.read().await;
        let key = cache
            .get(&address.to_lowercase())
            .ok_or(SessionKeyError::NotFound)?;
        if key.wallet != wallet.to_lowercase() {
            return Err(SessionKeyError::BoundElsewhere);
        }
        if key.expired() {
            return Err(SessionKeyError::Expired);
        }
        Ok(())
    }

    /// Enforce the per-asset spending cap: the sum of ledger debits tagged
    /// with this key plus the requested amount must stay within the
    /// allowance. Runs inside the caller's transaction.
    pub async fn validate_spending(
        &self,
        conn: &mut PgConnection,
        address: &str,
        asset: &str,
        requested: &BigDecimal,
    ) -> Result<(), SessionKeyError> {
        let key = {
            let cache = self.cache.read().await;
            cache
                .get(&address.to_lowercase())
                .cloned()
                .ok_or(SessionKeyError::NotFound)?
        };
        if key.application == CLEARNODE_APPLICATION {
            return Ok(());
        }
        if key.expired() {
            return Err(SessionKeyError::Expired);
        }

        let allowance = key
            .allowances
            .iter()
            .find(|a| a.asset == asset)
            .ok_or_else(|| SessionKeyError::NoAllowance(asset.to_string()))?;
        let allowance: BigDecimal = allowance
            .amount
            .parse()
            .map_err(|e| SessionKeyError::Other(eyre::eyre!("bad allowance amount: {e}")))?;

        let spent = ledger::session_key_spending(conn, &address.to_lowercase(), asset)
            .await
            .map_err(SessionKeyError::Other)?;

        if &spent + requested > allowance {
            return Err(SessionKeyError::AllowanceExceeded {
                asset: asset.to_string(),
                spent,
                requested: requested.clone(),
                allowance,
            });
        }
        Ok(())
    }

    /// Remove a key the wallet owns; cache update after commit.
    pub async fn revoke(&self, wallet: &str, address: &str) -> Result<(), SessionKeyError> {
        let address = address.to_lowercase();
        let deleted = sqlx::query(
            r#"DELETE FROM session_keys WHERE address = $1 AND wallet = $2"#,
        )
        .bind(&address)
        .bind(wallet.to_lowercase())
        .execute(&self.db)
        .await
        .wrap_err("Failed to revoke session key")
        .map_err(SessionKeyError::Other)?;

        if deleted.rows_affected() == 0 {
            return Err(SessionKeyError::NotFound);
        }
        self.cache.write().await.remove(&address);
        Ok(())
    }

    pub async fn list_for_wallet(
        &self,
        wallet: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionKey>> {
        sqlx::query_as::<_, SessionKey>(
            r#"SELECT address, wallet, application, allowances, scope, expires_at, created_at
               FROM session_keys
               WHERE wallet = $1
               ORDER BY created_at DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(wallet.to_lowercase())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await
        .wrap_err("Failed to list session keys")
    }
}

fn cached_from_row(row: &SessionKey) -> CachedKey {
    CachedKey {
        wallet: row.wallet.to_lowercase(),
        application: row.application.clone(),
        allowances: serde_json::from_value(row.allowances.clone()).unwrap_or_default(),
        expires_at: row.expires_at,
    }
}
