//! Double-entry ledger engine.
//!
//! Balances are never stored; a balance is always Σ(credit − debit) over the
//! (account, asset, wallet) tuple. Every mutation happens inside the caller's
//! database transaction, and every ledger transaction row is written together
//! with exactly two balancing entries via [`post_transfer`].

use bigdecimal::{BigDecimal, Zero};
use eyre::{eyre, Result, WrapErr};
use sqlx::{PgConnection, PgPool};

use crate::db::models::{AccountType, LedgerEntry, TaggedLedgerTransaction, TransactionType};

/// Per-asset balance of one account.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AssetBalance {
    pub asset: String,
    pub amount: BigDecimal,
}

/// Ledger view bound to a wallet address.
#[derive(Debug, Clone)]
pub struct Ledger {
    wallet: String,
}

impl Ledger {
    pub fn new(wallet: impl Into<String>) -> Self {
        Self {
            wallet: wallet.into(),
        }
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    /// Append one entry. Positive amounts credit the account, negative
    /// amounts debit it by the absolute value; zero is rejected.
    pub async fn record(
        &self,
        conn: &mut PgConnection,
        account_id: &str,
        account_type: AccountType,
        asset: &str,
        amount: &BigDecimal,
        session_key: Option<&str>,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(eyre!("ledger entry amount cannot be zero"));
        }
        let (credit, debit) = if amount.sign() == bigdecimal::num_bigint::Sign::Minus {
            (BigDecimal::zero(), amount.abs())
        } else {
            (amount.clone(), BigDecimal::zero())
        };

        sqlx::query(
            r#"
            INSERT INTO ledger (account_id, account_type, asset_symbol, wallet, credit, debit,
                session_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account_id)
        .bind(account_type.as_i16())
        .bind(asset)
        .bind(&self.wallet)
        .bind(&credit)
        .bind(&debit)
        .bind(session_key)
        .execute(conn)
        .await
        .wrap_err_with(|| format!("Failed to record ledger entry for {account_id}/{asset}"))?;

        Ok(())
    }

    /// Σ(credit − debit) for this wallet on (account, asset).
    pub async fn balance(
        &self,
        conn: &mut PgConnection,
        account_id: &str,
        asset: &str,
    ) -> Result<BigDecimal> {
        let row: (BigDecimal,) = sqlx::query_as(
            r#"SELECT COALESCE(SUM(credit - debit), 0)
               FROM ledger
               WHERE account_id = $1 AND asset_symbol = $2 AND wallet = $3"#,
        )
        .bind(account_id)
        .bind(asset)
        .bind(&self.wallet)
        .fetch_one(conn)
        .await
        .wrap_err("Failed to compute ledger balance")?;

        Ok(row.0)
    }

    /// Every asset with a nonzero balance for this wallet on the account.
    pub async fn get_balances(
        &self,
        conn: &mut PgConnection,
        account_id: &str,
    ) -> Result<Vec<AssetBalance>> {
        let rows: Vec<(String, BigDecimal)> = sqlx::query_as(
            r#"SELECT asset_symbol, SUM(credit - debit) AS amount
               FROM ledger
               WHERE account_id = $1 AND wallet = $2
               GROUP BY asset_symbol
               HAVING SUM(credit - debit) != 0
               ORDER BY asset_symbol"#,
        )
        .bind(account_id)
        .bind(&self.wallet)
        .fetch_all(conn)
        .await
        .wrap_err("Failed to list ledger balances")?;

        Ok(rows
            .into_iter()
            .map(|(asset, amount)| AssetBalance { asset, amount })
            .collect())
    }

    /// Filtered entry listing, newest first.
    pub async fn get_entries(
        &self,
        conn: &mut PgConnection,
        account_id: Option<&str>,
        asset: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"SELECT id, account_id, account_type, asset_symbol, wallet, credit, debit,
                      session_key, created_at
               FROM ledger
               WHERE wallet = $1
                 AND ($2::TEXT IS NULL OR account_id = $2)
                 AND ($3::TEXT IS NULL OR asset_symbol = $3)
               ORDER BY id DESC
               LIMIT $4 OFFSET $5"#,
        )
        .bind(&self.wallet)
        .bind(account_id)
        .bind(asset)
        .bind(limit)
        .bind(offset)
        .fetch_all(conn)
        .await
        .wrap_err("Failed to list ledger entries")
    }
}

/// One side of a transfer posting.
#[derive(Debug, Clone)]
pub struct Posting<'a> {
    pub account_id: &'a str,
    pub account_type: AccountType,
    pub wallet: &'a str,
    pub session_key: Option<&'a str>,
}

/// Write a ledger transaction together with its two balancing entries: a
/// debit on `from` and a credit on `to`, both for `amount` of `asset`.
pub async fn post_transfer(
    conn: &mut PgConnection,
    tx_type: TransactionType,
    from: Posting<'_>,
    to: Posting<'_>,
    asset: &str,
    amount: &BigDecimal,
) -> Result<i64> {
    if amount.sign() == bigdecimal::num_bigint::Sign::Minus {
        return Err(eyre!("transfer amount cannot be negative: {amount}"));
    }

    let tx_id = record_ledger_transaction(
        conn,
        tx_type,
        from.account_id,
        to.account_id,
        asset,
        amount,
    )
    .await?;

    let debit_amount = -amount.clone();
    Ledger::new(from.wallet)
        .record(
            conn,
            from.account_id,
            from.account_type,
            asset,
            &debit_amount,
            from.session_key,
        )
        .await?;
    Ledger::new(to.wallet)
        .record(conn, to.account_id, to.account_type, asset, amount, to.session_key)
        .await?;

    Ok(tx_id)
}

/// Append the transaction row only; the caller owns the balancing entries.
pub async fn record_ledger_transaction(
    conn: &mut PgConnection,
    tx_type: TransactionType,
    from_account: &str,
    to_account: &str,
    asset: &str,
    amount: &BigDecimal,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ledger_transactions (tx_type, from_account, to_account, asset_symbol, amount)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(tx_type.as_i32())
    .bind(from_account)
    .bind(to_account)
    .bind(asset)
    .bind(amount)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to record ledger transaction")?;

    Ok(row.0)
}

pub async fn get_ledger_transaction(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<TaggedLedgerTransaction>> {
    sqlx::query_as::<_, TaggedLedgerTransaction>(
        r#"SELECT t.id, t.tx_type, t.from_account, ft.tag AS from_account_tag,
                  t.to_account, tt.tag AS to_account_tag, t.asset_symbol, t.amount, t.created_at
           FROM ledger_transactions t
           LEFT JOIN user_tags ft ON ft.wallet = t.from_account
           LEFT JOIN user_tags tt ON tt.wallet = t.to_account
           WHERE t.id = $1"#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .wrap_err("Failed to get ledger transaction")
}

/// Transactions touching an account, joined with user tags for both ends.
pub async fn list_ledger_transactions(
    pool: &PgPool,
    account: Option<&str>,
    asset: Option<&str>,
    tx_type: Option<i32>,
    limit: i64,
    offset: i64,
) -> Result<Vec<TaggedLedgerTransaction>> {
    sqlx::query_as::<_, TaggedLedgerTransaction>(
        r#"SELECT t.id, t.tx_type, t.from_account, ft.tag AS from_account_tag,
                  t.to_account, tt.tag AS to_account_tag, t.asset_symbol, t.amount, t.created_at
           FROM ledger_transactions t
           LEFT JOIN user_tags ft ON ft.wallet = t.from_account
           LEFT JOIN user_tags tt ON tt.wallet = t.to_account
           WHERE ($1::TEXT IS NULL OR t.from_account = $1 OR t.to_account = $1)
             AND ($2::TEXT IS NULL OR t.asset_symbol = $2)
             AND ($3::INT IS NULL OR t.tx_type = $3)
           ORDER BY t.created_at DESC
           LIMIT $4 OFFSET $5"#,
    )
    .bind(account)
    .bind(asset)
    .bind(tx_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to list ledger transactions")
}

/// Σ of debits tagged with a session key for one asset; the spending-cap
/// accounting input.
pub async fn session_key_spending(
    conn: &mut PgConnection,
    session_key: &str,
    asset: &str,
) -> Result<BigDecimal> {
    let row: (BigDecimal,) = sqlx::query_as(
        r#"SELECT COALESCE(SUM(debit), 0)
           FROM ledger
           WHERE session_key = $1 AND asset_symbol = $2"#,
    )
    .bind(session_key)
    .bind(asset)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to compute session key spending")?;

    Ok(row.0)
}
