#![allow(dead_code)]

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============ Channels ============

/// For inserting channels observed on-chain or drafted over RPC.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub channel_id: String,
    pub chain_id: i64,
    pub token: String,
    pub wallet: String,
    pub participant: String,
    pub raw_amount: BigDecimal,
    pub status: String,
    pub nonce: i64,
    pub adjudicator: String,
    pub challenge_period: i64,
    pub state_intent: i16,
    pub state_version: i64,
    pub state_data: String,
    pub state_allocations: serde_json::Value,
    pub server_signature: Option<String>,
}

const CHANNEL_SELECT: &str = r#"channel_id, chain_id, token, wallet, participant, raw_amount,
    status, nonce, adjudicator, challenge_period, state_intent, state_version, state_data,
    state_allocations, user_signature, server_signature, created_at, updated_at"#;

/// Insert a channel, or refresh an existing draft when the on-chain Created
/// event lands for a channel the RPC flow already persisted.
pub async fn upsert_channel(conn: &mut PgConnection, channel: &NewChannel) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO channels (channel_id, chain_id, token, wallet, participant, raw_amount,
            status, nonce, adjudicator, challenge_period, state_intent, state_version,
            state_data, state_allocations, server_signature)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (channel_id) DO UPDATE SET
            raw_amount = EXCLUDED.raw_amount,
            status = EXCLUDED.status,
            state_intent = EXCLUDED.state_intent,
            state_version = EXCLUDED.state_version,
            state_data = EXCLUDED.state_data,
            state_allocations = EXCLUDED.state_allocations,
            updated_at = NOW()
        "#,
    )
    .bind(&channel.channel_id)
    .bind(channel.chain_id)
    .bind(&channel.token)
    .bind(&channel.wallet)
    .bind(&channel.participant)
    .bind(&channel.raw_amount)
    .bind(&channel.status)
    .bind(channel.nonce)
    .bind(&channel.adjudicator)
    .bind(channel.challenge_period)
    .bind(channel.state_intent)
    .bind(channel.state_version)
    .bind(&channel.state_data)
    .bind(&channel.state_allocations)
    .bind(&channel.server_signature)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to upsert channel {}", channel.channel_id))?;

    Ok(())
}

pub async fn get_channel(conn: &mut PgConnection, channel_id: &str) -> Result<Option<Channel>> {
    let query = format!("SELECT {CHANNEL_SELECT} FROM channels WHERE channel_id = $1");
    sqlx::query_as::<_, Channel>(&query)
        .bind(channel_id)
        .fetch_optional(conn)
        .await
        .wrap_err("Failed to get channel")
}

/// Load a channel with a row lock, serializing concurrent state transitions.
pub async fn get_channel_for_update(
    conn: &mut PgConnection,
    channel_id: &str,
) -> Result<Option<Channel>> {
    let query = format!("SELECT {CHANNEL_SELECT} FROM channels WHERE channel_id = $1 FOR UPDATE");
    sqlx::query_as::<_, Channel>(&query)
        .bind(channel_id)
        .fetch_optional(conn)
        .await
        .wrap_err("Failed to lock channel")
}

/// Persist a channel state transition.
pub struct ChannelStateUpdate<'a> {
    pub status: &'a str,
    pub raw_amount: &'a BigDecimal,
    pub state_intent: i16,
    pub state_version: i64,
    pub state_data: &'a str,
    pub state_allocations: &'a serde_json::Value,
    pub user_signature: Option<&'a str>,
    pub server_signature: Option<&'a str>,
}

pub async fn update_channel_state(
    conn: &mut PgConnection,
    channel_id: &str,
    update: ChannelStateUpdate<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE channels SET status = $1, raw_amount = $2, state_intent = $3, state_version = $4,
            state_data = $5, state_allocations = $6,
            user_signature = COALESCE($7, user_signature),
            server_signature = COALESCE($8, server_signature),
            updated_at = NOW()
        WHERE channel_id = $9
        "#,
    )
    .bind(update.status)
    .bind(update.raw_amount)
    .bind(update.state_intent)
    .bind(update.state_version)
    .bind(update.state_data)
    .bind(update.state_allocations)
    .bind(update.user_signature)
    .bind(update.server_signature)
    .bind(channel_id)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to update channel {channel_id}"))?;

    Ok(())
}

pub async fn update_channel_status(
    conn: &mut PgConnection,
    channel_id: &str,
    status: &str,
) -> Result<()> {
    sqlx::query(r#"UPDATE channels SET status = $1, updated_at = NOW() WHERE channel_id = $2"#)
        .bind(status)
        .bind(channel_id)
        .execute(conn)
        .await
        .wrap_err_with(|| format!("Failed to update channel {channel_id} status to {status}"))?;

    Ok(())
}

pub async fn list_channels(
    pool: &PgPool,
    participant: Option<&str>,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Channel>> {
    let query = format!(
        "SELECT {CHANNEL_SELECT} FROM channels
         WHERE ($1::TEXT IS NULL OR wallet = $1)
           AND ($2::TEXT IS NULL OR status = $2)
         ORDER BY created_at DESC
         LIMIT $3 OFFSET $4"
    );
    sqlx::query_as::<_, Channel>(&query)
        .bind(participant)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list channels")
}

pub async fn open_channels_for_wallet(pool: &PgPool, wallet: &str) -> Result<Vec<Channel>> {
    let query = format!(
        "SELECT {CHANNEL_SELECT} FROM channels
         WHERE wallet = $1 AND status NOT IN ('closed')
         ORDER BY created_at DESC"
    );
    sqlx::query_as::<_, Channel>(&query)
        .bind(wallet)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list open channels")
}

/// True if the wallet holds any channel with a non-zero escrow allocation.
pub async fn wallet_has_nonzero_channel(conn: &mut PgConnection, wallet: &str) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(
            SELECT 1 FROM channels
            WHERE wallet = $1 AND status != 'closed' AND raw_amount != 0
        )"#,
    )
    .bind(wallet)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to check channel allocations")?;

    Ok(row.0)
}

pub async fn wallet_has_challenged_channel(conn: &mut PgConnection, wallet: &str) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(SELECT 1 FROM channels WHERE wallet = $1 AND status = 'challenged')"#,
    )
    .bind(wallet)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to check challenged channels")?;

    Ok(row.0)
}

/// True if the wallet already owns a live channel for (chain_id, token).
pub async fn channel_exists_for_token(
    pool: &PgPool,
    wallet: &str,
    chain_id: i64,
    token: &str,
) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(
            SELECT 1 FROM channels
            WHERE wallet = $1 AND chain_id = $2 AND token = $3 AND status NOT IN ('closed')
        )"#,
    )
    .bind(wallet)
    .bind(chain_id)
    .bind(token)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to check channel existence")?;

    Ok(row.0)
}

// ============ Assets ============

pub async fn upsert_asset(pool: &PgPool, asset: &Asset) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO assets (symbol, chain_id, token, decimals)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (chain_id, token) DO UPDATE SET symbol = $1, decimals = $4
        "#,
    )
    .bind(&asset.symbol)
    .bind(asset.chain_id)
    .bind(&asset.token)
    .bind(asset.decimals)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to upsert asset {}", asset.symbol))?;

    Ok(())
}

pub async fn list_assets(pool: &PgPool, chain_id: Option<i64>) -> Result<Vec<Asset>> {
    sqlx::query_as::<_, Asset>(
        r#"SELECT symbol, chain_id, token, decimals FROM assets
           WHERE ($1::BIGINT IS NULL OR chain_id = $1)
           ORDER BY symbol, chain_id"#,
    )
    .bind(chain_id)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to list assets")
}

pub async fn get_asset_by_token(
    conn: &mut PgConnection,
    chain_id: i64,
    token: &str,
) -> Result<Option<Asset>> {
    sqlx::query_as::<_, Asset>(
        r#"SELECT symbol, chain_id, token, decimals FROM assets
           WHERE chain_id = $1 AND LOWER(token) = LOWER($2)"#,
    )
    .bind(chain_id)
    .bind(token)
    .fetch_optional(conn)
    .await
    .wrap_err("Failed to get asset by token")
}

pub async fn get_asset_by_symbol(
    conn: &mut PgConnection,
    symbol: &str,
    chain_id: i64,
) -> Result<Option<Asset>> {
    sqlx::query_as::<_, Asset>(
        r#"SELECT symbol, chain_id, token, decimals FROM assets
           WHERE symbol = $1 AND chain_id = $2"#,
    )
    .bind(symbol)
    .bind(chain_id)
    .fetch_optional(conn)
    .await
    .wrap_err("Failed to get asset by symbol")
}

/// True if the symbol is known on any chain.
pub async fn asset_symbol_exists(conn: &mut PgConnection, symbol: &str) -> Result<bool> {
    let row: (bool,) =
        sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM assets WHERE symbol = $1)"#)
            .bind(symbol)
            .fetch_one(conn)
            .await
            .wrap_err("Failed to check asset symbol")?;

    Ok(row.0)
}

// ============ User tags ============

pub async fn get_user_tag(pool: &PgPool, wallet: &str) -> Result<Option<UserTag>> {
    sqlx::query_as::<_, UserTag>(r#"SELECT id, wallet, tag FROM user_tags WHERE wallet = $1"#)
        .bind(wallet)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get user tag")
}

pub async fn resolve_user_tag(conn: &mut PgConnection, tag: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT wallet FROM user_tags WHERE tag = $1"#)
            .bind(tag)
            .fetch_optional(conn)
            .await
            .wrap_err("Failed to resolve user tag")?;

    Ok(row.map(|r| r.0))
}

pub async fn tag_for_account(conn: &mut PgConnection, wallet: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT tag FROM user_tags WHERE wallet = $1"#)
            .bind(wallet)
            .fetch_optional(conn)
            .await
            .wrap_err("Failed to get tag for account")?;

    Ok(row.map(|r| r.0))
}

/// Insert a tag for the wallet unless one exists; returns the active tag.
pub async fn ensure_user_tag(pool: &PgPool, wallet: &str, candidate: &str) -> Result<String> {
    let row: (String,) = sqlx::query_as(
        r#"
        INSERT INTO user_tags (wallet, tag)
        VALUES ($1, $2)
        ON CONFLICT (wallet) DO UPDATE SET wallet = EXCLUDED.wallet
        RETURNING tag
        "#,
    )
    .bind(wallet)
    .bind(candidate)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to ensure user tag")?;

    Ok(row.0)
}

// ============ Contract events ============

/// Record an observed contract event. Returns false when the unique key
/// (chain_id, tx_hash, log_index) already exists, i.e. the event is a replay.
pub async fn record_contract_event(
    conn: &mut PgConnection,
    chain_id: i64,
    contract_address: &str,
    tx_hash: &str,
    log_index: i64,
    name: &str,
    block_number: i64,
    data: &serde_json::Value,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO contract_events (chain_id, contract_address, tx_hash, log_index, name,
            block_number, data)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
        "#,
    )
    .bind(chain_id)
    .bind(contract_address)
    .bind(tx_hash)
    .bind(log_index)
    .bind(name)
    .bind(block_number)
    .bind(data)
    .execute(conn)
    .await
    .wrap_err("Failed to record contract event")?;

    Ok(result.rows_affected() > 0)
}

// ============ Event cursors ============

pub async fn get_event_cursor(
    pool: &PgPool,
    chain_id: i64,
    contract_address: &str,
) -> Result<Option<(i64, i64)>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"SELECT last_block, last_index FROM event_cursors
           WHERE chain_id = $1 AND contract_address = $2"#,
    )
    .bind(chain_id)
    .bind(contract_address)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get event cursor")?;

    Ok(row)
}

pub async fn update_event_cursor(
    pool: &PgPool,
    chain_id: i64,
    contract_address: &str,
    last_block: i64,
    last_index: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_cursors (chain_id, contract_address, last_block, last_index)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (chain_id, contract_address) DO UPDATE SET
            last_block = $3, last_index = $4, updated_at = NOW()
        "#,
    )
    .bind(chain_id)
    .bind(contract_address)
    .bind(last_block)
    .bind(last_index)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update event cursor for chain {chain_id}"))?;

    Ok(())
}

// ============ Blockchain actions ============

pub async fn enqueue_action(
    conn: &mut PgConnection,
    channel_id: &str,
    chain_id: i64,
    action_type: &str,
    data: &serde_json::Value,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO blockchain_actions (channel_id, chain_id, action_type, data)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(channel_id)
    .bind(chain_id)
    .bind(action_type)
    .bind(data)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to enqueue blockchain action")?;

    Ok(row.get("id"))
}

const ACTION_SELECT: &str = r#"id, channel_id, chain_id, action_type, data, status, retries,
    retry_after, last_error, created_at, updated_at"#;

/// Pending actions whose backoff window has elapsed.
pub async fn due_actions(pool: &PgPool, limit: i64) -> Result<Vec<BlockchainAction>> {
    let query = format!(
        "SELECT {ACTION_SELECT} FROM blockchain_actions
         WHERE status = 'pending' AND (retry_after IS NULL OR retry_after <= NOW())
         ORDER BY created_at ASC
         LIMIT $1"
    );
    sqlx::query_as::<_, BlockchainAction>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get due actions")
}

pub async fn mark_action_in_flight(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE blockchain_actions SET status = 'in_flight', updated_at = NOW() WHERE id = $1"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark action {id} in flight"))?;

    Ok(())
}

pub async fn mark_action_done(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE blockchain_actions SET status = 'done', updated_at = NOW() WHERE id = $1"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark action {id} done"))?;

    Ok(())
}

pub async fn mark_action_retry(
    pool: &PgPool,
    id: i64,
    retry_after: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE blockchain_actions
           SET status = 'pending', retries = retries + 1, retry_after = $1, last_error = $2,
               updated_at = NOW()
           WHERE id = $3"#,
    )
    .bind(retry_after)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark action {id} for retry"))?;

    Ok(())
}

pub async fn mark_action_failed(pool: &PgPool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE blockchain_actions
           SET status = 'failed', retries = retries + 1, last_error = $1, updated_at = NOW()
           WHERE id = $2"#,
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark action {id} failed"))?;

    Ok(())
}

// ============ App sessions ============

const APP_SESSION_SELECT: &str = r#"session_id, protocol, application, challenge, nonce,
    participants, weights, quorum, session_data, version, status, created_at, updated_at"#;

#[derive(Debug, Clone)]
pub struct NewAppSession {
    pub session_id: String,
    pub protocol: String,
    pub application: String,
    pub challenge: i64,
    pub nonce: i64,
    pub participants: serde_json::Value,
    pub weights: serde_json::Value,
    pub quorum: i64,
    pub session_data: Option<String>,
}

pub async fn insert_app_session(conn: &mut PgConnection, session: &NewAppSession) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO app_sessions (session_id, protocol, application, challenge, nonce,
            participants, weights, quorum, session_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&session.session_id)
    .bind(&session.protocol)
    .bind(&session.application)
    .bind(session.challenge)
    .bind(session.nonce)
    .bind(&session.participants)
    .bind(&session.weights)
    .bind(session.quorum)
    .bind(&session.session_data)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to insert app session {}", session.session_id))?;

    Ok(())
}

pub async fn get_app_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Option<AppSession>> {
    let query = format!("SELECT {APP_SESSION_SELECT} FROM app_sessions WHERE session_id = $1");
    sqlx::query_as::<_, AppSession>(&query)
        .bind(session_id)
        .fetch_optional(conn)
        .await
        .wrap_err("Failed to get app session")
}

pub async fn get_app_session_for_update(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Option<AppSession>> {
    let query =
        format!("SELECT {APP_SESSION_SELECT} FROM app_sessions WHERE session_id = $1 FOR UPDATE");
    sqlx::query_as::<_, AppSession>(&query)
        .bind(session_id)
        .fetch_optional(conn)
        .await
        .wrap_err("Failed to lock app session")
}

pub async fn update_app_session_state(
    conn: &mut PgConnection,
    session_id: &str,
    version: i64,
    session_data: Option<&str>,
    status: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE app_sessions
        SET version = $1, session_data = COALESCE($2, session_data), status = $3,
            updated_at = NOW()
        WHERE session_id = $4
        "#,
    )
    .bind(version)
    .bind(session_data)
    .bind(status)
    .bind(session_id)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to update app session {session_id}"))?;

    Ok(())
}

pub async fn list_app_sessions(
    pool: &PgPool,
    participant: Option<&str>,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AppSession>> {
    let participant_filter = participant.map(|p| serde_json::json!([p]));
    let query = format!(
        "SELECT {APP_SESSION_SELECT} FROM app_sessions
         WHERE ($1::JSONB IS NULL OR participants @> $1)
           AND ($2::TEXT IS NULL OR status = $2)
         ORDER BY created_at DESC
         LIMIT $3 OFFSET $4"
    );
    sqlx::query_as::<_, AppSession>(&query)
        .bind(participant_filter)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list app sessions")
}

// ============ RPC history ============

pub async fn insert_rpc_record(
    pool: &PgPool,
    sender: &str,
    req_id: i64,
    method: &str,
    params: &serde_json::Value,
    ts: i64,
    req_sig: &serde_json::Value,
    response: Option<&serde_json::Value>,
    res_sig: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rpc_store (sender, req_id, method, params, ts, req_sig, response, res_sig)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(sender)
    .bind(req_id)
    .bind(method)
    .bind(params)
    .bind(ts)
    .bind(req_sig)
    .bind(response)
    .bind(res_sig)
    .execute(pool)
    .await
    .wrap_err("Failed to insert rpc record")?;

    Ok(())
}

pub async fn list_rpc_records(
    pool: &PgPool,
    sender: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<RpcRecord>> {
    sqlx::query_as::<_, RpcRecord>(
        r#"SELECT id, sender, req_id, method, params, ts, req_sig, response, res_sig, created_at
           FROM rpc_store WHERE sender = $1
           ORDER BY created_at DESC
           LIMIT $2 OFFSET $3"#,
    )
    .bind(sender)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to list rpc records")
}

// ============ User action logs ============

pub async fn log_user_action(
    pool: &PgPool,
    wallet: &str,
    action: &str,
    details: &serde_json::Value,
) -> Result<()> {
    sqlx::query(r#"INSERT INTO user_action_logs (wallet, action, details) VALUES ($1, $2, $3)"#)
        .bind(wallet)
        .bind(action)
        .bind(details)
        .execute(pool)
        .await
        .wrap_err("Failed to log user action")?;

    Ok(())
}
