//! Read-side handlers: catalog, channels, sessions, ledger views, history.

use serde::Deserialize;
use serde_json::json;

use crate::amounts::parse_decimal;
use crate::db;
use crate::db::models::{AccountType, TransactionType};
use crate::ledger::{self, Ledger};
use crate::rpc::node::{AppState, HandlerResult, RpcContext, RpcError};

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 500;

/// Offset/limit pagination shared by list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListOpts {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

impl ListOpts {
    pub fn page(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (limit, self.offset.max(0))
    }
}

fn params<T: serde::de::DeserializeOwned + Default>(ctx: &RpcContext) -> Result<T, RpcError> {
    if ctx.request.params().is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid params: {e}")))
}

pub async fn ping(_state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    ctx.response_method = Some("pong".to_string());
    Ok(json!({}))
}

pub async fn get_config(state: &AppState, _ctx: &mut RpcContext) -> HandlerResult {
    let blockchains: Vec<_> = state
        .cfg
        .blockchains
        .iter()
        .map(|b| {
            json!({
                "id": b.id,
                "name": b.name,
                "custody_address": b.custody_address,
                "adjudicator_address": b.adjudicator_address,
            })
        })
        .collect();
    Ok(json!({
        "broker_address": format!("{:#x}", state.signer.address()),
        "blockchains": blockchains,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct GetAssetsParams {
    chain_id: Option<i64>,
}

pub async fn get_assets(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetAssetsParams = params(ctx)?;
    let assets = db::list_assets(&state.db, p.chain_id)
        .await
        .map_err(RpcError::Internal)?;
    Ok(json!({ "assets": assets }))
}

#[derive(Debug, Default, Deserialize)]
struct GetChannelsParams {
    participant: Option<String>,
    status: Option<String>,
    #[serde(flatten)]
    list: ListOpts,
}

pub async fn get_channels(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetChannelsParams = params(ctx)?;
    let (limit, offset) = p.list.page();
    let participant = p.participant.map(|s| s.to_lowercase());
    let channels = db::list_channels(
        &state.db,
        participant.as_deref(),
        p.status.as_deref(),
        limit,
        offset,
    )
    .await
    .map_err(RpcError::Internal)?;
    Ok(json!({ "channels": channels }))
}

#[derive(Debug, Default, Deserialize)]
struct GetAppDefinitionParams {
    app_session_id: String,
}

pub async fn get_app_definition(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetAppDefinitionParams = params(ctx)?;
    let mut conn = state.db.acquire().await.map_err(RpcError::from)?;
    let session = db::get_app_session(&mut conn, &p.app_session_id)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::State("app session not found".to_string()))?;
    Ok(json!({
        "definition": {
            "protocol": session.protocol,
            "application": session.application,
            "participants": session.participants,
            "weights": session.weights,
            "quorum": session.quorum,
            "challenge": session.challenge,
            "nonce": session.nonce,
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct GetAppSessionsParams {
    participant: Option<String>,
    status: Option<String>,
    #[serde(flatten)]
    list: ListOpts,
}

pub async fn get_app_sessions(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetAppSessionsParams = params(ctx)?;
    let (limit, offset) = p.list.page();
    let participant = p.participant.map(|s| s.to_lowercase());
    let sessions = db::list_app_sessions(
        &state.db,
        participant.as_deref(),
        p.status.as_deref(),
        limit,
        offset,
    )
    .await
    .map_err(RpcError::Internal)?;
    Ok(json!({ "app_sessions": sessions }))
}

#[derive(Debug, Default, Deserialize)]
struct GetLedgerEntriesParams {
    account_id: Option<String>,
    asset: Option<String>,
    wallet: Option<String>,
    #[serde(flatten)]
    list: ListOpts,
}

pub async fn get_ledger_entries(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetLedgerEntriesParams = params(ctx)?;
    let wallet = p
        .wallet
        .map(|w| w.to_lowercase())
        .or_else(|| (!ctx.user_id.is_empty()).then(|| ctx.user_id.clone()))
        .ok_or_else(|| RpcError::Parse("wallet is required".to_string()))?;

    let (limit, offset) = p.list.page();
    let mut conn = state.db.acquire().await.map_err(RpcError::from)?;
    let entries = Ledger::new(&wallet)
        .get_entries(
            &mut conn,
            p.account_id.as_deref(),
            p.asset.as_deref(),
            limit,
            offset,
        )
        .await
        .map_err(RpcError::Internal)?;
    Ok(json!({ "ledger_entries": entries }))
}

#[derive(Debug, Default, Deserialize)]
struct GetLedgerTransactionsParams {
    account_id: Option<String>,
    asset: Option<String>,
    tx_type: Option<i32>,
    #[serde(flatten)]
    list: ListOpts,
}

pub async fn get_ledger_transactions(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetLedgerTransactionsParams = params(ctx)?;
    if let Some(tx_type) = p.tx_type {
        if TransactionType::from_i32(tx_type).is_none() {
            return Err(RpcError::Parse(format!("unknown tx_type {tx_type}")));
        }
    }
    let account = p
        .account_id
        .map(|a| a.to_lowercase())
        .or_else(|| (!ctx.user_id.is_empty()).then(|| ctx.user_id.clone()));
    let (limit, offset) = p.list.page();
    let transactions = ledger::list_ledger_transactions(
        &state.db,
        account.as_deref(),
        p.asset.as_deref(),
        p.tx_type,
        limit,
        offset,
    )
    .await
    .map_err(RpcError::Internal)?;
    Ok(json!({ "ledger_transactions": transactions }))
}

#[derive(Debug, Default, Deserialize)]
struct GetLedgerBalancesParams {
    account_id: Option<String>,
}

pub async fn get_ledger_balances(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: GetLedgerBalancesParams = params(ctx)?;
    let account = p
        .account_id
        .map(|a| a.to_lowercase())
        .unwrap_or_else(|| ctx.user_id.clone());
    let mut conn = state.db.acquire().await.map_err(RpcError::from)?;
    let balances = Ledger::new(&ctx.user_id)
        .get_balances(&mut conn, &account)
        .await
        .map_err(RpcError::Internal)?;
    Ok(json!({ "ledger_balances": balances }))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    #[serde(flatten)]
    list: ListOpts,
}

pub async fn get_rpc_history(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: HistoryParams = params(ctx)?;
    let (limit, offset) = p.list.page();
    let records = db::list_rpc_records(&state.db, &ctx.user_id, limit, offset)
        .await
        .map_err(RpcError::Internal)?;
    Ok(json!({ "rpc_entries": records }))
}

pub async fn get_session_keys(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: HistoryParams = params(ctx)?;
    let (limit, offset) = p.list.page();
    let keys = state
        .session_keys
        .list_for_wallet(&ctx.user_id, limit, offset)
        .await
        .map_err(RpcError::Internal)?;
    Ok(json!({ "session_keys": keys }))
}

#[derive(Debug, Default, Deserialize)]
struct RevokeSessionKeyParams {
    session_key: String,
}

pub async fn revoke_session_key(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: RevokeSessionKeyParams = params(ctx)?;
    state
        .session_keys
        .revoke(&ctx.user_id, &p.session_key)
        .await
        .map_err(|e| RpcError::Auth(e.to_string()))?;
    let _ = db::log_user_action(
        &state.db,
        &ctx.user_id,
        "revoke_session_key",
        &json!({ "session_key": p.session_key }),
    )
    .await;
    Ok(json!({ "success": true }))
}

pub async fn get_user_tag(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let tag = db::get_user_tag(&state.db, &ctx.user_id)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::State("no tag issued for wallet".to_string()))?;
    Ok(json!({ "user_tag": tag.tag }))
}

/// Test-only faucet: credit a wallet account directly.
#[derive(Debug, Default, Deserialize)]
struct MintParams {
    wallet: String,
    asset: String,
    amount: String,
}

pub async fn mint(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let p: MintParams = params(ctx)?;
    let wallet = p.wallet.to_lowercase();
    let amount = parse_decimal(&p.amount).map_err(|e| RpcError::Parse(e.to_string()))?;
    if !crate::amounts::is_positive(&amount) {
        return Err(RpcError::Parse("mint amount must be positive".to_string()));
    }

    // Funds come out of a synthetic faucet account so double entry holds
    // even for test credits.
    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    ledger::post_transfer(
        &mut tx,
        TransactionType::Deposit,
        ledger::Posting {
            account_id: "faucet",
            account_type: AccountType::Channel,
            wallet: "faucet",
            session_key: None,
        },
        ledger::Posting {
            account_id: &wallet,
            account_type: AccountType::Wallet,
            wallet: &wallet,
            session_key: None,
        },
        &p.asset,
        &amount,
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    state.notifier.notify_balances(&state.db, &wallet).await;
    Ok(json!({ "success": true }))
}
