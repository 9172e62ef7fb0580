//! Off-chain transfer between wallet accounts.
//!
//! The whole operation commits in one database transaction: destination
//! resolution, channel preconditions, session-key spending caps and the
//! double-entry postings per allocation.

use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::json;

use crate::amounts::{is_positive, parse_decimal};
use crate::db;
use crate::db::models::{AccountType, TransactionType};
use crate::ledger::{self, Ledger, Posting};
use crate::rpc::node::{AppState, HandlerResult, RpcContext, RpcError};

#[derive(Debug, Deserialize)]
struct TransferParams {
    destination: Option<String>,
    destination_user_tag: Option<String>,
    #[serde(default)]
    allocations: Vec<TransferAllocation>,
}

#[derive(Debug, Deserialize)]
struct TransferAllocation {
    asset: String,
    amount: serde_json::Value,
}

pub async fn handle_transfer(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: TransferParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid transfer params: {e}")))?;

    let wallet = ctx.user_id.clone();
    if params.allocations.is_empty() {
        return Err(RpcError::Parse(
            "transfer requires at least one allocation".to_string(),
        ));
    }

    let allocations = params
        .allocations
        .iter()
        .map(|a| {
            let amount = parse_decimal(&amount_string(&a.amount))
                .map_err(|e| RpcError::Parse(e.to_string()))?;
            if !is_positive(&amount) {
                return Err(RpcError::Parse(format!(
                    "allocation amount for {} must be positive",
                    a.asset
                )));
            }
            Ok((a.asset.clone(), amount))
        })
        .collect::<Result<Vec<(String, BigDecimal)>, RpcError>>()?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;

    let destination = resolve_destination(&mut tx, &params).await?;
    if destination == wallet {
        return Err(RpcError::Policy("cannot transfer to self".to_string()));
    }

    // The request itself must be signed by the wallet or a bound session key.
    let session_key_used = verify_request_signer(state, ctx, &wallet).await?;

    // Duplicate submissions are detected by the canonical request hash. The
    // hash is only recorded once the transfer commits, so a rejected attempt
    // can be retried verbatim.
    if state.msg_cache.exists(&ctx.req_hash) {
        return Err(RpcError::Duplicate(
            "duplicate transfer request".to_string(),
        ));
    }

    // Transfers require every channel allocation to be settled first.
    if db::wallet_has_nonzero_channel(&mut tx, &wallet)
        .await
        .map_err(RpcError::Internal)?
    {
        return Err(RpcError::Balance(
            "non-zero allocation on an open channel detected; settle the channel before transferring"
                .to_string(),
        ));
    }
    if db::wallet_has_challenged_channel(&mut tx, &wallet)
        .await
        .map_err(RpcError::Internal)?
    {
        return Err(RpcError::State(
            "a channel is in challenged status".to_string(),
        ));
    }

    let sender_ledger = Ledger::new(&wallet);
    let mut transactions = Vec::with_capacity(allocations.len());

    for (asset, amount) in &allocations {
        if !db::asset_symbol_exists(&mut tx, asset)
            .await
            .map_err(RpcError::Internal)?
        {
            return Err(RpcError::Policy(format!("unsupported asset {asset:?}")));
        }

        if let Some(key) = &session_key_used {
            state
                .session_keys
                .validate_spending(&mut tx, key, asset, amount)
                .await
                .map_err(|e| RpcError::Policy(e.to_string()))?;
        }

        let balance = sender_ledger
            .balance(&mut tx, &wallet, asset)
            .await
            .map_err(RpcError::Internal)?;
        if &balance < amount {
            return Err(RpcError::Balance(format!(
                "insufficient funds: {asset} balance {balance} < {amount}"
            )));
        }

        let tx_id = ledger::post_transfer(
            &mut tx,
            TransactionType::Transfer,
            Posting {
                account_id: &wallet,
                account_type: AccountType::Wallet,
                wallet: &wallet,
                session_key: session_key_used.as_deref(),
            },
            Posting {
                account_id: &destination,
                account_type: AccountType::Wallet,
                wallet: &destination,
                session_key: None,
            },
            asset,
            amount,
        )
        .await
        .map_err(RpcError::Internal)?;

        let info = ledger::get_ledger_transaction(&mut tx, tx_id)
            .await
            .map_err(RpcError::Internal)?
            .ok_or_else(|| RpcError::Internal(eyre::eyre!("transaction {tx_id} vanished")))?;
        transactions.push(info);
    }

    tx.commit().await.map_err(RpcError::from)?;
    state.msg_cache.add(ctx.req_hash);

    let payload = json!(&transactions);
    state.notifier.notify_balances(&state.db, &wallet).await;
    state.notifier.notify_balances(&state.db, &destination).await;
    state.notifier.notify_transfer(&wallet, payload.clone()).await;
    state.notifier.notify_transfer(&destination, payload).await;

    Ok(json!({ "transactions": transactions }))
}

/// Accept both string and numeric JSON amounts.
fn amount_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn resolve_destination(
    conn: &mut sqlx::PgConnection,
    params: &TransferParams,
) -> Result<String, RpcError> {
    if let Some(destination) = &params.destination {
        let destination = destination.to_lowercase();
        if destination.len() != 42 || !destination.starts_with("0x") {
            return Err(RpcError::Parse(format!(
                "invalid destination address {destination:?}"
            )));
        }
        return Ok(destination);
    }
    if let Some(tag) = &params.destination_user_tag {
        return db::resolve_user_tag(conn, tag)
            .await
            .map_err(RpcError::Internal)?
            .ok_or_else(|| RpcError::Policy(format!("unknown user tag {tag:?}")));
    }
    Err(RpcError::Parse(
        "destination or destination_user_tag is required".to_string(),
    ))
}

/// The request signature must recover to the caller's wallet or to a session
/// key bound to it. Returns the session key actually used, if any.
pub async fn verify_request_signer(
    state: &AppState,
    ctx: &RpcContext,
    wallet: &str,
) -> Result<Option<String>, RpcError> {
    let signers = ctx.recovered_signers();
    if signers.is_empty() {
        return Err(RpcError::Auth("request signature required".to_string()));
    }
    for address in &signers {
        if format!("{address:#x}") == wallet {
            return Ok(None);
        }
    }
    for address in &signers {
        let address = format!("{address:#x}");
        if state.session_keys.resolve(&address).await.as_deref() == Some(wallet) {
            return Ok(Some(address));
        }
    }
    Err(RpcError::Auth(
        "signature does not match the wallet or a bound session key".to_string(),
    ))
}
