//! Blockchain action worker.
//!
//! Pops pending actions (checkpoint, close, withdraw), submits them to the
//! custody contract with the broker key and retries failures with
//! exponential backoff until the retry cap.

use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::ProviderBuilder;
use chrono::Utc;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::contracts::{self, Custody, WireState};
use crate::db::{self, models::action_type, models::BlockchainAction};
use crate::metrics;
use crate::rpc::node::AppState;
use crate::signer::decode_sig_hex;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_SIZE: i64 = 10;
const MAX_RETRIES: i32 = 5;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Payload of a checkpoint or close action: the stored state plus both
/// signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub channel_id: String,
    pub state: WireState,
    pub user_signature: Option<String>,
    pub server_signature: Option<String>,
}

/// Payload of a withdraw action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawData {
    pub token: String,
    pub amount: String,
}

/// Backoff before retry `attempt` (1-indexed), doubling from the initial
/// delay up to the cap.
pub fn backoff_for_attempt(attempt: i32) -> Duration {
    let exp = attempt.max(1) as u32 - 1;
    let secs = INITIAL_BACKOFF_SECS.saturating_mul(1u64 << exp.min(10));
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// Run the worker loop until shutdown.
pub async fn run_action_worker(
    state: Arc<AppState>,
    mut shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    info!(
        poll_interval_ms = POLL_INTERVAL.as_millis() as u64,
        "Action worker started"
    );
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping action worker");
                return Ok(());
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let actions = match db::due_actions(&state.db, BATCH_SIZE).await {
            Ok(actions) => actions,
            Err(e) => {
                error!(error = %e, "failed to fetch pending actions");
                continue;
            }
        };

        for action in actions {
            process_action(&state, &action).await;
        }
    }
}

async fn process_action(state: &Arc<AppState>, action: &BlockchainAction) {
    if let Err(e) = db::mark_action_in_flight(&state.db, action.id).await {
        error!(action_id = action.id, error = %e, "failed to mark action in flight");
        return;
    }

    match submit_action(state, action).await {
        Ok(tx_hash) => {
            metrics::ACTIONS_SUBMITTED
                .with_label_values(&[action.action_type.as_str(), "done"])
                .inc();
            info!(
                action_id = action.id,
                action = %action.action_type,
                channel_id = %action.channel_id,
                tx_hash = %tx_hash,
                "action submitted"
            );
            if let Err(e) = db::mark_action_done(&state.db, action.id).await {
                error!(action_id = action.id, error = %e, "failed to mark action done");
            }
        }
        Err(e) => {
            let retries = action.retries + 1;
            let message = e.to_string();
            if retries >= MAX_RETRIES {
                metrics::ACTIONS_SUBMITTED
                    .with_label_values(&[action.action_type.as_str(), "failed"])
                    .inc();
                error!(
                    action_id = action.id,
                    action = %action.action_type,
                    error = %message,
                    "action failed permanently"
                );
                if let Err(e) = db::mark_action_failed(&state.db, action.id, &message).await {
                    error!(action_id = action.id, error = %e, "failed to mark action failed");
                }
            } else {
                let backoff = backoff_for_attempt(retries);
                let retry_after = Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                metrics::ACTIONS_SUBMITTED
                    .with_label_values(&[action.action_type.as_str(), "retry"])
                    .inc();
                warn!(
                    action_id = action.id,
                    action = %action.action_type,
                    retries,
                    backoff_secs = backoff.as_secs(),
                    error = %message,
                    "action failed, will retry"
                );
                if let Err(e) =
                    db::mark_action_retry(&state.db, action.id, retry_after, &message).await
                {
                    error!(action_id = action.id, error = %e, "failed to schedule retry");
                }
            }
        }
    }
}

async fn submit_action(state: &Arc<AppState>, action: &BlockchainAction) -> Result<String> {
    let chain = state
        .cfg
        .blockchain(action.chain_id as u32)
        .ok_or_else(|| eyre!("unknown chain {}", action.chain_id))?;
    let custody_address: Address = chain
        .custody_address
        .parse()
        .wrap_err("Invalid custody address")?;

    let wallet = EthereumWallet::from(state.signer.alloy_signer());
    let provider = ProviderBuilder::new().wallet(wallet).on_http(
        chain
            .rpc_url
            .parse()
            .wrap_err("Invalid RPC URL")?,
    );
    let custody = Custody::new(custody_address, provider);

    match action.action_type.as_str() {
        action_type::CHECKPOINT | action_type::CLOSE => {
            let data: CheckpointData = serde_json::from_value(action.data.clone())
                .wrap_err("Invalid checkpoint action data")?;
            let channel_id = contracts::parse_channel_id(&data.channel_id)?;
            let candidate = data.state.to_sol()?;
            let sigs = collect_sigs(&[&data.user_signature, &data.server_signature])?;

            let pending = if action.action_type == action_type::CHECKPOINT {
                custody.checkpoint(channel_id, candidate, sigs).send().await
            } else {
                custody.close(channel_id, candidate, sigs).send().await
            }
            .wrap_err("Transaction submission failed")?;

            let receipt = pending
                .get_receipt()
                .await
                .wrap_err("Failed to get transaction receipt")?;
            if !receipt.status() {
                return Err(eyre!("transaction reverted"));
            }
            Ok(format!("{:#x}", receipt.transaction_hash))
        }
        action_type::WITHDRAW => {
            let data: WithdrawData = serde_json::from_value(action.data.clone())
                .wrap_err("Invalid withdraw action data")?;
            let token: Address = data.token.parse().wrap_err("Invalid token address")?;
            let amount = U256::from_str_radix(&data.amount, 10)
                .wrap_err("Invalid withdraw amount")?;

            let pending = custody
                .withdraw(token, amount)
                .send()
                .await
                .wrap_err("Transaction submission failed")?;
            let receipt = pending
                .get_receipt()
                .await
                .wrap_err("Failed to get transaction receipt")?;
            if !receipt.status() {
                return Err(eyre!("transaction reverted"));
            }
            Ok(format!("{:#x}", receipt.transaction_hash))
        }
        other => Err(eyre!("unknown action type {other:?}")),
    }
}

fn collect_sigs(signatures: &[&Option<String>]) -> Result<Vec<Bytes>> {
    let mut out = Vec::new();
    for signature in signatures.iter().filter_map(|s| s.as_ref()) {
        let bytes = decode_sig_hex(signature).map_err(|e| eyre!("invalid signature: {e}"))?;
        out.push(Bytes::from(bytes));
    }
    if out.is_empty() {
        return Err(eyre!("action carries no signatures"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(6), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(100), Duration::from_secs(60));
    }

    #[test]
    fn test_checkpoint_data_round_trip() {
        let data = CheckpointData {
            channel_id: format!("0x{}", "11".repeat(32)),
            state: WireState {
                intent: 0,
                version: 5,
                state_data: "0x".to_string(),
                allocations: vec![],
            },
            user_signature: Some(format!("0x{}", "22".repeat(65))),
            server_signature: Some(format!("0x{}", "33".repeat(65))),
        };
        let value = serde_json::to_value(&data).unwrap();
        let back: CheckpointData = serde_json::from_value(value).unwrap();
        assert_eq!(back.state.version, 5);
        assert_eq!(back.channel_id, data.channel_id);
    }

    #[test]
    fn test_collect_sigs_requires_at_least_one() {
        assert!(collect_sigs(&[&None, &None]).is_err());
        let sig = Some(format!("0x{}", "ab".repeat(65)));
        let sigs = collect_sigs(&[&sig, &None]).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].len(), 65);
    }
}
