//! Custody event handlers: Created, Joined, Closed, Challenged, Resized.
//!
//! Dispatch is a tagged-variant match on topic0. Every handler runs in its
//! own database transaction and is idempotent through the contract-events
//! unique key; notifications go out only after commit.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{I256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use bigdecimal::{BigDecimal, Zero};
use eyre::{eyre, Result, WrapErr};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::amounts::raw_to_decimal;
use crate::config::BlockchainConfig;
use crate::contracts::{Custody, WireState};
use crate::db::{
    self,
    models::{action_type, channel_status, AccountType, Asset, Channel, TransactionType},
    NewChannel,
};
use crate::ledger::{self, Posting};
use crate::metrics;
use crate::rpc::node::AppState;
use crate::worker::CheckpointData;

struct LogMeta {
    tx_hash: String,
    log_index: i64,
    block_number: i64,
}

fn meta(log: &Log) -> Result<LogMeta> {
    Ok(LogMeta {
        tx_hash: format!(
            "{:#x}",
            log.transaction_hash
                .ok_or_else(|| eyre!("log missing transaction hash"))?
        ),
        log_index: log
            .log_index
            .ok_or_else(|| eyre!("log missing log index"))? as i64,
        block_number: log
            .block_number
            .ok_or_else(|| eyre!("log missing block number"))? as i64,
    })
}

/// Dispatch one custody log by topic; unknown topics are logged and skipped.
pub async fn handle_log(state: &Arc<AppState>, chain: &BlockchainConfig, log: &Log) -> Result<()> {
    let Some(topic0) = log.topic0() else {
        return Ok(());
    };

    match *topic0 {
        Custody::Created::SIGNATURE_HASH => handle_created(state, chain, log).await,
        Custody::Joined::SIGNATURE_HASH => handle_joined(state, chain, log).await,
        Custody::Closed::SIGNATURE_HASH => handle_closed(state, chain, log).await,
        Custody::Challenged::SIGNATURE_HASH => handle_challenged(state, chain, log).await,
        Custody::Resized::SIGNATURE_HASH => handle_resized(state, chain, log).await,
        other => {
            debug!(chain = %chain.name, topic = %other, "unknown event topic, skipping");
            Ok(())
        }
    }
}

async fn handle_created(
    state: &Arc<AppState>,
    chain: &BlockchainConfig,
    log: &Log,
) -> Result<()> {
    let event = Custody::Created::decode_log(&log.inner, true)
        .wrap_err("Failed to decode Created event")?
        .data;
    let meta = meta(log)?;
    let channel_id = format!("{:#x}", event.channelId);
    let wallet = format!("{:#x}", event.wallet);

    let participant_allocation = event.initial.allocations.first();
    let token = participant_allocation
        .map(|a| format!("{:#x}", a.token))
        .unwrap_or_default();
    let raw_amount = participant_allocation
        .map(|a| a.amount)
        .unwrap_or(U256::ZERO);

    let mut tx = state.db.begin().await?;
    let fresh = db::record_contract_event(
        &mut tx,
        chain.id as i64,
        &chain.custody_address,
        &meta.tx_hash,
        meta.log_index,
        "Created",
        meta.block_number,
        &json!({ "channel_id": channel_id, "wallet": wallet, "amount": raw_amount.to_string() }),
    )
    .await?;
    if !fresh {
        return Ok(());
    }

    let wire_state = WireState::from_sol(&event.initial);
    db::upsert_channel(
        &mut tx,
        &NewChannel {
            channel_id: channel_id.clone(),
            chain_id: chain.id as i64,
            token: token.clone(),
            wallet: wallet.clone(),
            participant: wallet.clone(),
            raw_amount: u256_to_decimal(raw_amount),
            status: channel_status::JOINING.to_string(),
            nonce: event.channel.nonce as i64,
            adjudicator: format!("{:#x}", event.channel.adjudicator),
            challenge_period: event.channel.challenge as i64,
            state_intent: event.initial.intent as i16,
            state_version: u256_to_i64(event.initial.version),
            state_data: wire_state.state_data.clone(),
            state_allocations: json!(wire_state.allocations),
            server_signature: None,
        },
    )
    .await?;

    // Participant-side allocation becomes the wallet's opening balance.
    if raw_amount > U256::ZERO {
        let asset = require_asset(&mut tx, chain.id as i64, &token).await?;
        let amount = raw_to_decimal(raw_amount, asset.decimals as u8);
        ledger::post_transfer(
            &mut tx,
            TransactionType::Deposit,
            Posting {
                account_id: &channel_id,
                account_type: AccountType::Channel,
                wallet: &wallet,
                session_key: None,
            },
            Posting {
                account_id: &wallet,
                account_type: AccountType::Wallet,
                wallet: &wallet,
                session_key: None,
            },
            &asset.symbol,
            &amount,
        )
        .await?;
    }
    tx.commit().await?;

    metrics::CONTRACT_EVENTS
        .with_label_values(&[chain.name.as_str(), "Created"])
        .inc();
    info!(chain = %chain.name, channel_id = %channel_id, wallet = %wallet, "channel created");

    notify_channel(state, &channel_id).await;
    state.notifier.notify_balances(&state.db, &wallet).await;
    Ok(())
}

async fn handle_joined(state: &Arc<AppState>, chain: &BlockchainConfig, log: &Log) -> Result<()> {
    let event = Custody::Joined::decode_log(&log.inner, true)
        .wrap_err("Failed to decode Joined event")?
        .data;
    let meta = meta(log)?;
    let channel_id = format!("{:#x}", event.channelId);

    let mut tx = state.db.begin().await?;
    let fresh = db::record_contract_event(
        &mut tx,
        chain.id as i64,
        &chain.custody_address,
        &meta.tx_hash,
        meta.log_index,
        "Joined",
        meta.block_number,
        &json!({ "channel_id": channel_id, "index": event.index.to_string() }),
    )
    .await?;
    if !fresh {
        return Ok(());
    }

    db::update_channel_status(&mut tx, &channel_id, channel_status::OPEN).await?;
    tx.commit().await?;

    metrics::CONTRACT_EVENTS
        .with_label_values(&[chain.name.as_str(), "Joined"])
        .inc();
    info!(chain = %chain.name, channel_id = %channel_id, "channel joined");
    notify_channel(state, &channel_id).await;
    Ok(())
}

async fn handle_closed(state: &Arc<AppState>, chain: &BlockchainConfig, log: &Log) -> Result<()> {
    let event = Custody::Closed::decode_log(&log.inner, true)
        .wrap_err("Failed to decode Closed event")?
        .data;
    let meta = meta(log)?;
    let channel_id = format!("{:#x}", event.channelId);

    let mut tx = state.db.begin().await?;
    let fresh = db::record_contract_event(
        &mut tx,
        chain.id as i64,
        &chain.custody_address,
        &meta.tx_hash,
        meta.log_index,
        "Closed",
        meta.block_number,
        &json!({ "channel_id": channel_id }),
    )
    .await?;
    if !fresh {
        return Ok(());
    }

    let channel = db::get_channel_for_update(&mut tx, &channel_id)
        .await?
        .ok_or_else(|| eyre!("Closed event for unknown channel {channel_id}"))?;
    let asset = require_asset(&mut tx, channel.chain_id, &channel.token).await?;

    let final_raw = event
        .finalState
        .allocations
        .first()
        .map(|a| a.amount)
        .unwrap_or(U256::ZERO);
    let final_amount = raw_to_decimal(final_raw, asset.decimals as u8);
    let prior_escrow = raw_decimal_to_amount(&channel.raw_amount, asset.decimals as u8);
    let residual = &prior_escrow - &final_amount;

    // Residual escrow flows back to the wallet before the withdrawal of the
    // final allocation is recorded.
    if residual.sign() == bigdecimal::num_bigint::Sign::Plus {
        ledger::post_transfer(
            &mut tx,
            TransactionType::EscrowUnlock,
            Posting {
                account_id: &channel_id,
                account_type: AccountType::Channel,
                wallet: &channel.wallet,
                session_key: None,
            },
            Posting {
                account_id: &channel.wallet,
                account_type: AccountType::Wallet,
                wallet: &channel.wallet,
                session_key: None,
            },
            &asset.symbol,
            &residual,
        )
        .await?;
    } else if residual.sign() == bigdecimal::num_bigint::Sign::Minus {
        ledger::post_transfer(
            &mut tx,
            TransactionType::EscrowLock,
            Posting {
                account_id: &channel.wallet,
                account_type: AccountType::Wallet,
                wallet: &channel.wallet,
                session_key: None,
            },
            Posting {
                account_id: &channel_id,
                account_type: AccountType::Channel,
                wallet: &channel.wallet,
                session_key: None,
            },
            &asset.symbol,
            &residual.abs(),
        )
        .await?;
    }

    if !final_amount.is_zero() {
        ledger::post_transfer(
            &mut tx,
            TransactionType::Withdrawal,
            Posting {
                account_id: &channel.wallet,
                account_type: AccountType::Wallet,
                wallet: &channel.wallet,
                session_key: None,
            },
            Posting {
                account_id: &channel_id,
                account_type: AccountType::Channel,
                wallet: &channel.wallet,
                session_key: None,
            },
            &asset.symbol,
            &final_amount,
        )
        .await?;
    }

    let wire_state = WireState::from_sol(&event.finalState);
    db::update_channel_state(
        &mut tx,
        &channel_id,
        db::ChannelStateUpdate {
            status: channel_status::CLOSED,
            raw_amount: &BigDecimal::zero(),
            state_intent: event.finalState.intent as i16,
            state_version: channel.state_version + 1,
            state_data: &wire_state.state_data,
            state_allocations: &json!(wire_state.allocations),
            user_signature: None,
            server_signature: None,
        },
    )
    .await?;
    tx.commit().await?;

    metrics::CONTRACT_EVENTS
        .with_label_values(&[chain.name.as_str(), "Closed"])
        .inc();
    info!(chain = %chain.name, channel_id = %channel_id, "channel closed");
    notify_channel(state, &channel_id).await;
    state.notifier.notify_balances(&state.db, &channel.wallet).await;
    Ok(())
}

async fn handle_challenged(
    state: &Arc<AppState>,
    chain: &BlockchainConfig,
    log: &Log,
) -> Result<()> {
    let event = Custody::Challenged::decode_log(&log.inner, true)
        .wrap_err("Failed to decode Challenged event")?
        .data;
    let meta = meta(log)?;
    let channel_id = format!("{:#x}", event.channelId);
    let event_version = u256_to_i64(event.state.version);

    let mut tx = state.db.begin().await?;
    let fresh = db::record_contract_event(
        &mut tx,
        chain.id as i64,
        &chain.custody_address,
        &meta.tx_hash,
        meta.log_index,
        "Challenged",
        meta.block_number,
        &json!({ "channel_id": channel_id, "version": event_version }),
    )
    .await?;
    if !fresh {
        return Ok(());
    }

    let channel = db::get_channel_for_update(&mut tx, &channel_id)
        .await?
        .ok_or_else(|| eyre!("Challenged event for unknown channel {channel_id}"))?;

    // A challenge with a stale state gets answered with the broker's newer
    // signed state via a checkpoint action.
    if event_version < channel.state_version {
        let data = CheckpointData {
            channel_id: channel_id.clone(),
            state: stored_wire_state(&channel),
            user_signature: channel.user_signature.clone(),
            server_signature: channel.server_signature.clone(),
        };
        db::enqueue_action(
            &mut tx,
            &channel_id,
            channel.chain_id,
            action_type::CHECKPOINT,
            &serde_json::to_value(&data).wrap_err("Failed to encode checkpoint data")?,
        )
        .await?;
        info!(
            chain = %chain.name,
            channel_id = %channel_id,
            challenged_version = event_version,
            stored_version = channel.state_version,
            "stale challenge, checkpoint queued"
        );
    }

    db::update_channel_state(
        &mut tx,
        &channel_id,
        db::ChannelStateUpdate {
            status: channel_status::CHALLENGED,
            raw_amount: &channel.raw_amount,
            state_intent: channel.state_intent,
            state_version: event_version,
            state_data: &channel.state_data,
            state_allocations: &channel.state_allocations,
            user_signature: None,
            server_signature: None,
        },
    )
    .await?;
    tx.commit().await?;

    metrics::CONTRACT_EVENTS
        .with_label_values(&[chain.name.as_str(), "Challenged"])
        .inc();
    notify_channel(state, &channel_id).await;
    Ok(())
}

async fn handle_resized(
    state: &Arc<AppState>,
    chain: &BlockchainConfig,
    log: &Log,
) -> Result<()> {
    let event = Custody::Resized::decode_log(&log.inner, true)
        .wrap_err("Failed to decode Resized event")?
        .data;
    let meta = meta(log)?;
    let channel_id = format!("{:#x}", event.channelId);

    let delta: I256 = event
        .deltaAllocations
        .iter()
        .fold(I256::ZERO, |acc, d| acc.saturating_add(*d));

    let mut tx = state.db.begin().await?;
    let fresh = db::record_contract_event(
        &mut tx,
        chain.id as i64,
        &chain.custody_address,
        &meta.tx_hash,
        meta.log_index,
        "Resized",
        meta.block_number,
        &json!({ "channel_id": channel_id, "delta": delta.to_string() }),
    )
    .await?;
    if !fresh {
        return Ok(());
    }

    let channel = db::get_channel_for_update(&mut tx, &channel_id)
        .await?
        .ok_or_else(|| eyre!("Resized event for unknown channel {channel_id}"))?;
    if channel.status != channel_status::RESIZING {
        // Escrow math is applied regardless; the channel account can go
        // negative here. Known anomaly, kept as observed.
        warn!(
            chain = %chain.name,
            channel_id = %channel_id,
            status = %channel.status,
            "Resized event on a channel not in resizing status"
        );
    }
    let asset = require_asset(&mut tx, channel.chain_id, &channel.token).await?;

    if !delta.is_zero() {
        let magnitude = raw_to_decimal(delta.unsigned_abs(), asset.decimals as u8);
        if delta.is_positive() {
            ledger::post_transfer(
                &mut tx,
                TransactionType::Deposit,
                Posting {
                    account_id: &channel_id,
                    account_type: AccountType::Channel,
                    wallet: &channel.wallet,
                    session_key: None,
                },
                Posting {
                    account_id: &channel.wallet,
                    account_type: AccountType::Wallet,
                    wallet: &channel.wallet,
                    session_key: None,
                },
                &asset.symbol,
                &magnitude,
            )
            .await?;
        } else {
            ledger::post_transfer(
                &mut tx,
                TransactionType::Withdrawal,
                Posting {
                    account_id: &channel.wallet,
                    account_type: AccountType::Wallet,
                    wallet: &channel.wallet,
                    session_key: None,
                },
                Posting {
                    account_id: &channel_id,
                    account_type: AccountType::Channel,
                    wallet: &channel.wallet,
                    session_key: None,
                },
                &asset.symbol,
                &magnitude,
            )
            .await?;
        }
    }

    let new_raw = &channel.raw_amount + i256_to_decimal(delta);
    db::update_channel_state(
        &mut tx,
        &channel_id,
        db::ChannelStateUpdate {
            status: channel_status::OPEN,
            raw_amount: &new_raw,
            state_intent: channel.state_intent,
            state_version: channel.state_version + 1,
            state_data: &channel.state_data,
            state_allocations: &channel.state_allocations,
            user_signature: None,
            server_signature: None,
        },
    )
    .await?;
    tx.commit().await?;

    metrics::CONTRACT_EVENTS
        .with_label_values(&[chain.name.as_str(), "Resized"])
        .inc();
    info!(chain = %chain.name, channel_id = %channel_id, delta = %delta, "channel resized");
    notify_channel(state, &channel_id).await;
    state.notifier.notify_balances(&state.db, &channel.wallet).await;
    Ok(())
}

// ============ Helpers ============

async fn require_asset(
    conn: &mut sqlx::PgConnection,
    chain_id: i64,
    token: &str,
) -> Result<Asset> {
    db::get_asset_by_token(conn, chain_id, token)
        .await?
        .ok_or_else(|| eyre!("no asset configured for token {token} on chain {chain_id}"))
}

async fn notify_channel(state: &Arc<AppState>, channel_id: &str) {
    let channel = async {
        let mut conn = state.db.acquire().await?;
        db::get_channel(&mut conn, channel_id).await
    }
    .await;
    if let Ok(Some(channel)) = channel {
        state.notifier.notify_channel_update(&channel).await;
    }
}

fn stored_wire_state(channel: &Channel) -> WireState {
    WireState {
        intent: channel.state_intent as u8,
        version: channel.state_version.max(0) as u64,
        state_data: channel.state_data.clone(),
        allocations: serde_json::from_value(channel.state_allocations.clone())
            .unwrap_or_default(),
    }
}

fn u256_to_decimal(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

/// Scale a stored raw-unit amount (NUMERIC(78,0)) down by 10^decimals.
fn raw_decimal_to_amount(raw: &BigDecimal, decimals: u8) -> BigDecimal {
    let (digits, exponent) = raw.clone().into_bigint_and_exponent();
    BigDecimal::new(digits, exponent + decimals as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_raw_decimal_scaling() {
        let raw = BigDecimal::from(1_500_000);
        assert_eq!(
            raw_decimal_to_amount(&raw, 6),
            BigDecimal::from_str("1.5").unwrap()
        );
        assert_eq!(raw_decimal_to_amount(&BigDecimal::zero(), 18), BigDecimal::zero());
    }

    #[test]
    fn test_u256_conversions() {
        assert_eq!(u256_to_i64(U256::from(42u64)), 42);
        assert_eq!(u256_to_i64(U256::MAX), i64::MAX);
        assert_eq!(u256_to_decimal(U256::from(7u64)), BigDecimal::from(7));
    }

    #[test]
    fn test_i256_decimal_keeps_sign() {
        let negative = -I256::try_from(9u64).unwrap();
        assert_eq!(i256_to_decimal(negative), BigDecimal::from(-9));
    }

    #[test]
    fn test_stored_wire_state_tolerates_bad_allocations() {
        let channel = Channel {
            channel_id: format!("0x{}", "00".repeat(32)),
            chain_id: 137,
            token: String::new(),
            wallet: String::new(),
            participant: String::new(),
            raw_amount: BigDecimal::zero(),
            status: channel_status::OPEN.to_string(),
            nonce: 1,
            adjudicator: String::new(),
            challenge_period: 3600,
            state_intent: 0,
            state_version: 5,
            state_data: "0x".to_string(),
            state_allocations: serde_json::json!("not an array"),
            user_signature: None,
            server_signature: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let state = stored_wire_state(&channel);
        assert_eq!(state.version, 5);
        assert!(state.allocations.is_empty());
    }
}

fn u256_to_i64(value: U256) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i256_to_decimal(value: I256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}
