//! Channel request flow: create, resize, close.
//!
//! Each call drafts an unsigned state, signs it with the broker key and
//! returns the signed payload for the client to submit on-chain. The ledger
//! is only mutated when the corresponding custody event is observed.

use std::str::FromStr;

use alloy::primitives::{Address, I256, U256};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::json;

use crate::amounts::{decimal_to_raw, parse_decimal};
use crate::contracts::{self, Custody, WireState};
use crate::db::{self, models::channel_status, models::intent, models::Channel, NewChannel};
use crate::ledger::Ledger;
use crate::rpc::node::{AppState, HandlerResult, RpcContext, RpcError};
use crate::rpc::wire;

/// Default on-chain challenge window for broker-drafted channels, seconds.
const DEFAULT_CHALLENGE_PERIOD: u64 = 3600;

#[derive(Debug, Deserialize)]
struct CreateChannelParams {
    chain_id: u32,
    token: String,
}

pub async fn create_channel(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: CreateChannelParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid create_channel params: {e}")))?;

    let wallet = ctx.user_id.clone();
    let wallet_address = parse_address(&wallet)?;
    let broker = state.signer.address();

    let chain = state
        .cfg
        .blockchain(params.chain_id)
        .ok_or_else(|| RpcError::Policy(format!("unsupported blockchain {}", params.chain_id)))?;

    let mut conn = state.db.acquire().await.map_err(RpcError::from)?;
    let asset = db::get_asset_by_token(&mut conn, params.chain_id as i64, &params.token)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::Policy(format!("unsupported token {:?}", params.token)))?;

    if db::channel_exists_for_token(&state.db, &wallet, params.chain_id as i64, &asset.token)
        .await
        .map_err(RpcError::Internal)?
    {
        return Err(RpcError::State(format!(
            "a channel for {} on chain {} already exists",
            asset.symbol, params.chain_id
        )));
    }

    let adjudicator = parse_address(&chain.adjudicator_address)?;
    let token_address = parse_address(&asset.token)?;

    let definition = Custody::ChannelDef {
        participants: vec![wallet_address, broker],
        adjudicator,
        challenge: DEFAULT_CHALLENGE_PERIOD,
        nonce: wire::now_ms(),
    };
    let channel_id = contracts::channel_id(&definition, params.chain_id as u64);

    let initial = Custody::State {
        intent: intent::INITIALIZE as u8,
        version: U256::ZERO,
        data: Default::default(),
        allocations: vec![
            Custody::Allocation {
                destination: wallet_address,
                token: token_address,
                amount: U256::ZERO,
            },
            Custody::Allocation {
                destination: broker,
                token: token_address,
                amount: U256::ZERO,
            },
        ],
    };

    let server_signature = sign_state(state, channel_id, &initial)?;
    let wire_state = WireState::from_sol(&initial);

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    db::upsert_channel(
        &mut tx,
        &NewChannel {
            channel_id: format!("{channel_id:#x}"),
            chain_id: params.chain_id as i64,
            token: asset.token.clone(),
            wallet: wallet.clone(),
            participant: wallet.clone(),
            raw_amount: BigDecimal::from(0),
            status: channel_status::JOINING.to_string(),
            nonce: definition.nonce as i64,
            adjudicator: chain.adjudicator_address.clone(),
            challenge_period: DEFAULT_CHALLENGE_PERIOD as i64,
            state_intent: intent::INITIALIZE,
            state_version: 0,
            state_data: "0x".to_string(),
            state_allocations: json!(wire_state.allocations),
            server_signature: Some(server_signature.clone()),
        },
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    Ok(json!({
        "channel_id": format!("{channel_id:#x}"),
        "channel": {
            "participants": [wallet, format!("{broker:#x}")],
            "adjudicator": chain.adjudicator_address,
            "challenge": DEFAULT_CHALLENGE_PERIOD,
            "nonce": definition.nonce,
        },
        "state": wire_state,
        "server_signature": server_signature,
    }))
}

#[derive(Debug, Deserialize)]
struct ResizeChannelParams {
    channel_id: String,
    resize_amount: Option<String>,
    allocate_amount: Option<String>,
    funds_destination: String,
}

pub async fn resize_channel(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: ResizeChannelParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid resize_channel params: {e}")))?;

    let wallet = ctx.user_id.clone();
    let destination = parse_address(&params.funds_destination)?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    let channel = load_owned_channel(&mut tx, &params.channel_id, &wallet).await?;
    if channel.status != channel_status::OPEN {
        return Err(RpcError::State(format!(
            "channel must be open to resize, status is {}",
            channel.status
        )));
    }

    let asset = db::get_asset_by_token(&mut tx, channel.chain_id, &channel.token)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::Policy(format!("unsupported token {:?}", channel.token)))?;

    let resize_delta = signed_raw(params.resize_amount.as_deref(), asset.decimals as u8)?;
    let allocate_delta = signed_raw(params.allocate_amount.as_deref(), asset.decimals as u8)?;
    if resize_delta == I256::ZERO && allocate_delta == I256::ZERO {
        return Err(RpcError::Parse(
            "resize requires a nonzero resize_amount or allocate_amount".to_string(),
        ));
    }
    let total_delta = resize_delta
        .checked_add(allocate_delta)
        .ok_or_else(|| RpcError::Parse("resize delta overflows".to_string()))?;

    let new_raw = &channel.raw_amount + i256_to_decimal(total_delta);
    if new_raw.sign() == bigdecimal::num_bigint::Sign::Minus {
        return Err(RpcError::Balance(
            "resize would drain the channel below zero".to_string(),
        ));
    }

    let token_address = parse_address(&channel.token)?;
    let channel_hash = contracts::parse_channel_id(&channel.channel_id)
        .map_err(RpcError::Internal)?;
    let new_version = channel.state_version + 1;

    // The allocation-change step rides in the state data.
    let data = {
        use alloy::sol_types::SolValue;
        let deltas: Vec<I256> = vec![resize_delta, allocate_delta];
        alloy::primitives::Bytes::from(deltas.abi_encode())
    };

    let candidate = Custody::State {
        intent: intent::RESIZE as u8,
        version: U256::from(new_version as u64),
        data,
        allocations: vec![
            Custody::Allocation {
                destination,
                token: token_address,
                amount: decimal_to_u256(&new_raw)?,
            },
            Custody::Allocation {
                destination: state.signer.address(),
                token: token_address,
                amount: U256::ZERO,
            },
        ],
    };

    let server_signature = sign_state(state, channel_hash, &candidate)?;
    let wire_state = WireState::from_sol(&candidate);

    db::update_channel_state(
        &mut tx,
        &channel.channel_id,
        db::ChannelStateUpdate {
            status: channel_status::RESIZING,
            raw_amount: &channel.raw_amount,
            state_intent: intent::RESIZE,
            state_version: new_version,
            state_data: &wire_state.state_data,
            state_allocations: &json!(wire_state.allocations),
            user_signature: None,
            server_signature: Some(&server_signature),
        },
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    Ok(json!({
        "channel_id": channel.channel_id,
        "state": wire_state,
        "server_signature": server_signature,
    }))
}

#[derive(Debug, Deserialize)]
struct CloseChannelParams {
    channel_id: String,
    funds_destination: String,
}

pub async fn close_channel(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: CloseChannelParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid close_channel params: {e}")))?;

    let wallet = ctx.user_id.clone();
    let destination = parse_address(&params.funds_destination)?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    let channel = load_owned_channel(&mut tx, &params.channel_id, &wallet).await?;
    if channel.status != channel_status::OPEN {
        return Err(RpcError::State(format!(
            "channel must be open to close, status is {}",
            channel.status
        )));
    }

    let asset = db::get_asset_by_token(&mut tx, channel.chain_id, &channel.token)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::Policy(format!("unsupported token {:?}", channel.token)))?;

    // The final allocation drains the wallet's off-chain balance; any escrow
    // residual settles back on the Closed event.
    let balance = Ledger::new(&wallet)
        .balance(&mut tx, &wallet, &asset.symbol)
        .await
        .map_err(RpcError::Internal)?;
    let final_raw = if balance.sign() == bigdecimal::num_bigint::Sign::Minus {
        U256::ZERO
    } else {
        decimal_to_raw(&balance, asset.decimals as u8).map_err(RpcError::Internal)?
    };

    let token_address = parse_address(&channel.token)?;
    let channel_hash = contracts::parse_channel_id(&channel.channel_id)
        .map_err(RpcError::Internal)?;
    let new_version = channel.state_version + 1;

    let candidate = Custody::State {
        intent: intent::FINALIZE as u8,
        version: U256::from(new_version as u64),
        data: Default::default(),
        allocations: vec![
            Custody::Allocation {
                destination,
                token: token_address,
                amount: final_raw,
            },
            Custody::Allocation {
                destination: state.signer.address(),
                token: token_address,
                amount: U256::ZERO,
            },
        ],
    };

    let server_signature = sign_state(state, channel_hash, &candidate)?;
    let wire_state = WireState::from_sol(&candidate);

    db::update_channel_state(
        &mut tx,
        &channel.channel_id,
        db::ChannelStateUpdate {
            status: &channel.status,
            raw_amount: &channel.raw_amount,
            state_intent: intent::FINALIZE,
            state_version: new_version,
            state_data: "0x",
            state_allocations: &json!(wire_state.allocations),
            user_signature: None,
            server_signature: Some(&server_signature),
        },
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    Ok(json!({
        "channel_id": channel.channel_id,
        "state": wire_state,
        "server_signature": server_signature,
    }))
}

// ============ Helpers ============

async fn load_owned_channel(
    conn: &mut sqlx::PgConnection,
    channel_id: &str,
    wallet: &str,
) -> Result<Channel, RpcError> {
    let channel = db::get_channel_for_update(conn, channel_id)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::State(format!("channel {channel_id:?} not found")))?;
    if channel.wallet != wallet {
        return Err(RpcError::Policy(
            "channel is not owned by the caller".to_string(),
        ));
    }
    Ok(channel)
}

fn sign_state(
    state: &AppState,
    channel: alloy::primitives::B256,
    candidate: &Custody::State,
) -> Result<String, RpcError> {
    let digest = contracts::state_hash(channel, candidate);
    let sig = state
        .signer
        .sign_digest(digest)
        .map_err(|e| RpcError::Internal(eyre::eyre!("state signing failed: {e}")))?;
    Ok(format!("0x{}", hex::encode(sig)))
}

fn parse_address(s: &str) -> Result<Address, RpcError> {
    Address::from_str(s).map_err(|_| RpcError::Parse(format!("invalid address {s:?}")))
}

/// Parse an optional signed decimal amount into raw token units.
fn signed_raw(amount: Option<&str>, decimals: u8) -> Result<I256, RpcError> {
    let Some(amount) = amount else {
        return Ok(I256::ZERO);
    };
    let decimal = parse_decimal(amount).map_err(|e| RpcError::Parse(e.to_string()))?;
    let negative = decimal.sign() == bigdecimal::num_bigint::Sign::Minus;
    let raw = decimal_to_raw(&decimal.abs(), decimals).map_err(RpcError::Internal)?;
    let mut value = I256::try_from(raw)
        .map_err(|_| RpcError::Parse(format!("amount {amount} does not fit int256")))?;
    if negative {
        value = -value;
    }
    Ok(value)
}

fn i256_to_decimal(value: I256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

fn decimal_to_u256(value: &BigDecimal) -> Result<U256, RpcError> {
    let (digits, _) = value.with_scale(0).into_bigint_and_exponent();
    U256::from_str_radix(&digits.to_string(), 10)
        .map_err(|e| RpcError::Internal(eyre::eyre!("raw amount out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_raw_parses_both_signs() {
        assert_eq!(
            signed_raw(Some("1.5"), 6).unwrap(),
            I256::try_from(1_500_000u64).unwrap()
        );
        assert_eq!(
            signed_raw(Some("-2"), 6).unwrap(),
            -I256::try_from(2_000_000u64).unwrap()
        );
        assert_eq!(signed_raw(None, 6).unwrap(), I256::ZERO);
    }

    #[test]
    fn test_i256_round_trip_decimal() {
        let v = -I256::try_from(42u64).unwrap();
        assert_eq!(i256_to_decimal(v), BigDecimal::from(-42));
    }
}
