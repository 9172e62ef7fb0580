//! Virtual application sessions: create, submit state, close.
//!
//! Session funds live as ledger entries under the session account, keyed by
//! participant wallet. State submissions redistribute the escrow without
//! external deposits, so per asset the proposed allocations must sum to the
//! currently escrowed amount; deltas are applied as session-internal
//! transfers pairing losers with gainers.

use std::collections::{BTreeMap, HashMap, HashSet};

use alloy::primitives::Address;
use bigdecimal::{BigDecimal, Zero};
use serde::Deserialize;
use serde_json::json;

use crate::amounts::parse_decimal;
use crate::db::{self, models::session_status, models::AccountType, models::TransactionType, NewAppSession};
use crate::ledger::{self, Ledger, Posting};
use crate::rpc::node::{AppState, HandlerResult, RpcContext, RpcError};

const SUPPORTED_PROTOCOLS: &[&str] = &["NitroRPC/0.2", "NitroRPC/0.4"];

#[derive(Debug, Deserialize)]
struct AppDefinition {
    protocol: String,
    participants: Vec<String>,
    weights: Vec<i64>,
    quorum: i64,
    #[serde(default)]
    challenge: i64,
    nonce: u64,
    #[serde(default)]
    application: String,
}

#[derive(Debug, Deserialize)]
struct SessionAllocation {
    participant: String,
    asset: String,
    amount: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    definition: AppDefinition,
    #[serde(default)]
    allocations: Vec<SessionAllocation>,
    session_data: Option<String>,
}

pub async fn create_app_session(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: CreateParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid create_app_session params: {e}")))?;
    let def = &params.definition;

    if !SUPPORTED_PROTOCOLS.contains(&def.protocol.as_str()) {
        return Err(RpcError::Policy(format!(
            "unsupported protocol {:?}",
            def.protocol
        )));
    }
    if def.participants.is_empty() {
        return Err(RpcError::Parse("participants cannot be empty".to_string()));
    }
    if def.participants.len() != def.weights.len() {
        return Err(RpcError::Parse(
            "weights must match participants".to_string(),
        ));
    }
    let total_weight: i64 = def.weights.iter().sum();
    if def.quorum <= 0 || def.quorum > total_weight {
        return Err(RpcError::Parse(format!(
            "quorum {} must be positive and within total weight {total_weight}",
            def.quorum
        )));
    }

    let participants: Vec<String> = def
        .participants
        .iter()
        .map(|p| p.to_lowercase())
        .collect();
    for p in &participants {
        p.parse::<Address>()
            .map_err(|_| RpcError::Parse(format!("invalid participant address {p:?}")))?;
    }
    let caller = ctx.user_id.clone();
    if participants[0] != caller {
        return Err(RpcError::Policy(
            "the creator's wallet must be the first participant".to_string(),
        ));
    }

    let verified = verified_signers(state, ctx, &participants, &def.application).await;
    let weight = signer_weight(&participants, &def.weights, &verified);
    if weight < def.quorum {
        return Err(RpcError::State(format!(
            "quorum not met: signed weight {weight} < quorum {}",
            def.quorum
        )));
    }

    let allocations = parse_allocations(&params.allocations, &participants)?;
    for (participant, _asset, amount) in &allocations {
        if !amount.is_zero() && !verified.contains_key(participant) {
            return Err(RpcError::Auth(format!(
                "allocation for {participant} is not authorized by a signature"
            )));
        }
    }

    let session_id = derive_session_id(def, &participants)?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    if db::get_app_session(&mut tx, &session_id)
        .await
        .map_err(RpcError::Internal)?
        .is_some()
    {
        return Err(RpcError::Duplicate(format!(
            "app session {session_id} already exists"
        )));
    }

    for (participant, asset, amount) in &allocations {
        if amount.is_zero() {
            continue;
        }
        if !db::asset_symbol_exists(&mut tx, asset)
            .await
            .map_err(RpcError::Internal)?
        {
            return Err(RpcError::Policy(format!("unsupported asset {asset:?}")));
        }
        let balance = Ledger::new(participant)
            .balance(&mut tx, participant, asset)
            .await
            .map_err(RpcError::Internal)?;
        if &balance < amount {
            return Err(RpcError::Balance(format!(
                "funds not fully redistributed: {participant} has {balance} {asset}, allocation needs {amount}"
            )));
        }
        let session_key = verified.get(participant).cloned().flatten();
        ledger::post_transfer(
            &mut tx,
            TransactionType::AppDeposit,
            Posting {
                account_id: participant,
                account_type: AccountType::Wallet,
                wallet: participant,
                session_key: session_key.as_deref(),
            },
            Posting {
                account_id: &session_id,
                account_type: AccountType::AppSession,
                wallet: participant,
                session_key: None,
            },
            asset,
            amount,
        )
        .await
        .map_err(RpcError::Internal)?;
    }

    db::insert_app_session(
        &mut tx,
        &NewAppSession {
            session_id: session_id.clone(),
            protocol: def.protocol.clone(),
            application: def.application.clone(),
            challenge: def.challenge,
            nonce: def.nonce as i64,
            participants: json!(participants),
            weights: json!(def.weights),
            quorum: def.quorum,
            session_data: params.session_data.clone(),
        },
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    notify_session(state, &session_id).await;
    for (participant, _, amount) in &allocations {
        if !amount.is_zero() {
            state.notifier.notify_balances(&state.db, participant).await;
        }
    }

    Ok(json!({
        "app_session_id": session_id,
        "version": 1,
        "status": session_status::OPEN,
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitParams {
    app_session_id: String,
    #[allow(dead_code)]
    intent: Option<String>,
    version: i64,
    #[serde(default)]
    allocations: Vec<SessionAllocation>,
    session_data: Option<String>,
}

pub async fn submit_app_state(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: SubmitParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid submit_app_state params: {e}")))?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    let session = db::get_app_session_for_update(&mut tx, &params.app_session_id)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::State("app session not found".to_string()))?;
    if session.status != session_status::OPEN {
        return Err(RpcError::State("app session is closed".to_string()));
    }
    if params.version <= session.version {
        return Err(RpcError::State(format!(
            "version must be strictly greater than {}",
            session.version
        )));
    }

    let participants = session.participant_wallets();
    let weights = session.weight_list();
    require_quorum(
        state,
        ctx,
        &participants,
        &weights,
        session.quorum,
        &session.application,
    )
    .await?;

    let proposed = parse_allocations(&params.allocations, &participants)?;
    let current = session_balances(&mut tx, &session.session_id, &participants)
        .await
        .map_err(RpcError::Internal)?;
    check_redistribution(&current, &proposed)?;
    apply_redistribution(&mut tx, &session.session_id, &current, &proposed).await?;

    db::update_app_session_state(
        &mut tx,
        &session.session_id,
        params.version,
        params.session_data.as_deref(),
        session_status::OPEN,
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    notify_session(state, &session.session_id).await;

    Ok(json!({
        "app_session_id": session.session_id,
        "version": params.version,
        "status": session_status::OPEN,
    }))
}

#[derive(Debug, Deserialize)]
struct CloseParams {
    app_session_id: String,
    #[serde(default)]
    allocations: Vec<SessionAllocation>,
    session_data: Option<String>,
}

pub async fn close_app_session(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    let params: CloseParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid close_app_session params: {e}")))?;

    let mut tx = state.db.begin().await.map_err(RpcError::from)?;
    let session = db::get_app_session_for_update(&mut tx, &params.app_session_id)
        .await
        .map_err(RpcError::Internal)?
        .ok_or_else(|| RpcError::State("app session not found".to_string()))?;
    if session.status != session_status::OPEN {
        return Err(RpcError::State("app session is closed".to_string()));
    }

    let participants = session.participant_wallets();
    let weights = session.weight_list();
    require_quorum(
        state,
        ctx,
        &participants,
        &weights,
        session.quorum,
        &session.application,
    )
    .await?;

    let proposed = parse_allocations(&params.allocations, &participants)?;
    let current = session_balances(&mut tx, &session.session_id, &participants)
        .await
        .map_err(RpcError::Internal)?;
    check_redistribution(&current, &proposed)?;
    apply_redistribution(&mut tx, &session.session_id, &current, &proposed).await?;

    // Residual balances return to each participant's wallet account.
    for (participant, asset, amount) in &proposed {
        if amount.is_zero() {
            continue;
        }
        ledger::post_transfer(
            &mut tx,
            TransactionType::AppWithdrawal,
            Posting {
                account_id: &session.session_id,
                account_type: AccountType::AppSession,
                wallet: participant,
                session_key: None,
            },
            Posting {
                account_id: participant,
                account_type: AccountType::Wallet,
                wallet: participant,
                session_key: None,
            },
            asset,
            amount,
        )
        .await
        .map_err(RpcError::Internal)?;
    }

    let new_version = session.version + 1;
    db::update_app_session_state(
        &mut tx,
        &session.session_id,
        new_version,
        params.session_data.as_deref(),
        session_status::CLOSED,
    )
    .await
    .map_err(RpcError::Internal)?;
    tx.commit().await.map_err(RpcError::from)?;

    notify_session(state, &session.session_id).await;
    for participant in &participants {
        state.notifier.notify_balances(&state.db, participant).await;
    }

    Ok(json!({
        "app_session_id": session.session_id,
        "version": new_version,
        "status": session_status::CLOSED,
    }))
}

// ============ Quorum ============

/// Map recovered request signers onto participant wallets, directly or via
/// session keys issued for this application. Values carry the session key
/// used, when any. A key delegated to a different application does not count
/// toward quorum.
async fn verified_signers(
    state: &AppState,
    ctx: &RpcContext,
    participants: &[String],
    application: &str,
) -> HashMap<String, Option<String>> {
    let wallets: HashSet<&str> = participants.iter().map(|p| p.as_str()).collect();
    let mut verified = HashMap::new();
    for address in ctx.recovered_signers() {
        let address = format!("{address:#x}");
        if wallets.contains(address.as_str()) {
            verified.entry(address).or_insert(None);
            continue;
        }
        if let Some(wallet) = state
            .session_keys
            .resolve_for_application(&address, application)
            .await
        {
            if wallets.contains(wallet.as_str()) {
                verified.entry(wallet).or_insert(Some(address));
            }
        }
    }
    verified
}

/// Σ weights of the distinct verified participants.
fn signer_weight(
    participants: &[String],
    weights: &[i64],
    verified: &HashMap<String, Option<String>>,
) -> i64 {
    participants
        .iter()
        .zip(weights)
        .filter(|(p, _)| verified.contains_key(*p))
        .map(|(_, w)| *w)
        .sum()
}

async fn require_quorum(
    state: &AppState,
    ctx: &RpcContext,
    participants: &[String],
    weights: &[i64],
    quorum: i64,
    application: &str,
) -> Result<(), RpcError> {
    let verified = verified_signers(state, ctx, participants, application).await;
    let weight = signer_weight(participants, weights, &verified);
    if weight < quorum {
        return Err(RpcError::State(format!(
            "quorum not met: signed weight {weight} < quorum {quorum}"
        )));
    }
    Ok(())
}

// ============ Redistribution ============

type Balances = BTreeMap<String, BTreeMap<String, BigDecimal>>;

fn parse_allocations(
    raw: &[SessionAllocation],
    participants: &[String],
) -> Result<Vec<(String, String, BigDecimal)>, RpcError> {
    let known: HashSet<&str> = participants.iter().map(|p| p.as_str()).collect();
    let mut out = Vec::with_capacity(raw.len());
    for allocation in raw {
        let participant = allocation.participant.to_lowercase();
        if !known.contains(participant.as_str()) {
            return Err(RpcError::Parse(format!(
                "allocation references unknown participant {participant:?}"
            )));
        }
        let amount_str = match &allocation.amount {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let amount = parse_decimal(&amount_str).map_err(|e| RpcError::Parse(e.to_string()))?;
        if amount.sign() == bigdecimal::num_bigint::Sign::Minus {
            return Err(RpcError::Parse(format!(
                "allocation amount for {participant} cannot be negative"
            )));
        }
        out.push((participant, allocation.asset.clone(), amount));
    }
    Ok(out)
}

/// Current per-(asset, participant) balances under the session account.
async fn session_balances(
    conn: &mut sqlx::PgConnection,
    session_id: &str,
    participants: &[String],
) -> eyre::Result<Balances> {
    let mut balances: Balances = BTreeMap::new();
    for participant in participants {
        for balance in Ledger::new(participant)
            .get_balances(conn, session_id)
            .await?
        {
            balances
                .entry(balance.asset)
                .or_default()
                .insert(participant.clone(), balance.amount);
        }
    }
    Ok(balances)
}

/// Per asset, the proposed allocations must sum to the escrowed amount;
/// redistribution never mints or burns session funds.
fn check_redistribution(
    current: &Balances,
    proposed: &[(String, String, BigDecimal)],
) -> Result<(), RpcError> {
    let mut proposed_totals: BTreeMap<&str, BigDecimal> = BTreeMap::new();
    for (_, asset, amount) in proposed {
        *proposed_totals.entry(asset.as_str()).or_default() += amount;
    }

    let mut assets: HashSet<&str> = proposed_totals.keys().copied().collect();
    assets.extend(current.keys().map(|a| a.as_str()));

    for asset in assets {
        let escrowed: BigDecimal = current
            .get(asset)
            .map(|by_wallet| by_wallet.values().sum())
            .unwrap_or_else(BigDecimal::zero);
        let proposed_total = proposed_totals
            .get(asset)
            .cloned()
            .unwrap_or_else(BigDecimal::zero);
        if escrowed != proposed_total {
            return Err(RpcError::Balance(format!(
                "allocations not fully redistributed for {asset}: escrowed {escrowed}, proposed {proposed_total}"
            )));
        }
    }
    Ok(())
}

/// Pair losers with gainers per asset and post the matching transfers inside
/// the session account.
async fn apply_redistribution(
    conn: &mut sqlx::PgConnection,
    session_id: &str,
    current: &Balances,
    proposed: &[(String, String, BigDecimal)],
) -> Result<(), RpcError> {
    let mut proposed_map: Balances = BTreeMap::new();
    for (participant, asset, amount) in proposed {
        *proposed_map
            .entry(asset.clone())
            .or_default()
            .entry(participant.clone())
            .or_default() += amount;
    }

    let mut assets: HashSet<String> = proposed_map.keys().cloned().collect();
    assets.extend(current.keys().cloned());
    let mut assets: Vec<String> = assets.into_iter().collect();
    assets.sort();

    for asset in assets {
        let empty = BTreeMap::new();
        let current_by_wallet = current.get(&asset).unwrap_or(&empty);
        let proposed_by_wallet = proposed_map.get(&asset).unwrap_or(&empty);

        let mut deltas: Vec<(String, BigDecimal)> = Vec::new();
        let mut wallets: HashSet<&String> = current_by_wallet.keys().collect();
        wallets.extend(proposed_by_wallet.keys());
        for wallet in wallets {
            let before = current_by_wallet
                .get(wallet)
                .cloned()
                .unwrap_or_else(BigDecimal::zero);
            let after = proposed_by_wallet
                .get(wallet)
                .cloned()
                .unwrap_or_else(BigDecimal::zero);
            let delta = after - before;
            if !delta.is_zero() {
                deltas.push((wallet.clone(), delta));
            }
        }

        for (from, to, amount) in match_deltas(deltas) {
            ledger::post_transfer(
                conn,
                TransactionType::Transfer,
                Posting {
                    account_id: session_id,
                    account_type: AccountType::AppSession,
                    wallet: &from,
                    session_key: None,
                },
                Posting {
                    account_id: session_id,
                    account_type: AccountType::AppSession,
                    wallet: &to,
                    session_key: None,
                },
                &asset,
                &amount,
            )
            .await
            .map_err(RpcError::Internal)?;
        }
    }
    Ok(())
}

/// Greedily match negative deltas (losers) with positive deltas (gainers)
/// into a sequence of (from, to, amount) moves. Deltas must sum to zero.
fn match_deltas(deltas: Vec<(String, BigDecimal)>) -> Vec<(String, String, BigDecimal)> {
    let mut losers: Vec<(String, BigDecimal)> = deltas
        .iter()
        .filter(|(_, d)| d.sign() == bigdecimal::num_bigint::Sign::Minus)
        .map(|(w, d)| (w.clone(), d.abs()))
        .collect();
    let mut gainers: Vec<(String, BigDecimal)> = deltas
        .into_iter()
        .filter(|(_, d)| d.sign() == bigdecimal::num_bigint::Sign::Plus)
        .collect();
    losers.sort();
    gainers.sort();

    let mut moves = Vec::new();
    let mut gainer_index = 0;
    for (loser, mut remaining) in losers {
        while !remaining.is_zero() && gainer_index < gainers.len() {
            let (gainer, need) = &mut gainers[gainer_index];
            let step = remaining.clone().min(need.clone());
            moves.push((loser.clone(), gainer.clone(), step.clone()));
            remaining -= &step;
            *need -= step;
            if need.is_zero() {
                gainer_index += 1;
            }
        }
    }
    moves
}

fn derive_session_id(def: &AppDefinition, participants: &[String]) -> Result<String, RpcError> {
    use alloy::sol_types::SolValue;
    let addresses: Vec<Address> = participants
        .iter()
        .map(|p| p.parse::<Address>())
        .collect::<Result<_, _>>()
        .map_err(|_| RpcError::Parse("invalid participant address".to_string()))?;
    let encoded = (
        addresses,
        def.protocol.clone(),
        def.nonce,
        def.challenge as u64,
        def.quorum as u64,
    )
        .abi_encode();
    Ok(format!("{:#x}", alloy::primitives::keccak256(encoded)))
}

async fn notify_session(state: &AppState, session_id: &str) {
    let session = async {
        let mut conn = state.db.acquire().await?;
        db::get_app_session(&mut conn, session_id).await
    }
    .await;
    if let Ok(Some(session)) = session {
        state.notifier.notify_app_session(&session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn wallets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("0x{:040x}", i + 1)).collect()
    }

    #[test]
    fn test_signer_weight_counts_distinct_participants() {
        let participants = wallets(3);
        let weights = vec![50, 30, 20];
        let mut verified = HashMap::new();
        verified.insert(participants[0].clone(), None);
        verified.insert(participants[2].clone(), Some("0xkey".to_string()));
        assert_eq!(signer_weight(&participants, &weights, &verified), 70);

        verified.remove(&participants[2]);
        assert_eq!(signer_weight(&participants, &weights, &verified), 50);
    }

    #[test]
    fn test_check_redistribution_accepts_exact_sums() {
        let p = wallets(2);
        let mut current: Balances = BTreeMap::new();
        current.entry("usdc".to_string()).or_default().insert(p[0].clone(), d("100"));
        let proposed = vec![
            (p[0].clone(), "usdc".to_string(), d("40")),
            (p[1].clone(), "usdc".to_string(), d("60")),
        ];
        assert!(check_redistribution(&current, &proposed).is_ok());
    }

    #[test]
    fn test_check_redistribution_rejects_mismatch() {
        let p = wallets(2);
        let mut current: Balances = BTreeMap::new();
        current.entry("usdc".to_string()).or_default().insert(p[0].clone(), d("100"));
        let proposed = vec![
            (p[0].clone(), "usdc".to_string(), d("41")),
            (p[1].clone(), "usdc".to_string(), d("60")),
        ];
        let err = check_redistribution(&current, &proposed).unwrap_err();
        assert!(err.to_string().contains("not fully redistributed"));
    }

    #[test]
    fn test_check_redistribution_covers_missing_assets() {
        let p = wallets(1);
        let mut current: Balances = BTreeMap::new();
        current.entry("usdc".to_string()).or_default().insert(p[0].clone(), d("5"));
        // Proposal omits usdc entirely: 5 escrowed vs 0 proposed.
        assert!(check_redistribution(&current, &[]).is_err());
    }

    #[test]
    fn test_match_deltas_conserves_amounts() {
        let p = wallets(3);
        let deltas = vec![
            (p[0].clone(), d("-30")),
            (p[1].clone(), d("10")),
            (p[2].clone(), d("20")),
        ];
        let moves = match_deltas(deltas);
        let moved: BigDecimal = moves.iter().map(|(_, _, amt)| amt.clone()).sum();
        assert_eq!(moved, d("30"));
        for (from, _, _) in &moves {
            assert_eq!(from, &p[0]);
        }
    }

    #[test]
    fn test_match_deltas_empty_when_balanced() {
        assert!(match_deltas(vec![]).is_empty());
    }
}
