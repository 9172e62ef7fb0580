//! On-chain log ingestion: one listener per (chain, custody contract).
//!
//! Each listener interleaves two sources: a reconciliation walk from the
//! persisted cursor up to the head in block-step chunks, and — on websocket
//! endpoints — a live log subscription. The cursor's boundary block is
//! refetched unchanged so same-block events past the last index re-deliver;
//! the contract-events unique key makes redelivery idempotent.

pub mod custody;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::Transport;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::BlockchainConfig;
use crate::db;
use crate::metrics;
use crate::rpc::node::AppState;

/// Hard failure limit; exceeding it aborts the process.
const MAX_BACKOFF_COUNT: u32 = 12;
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const HISTORICAL_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const CHAIN_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep before retry attempt `n`: (1 << n) - 1 seconds, bounded by the
/// attempt cap above.
pub fn backoff_secs(attempt: u32) -> u64 {
    (1u64 << attempt.min(MAX_BACKOFF_COUNT)) - 1
}

/// Probe a chain endpoint and verify it reports the configured chain id.
/// A mismatch is a fatal configuration error.
pub async fn verify_chain_id(chain: &BlockchainConfig) -> Result<()> {
    let reported = if is_ws(&chain.rpc_url) {
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(chain.rpc_url.clone()))
            .await
            .wrap_err_with(|| format!("Failed to connect to {}", chain.name))?;
        tokio::time::timeout(CHAIN_PROBE_TIMEOUT, provider.get_chain_id())
            .await
            .map_err(|_| eyre!("chain id probe timed out for {}", chain.name))??
    } else {
        let provider = ProviderBuilder::new().on_http(
            chain
                .rpc_url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL for {}", chain.name))?,
        );
        tokio::time::timeout(CHAIN_PROBE_TIMEOUT, provider.get_chain_id())
            .await
            .map_err(|_| eyre!("chain id probe timed out for {}", chain.name))??
    };

    if reported != chain.id as u64 {
        return Err(eyre!(
            "chain {} reports id {reported}, configuration says {}",
            chain.name,
            chain.id
        ));
    }
    Ok(())
}

/// Run the listener for one chain until shutdown or the backoff limit.
pub async fn run_listener(state: Arc<AppState>, chain: BlockchainConfig) -> Result<()> {
    let custody: Address = chain
        .custody_address
        .parse()
        .wrap_err("Invalid custody address")?;

    let mut backoff_count = 0u32;
    loop {
        let result = listen_once(&state, &chain, custody).await;
        let err = match result {
            Ok(()) => eyre!("listener loop exited unexpectedly"),
            Err(e) => e,
        };
        backoff_count += 1;
        metrics::LISTENER_ERRORS.with_label_values(&[chain.name.as_str()]).inc();
        if backoff_count > MAX_BACKOFF_COUNT {
            error!(chain = %chain.name, error = %err, "listener exceeded backoff limit");
            return Err(err.wrap_err("listener exceeded backoff limit"));
        }
        let sleep = backoff_secs(backoff_count);
        warn!(
            chain = %chain.name,
            error = %err,
            attempt = backoff_count,
            sleep_secs = sleep,
            "listener failed, backing off"
        );
        tokio::time::sleep(Duration::from_secs(sleep)).await;
    }
}

fn is_ws(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

async fn listen_once(
    state: &Arc<AppState>,
    chain: &BlockchainConfig,
    custody: Address,
) -> Result<()> {
    if is_ws(&chain.rpc_url) {
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(chain.rpc_url.clone()))
            .await
            .wrap_err("Failed to open websocket RPC connection")?;

        let filter = Filter::new().address(custody);
        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .wrap_err("Failed to subscribe to live logs")?;
        let mut live = subscription.into_stream();
        info!(chain = %chain.name, contract = %custody, "live log subscription established");

        let mut tick = tokio::time::interval(HEAD_POLL_INTERVAL);
        loop {
            tokio::select! {
                maybe = live.next() => match maybe {
                    Some(log) => {
                        if let Err(e) = custody::handle_log(state, chain, &log).await {
                            // Left unacknowledged; the next reconciliation retries it.
                            warn!(chain = %chain.name, error = %e, "live event handling failed");
                        }
                    }
                    None => return Err(eyre!("live log subscription closed")),
                },
                _ = tick.tick() => {
                    reconcile(state, chain, custody, &provider).await?;
                }
            }
        }
    } else {
        let provider = ProviderBuilder::new().on_http(
            chain
                .rpc_url
                .parse()
                .wrap_err("Invalid RPC URL")?,
        );
        info!(chain = %chain.name, contract = %custody, "polling listener started");
        let mut tick = tokio::time::interval(HEAD_POLL_INTERVAL);
        loop {
            tick.tick().await;
            reconcile(state, chain, custody, &provider).await?;
        }
    }
}

/// Walk from the persisted cursor to the current head in block-step chunks.
/// The boundary block is refetched without a +1 so events at the cursor
/// block with a higher log index re-deliver.
async fn reconcile<T, P>(
    state: &Arc<AppState>,
    chain: &BlockchainConfig,
    custody: Address,
    provider: &P,
) -> Result<()>
where
    T: Transport + Clone,
    P: Provider<T>,
{
    let custody_str = format!("{custody:#x}");
    let (mut last_block, mut last_index) =
        db::get_event_cursor(&state.db, chain.id as i64, &custody_str)
            .await?
            .unwrap_or((0, 0));

    let head = provider.get_block_number().await.wrap_err("Failed to get head block")?;
    if head < last_block as u64 {
        return Ok(());
    }

    let mut from = last_block.max(0) as u64;
    loop {
        let to = (from + chain.block_step - 1).min(head);
        let (logs, effective_to) = fetch_logs(provider, custody, from, to).await?;

        for log in &logs {
            let block = log.block_number.unwrap_or_default() as i64;
            let index = log.log_index.unwrap_or_default() as i64;
            // Same-block events at or below the cursor index were already
            // handled in a prior pass.
            if block == last_block && index <= last_index && last_index > 0 {
                continue;
            }
            if let Err(e) = custody::handle_log(state, chain, log).await {
                // Persist progress up to the failed event, then back off so
                // the next reconciliation retries it.
                db::update_event_cursor(
                    &state.db,
                    chain.id as i64,
                    &custody_str,
                    last_block,
                    last_index,
                )
                .await?;
                return Err(e.wrap_err("event handler failed"));
            }
            if block > last_block || (block == last_block && index > last_index) {
                last_block = block;
                last_index = index;
            }
        }

        let cursor_block = (effective_to as i64).max(last_block);
        if cursor_block > last_block {
            last_block = cursor_block;
            last_index = 0;
        }
        db::update_event_cursor(&state.db, chain.id as i64, &custody_str, last_block, last_index)
            .await?;
        metrics::LATEST_BLOCK
            .with_label_values(&[chain.name.as_str()])
            .set(last_block as f64);

        if effective_to >= head {
            break;
        }
        from = effective_to + 1;
    }
    Ok(())
}

/// Fetch one chunk of logs. When the provider rejects the range as too
/// large and advises a narrower one, retry with the advised range; the
/// returned bound tells the caller where to resume.
async fn fetch_logs<T, P>(
    provider: &P,
    custody: Address,
    from: u64,
    to: u64,
) -> Result<(Vec<Log>, u64)>
where
    T: Transport + Clone,
    P: Provider<T>,
{
    let filter = Filter::new().address(custody).from_block(from).to_block(to);
    let result = tokio::time::timeout(HISTORICAL_FETCH_TIMEOUT, provider.get_logs(&filter))
        .await
        .map_err(|_| eyre!("log fetch timed out for blocks {from}..={to}"))?;

    match result {
        Ok(logs) => Ok((logs, to)),
        Err(e) => {
            let text = e.to_string();
            if let Some((_, advised_to)) = parse_advised_range(&text) {
                let narrowed_to = advised_to.clamp(from, to);
                debug!(from, to, narrowed_to, "provider advised a narrower range");
                let filter = Filter::new()
                    .address(custody)
                    .from_block(from)
                    .to_block(narrowed_to);
                let logs = tokio::time::timeout(HISTORICAL_FETCH_TIMEOUT, provider.get_logs(&filter))
                    .await
                    .map_err(|_| eyre!("narrowed log fetch timed out"))?
                    .wrap_err("narrowed log fetch failed")?;
                Ok((logs, narrowed_to))
            } else {
                Err(eyre!("log fetch failed for blocks {from}..={to}: {text}"))
            }
        }
    }
}

/// Extract the advised block range from a "query returned more than N
/// results" style error, e.g. `... Try with this block range [0x1f2, 0x3e4]`.
pub fn parse_advised_range(error: &str) -> Option<(u64, u64)> {
    let open = error.rfind('[')?;
    let close = error[open..].find(']')? + open;
    let inner = &error[open + 1..close];
    let mut parts = inner.split(',').map(str::trim);
    let from = parse_block_number(parts.next()?)?;
    let to = parse_block_number(parts.next()?)?;
    if parts.next().is_some() || from > to {
        return None;
    }
    Some((from, to))
}

fn parse_block_number(s: &str) -> Option<u64> {
    if let Some(hexpart) = s.strip_prefix("0x") {
        u64::from_str_radix(hexpart, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_shift_semantics() {
        assert_eq!(backoff_secs(1), 1);
        assert_eq!(backoff_secs(2), 3);
        assert_eq!(backoff_secs(3), 7);
        assert_eq!(backoff_secs(5), 31);
        // Bounded by the attempt cap.
        assert_eq!(backoff_secs(40), (1u64 << 12) - 1);
    }

    #[test]
    fn test_parse_advised_range_hex() {
        let err = "query returned more than 10000 results. Try with this block range [0x1f2, 0x3e4].";
        assert_eq!(parse_advised_range(err), Some((0x1f2, 0x3e4)));
    }

    #[test]
    fn test_parse_advised_range_decimal() {
        let err = "too many results, retry with range [1000, 2000]";
        assert_eq!(parse_advised_range(err), Some((1000, 2000)));
    }

    #[test]
    fn test_parse_advised_range_rejects_noise() {
        assert_eq!(parse_advised_range("no range here"), None);
        assert_eq!(parse_advised_range("bad [0x10]"), None);
        assert_eq!(parse_advised_range("inverted [0x20, 0x10]"), None);
        assert_eq!(parse_advised_range("triple [1, 2, 3]"), None);
    }
}
