//! RPC node: method routing, middleware groups and the per-connection
//! dispatch loop.
//!
//! Groups form a tree rooted at the public group: `private` requires an
//! authenticated policy, `history` additionally persists the request/response
//! pair, `app_session` additionally pushes a balance update after the call.
//! Exactly one response is written per inbound request, including for panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use alloy::primitives::{keccak256, Address};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{Config, Mode};
use crate::metrics;
use crate::msg_cache::MessageCache;
use crate::notifier::Notifier;
use crate::rpc::auth::{ChallengeStore, JwtIssuer};
use crate::rpc::hub::{Connection, ConnectionHub, DEFAULT_WRITE_TIMEOUT};
use crate::rpc::wire::{self, RpcData};
use crate::session_keys::SessionKeyStore;
use crate::signer::Signer;

/// Client-visible error taxonomy. Internal failures are logged in full and
/// surfaced with a generic message.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Policy(String),
    #[error("{0}")]
    State(String),
    #[error("{0}")]
    Balance(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("internal error")]
    Internal(#[from] eyre::Report),
}

impl RpcError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse_error",
            Self::Auth(_) => "auth_error",
            Self::Policy(_) => "policy_error",
            Self::State(_) => "state_error",
            Self::Balance(_) => "balance_error",
            Self::Duplicate(_) => "duplicate_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

impl From<sqlx::Error> for RpcError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(eyre::Report::new(e))
    }
}

/// Shared service state threaded through every handler.
pub struct AppState {
    pub cfg: Config,
    pub db: PgPool,
    pub signer: Arc<Signer>,
    pub hub: Arc<ConnectionHub>,
    pub session_keys: SessionKeyStore,
    pub msg_cache: MessageCache,
    pub challenges: ChallengeStore,
    pub jwt: JwtIssuer,
    pub notifier: Notifier,
}

/// Per-request context handed down the middleware chain.
pub struct RpcContext {
    pub conn_id: String,
    /// Wallet bound to the connection; empty for unauthenticated requests.
    pub user_id: String,
    pub request: RpcData,
    pub canonical: Vec<u8>,
    pub req_hash: [u8; 32],
    pub signatures: Vec<String>,
    /// Overrides the response method (e.g. `auth_challenge`).
    pub response_method: Option<String>,
    /// Set by auth_verify so the post-call hook can run OnAuthenticated.
    pub authenticated: bool,
}

impl RpcContext {
    /// Addresses recovered from the request signatures over the canonical
    /// request bytes.
    pub fn recovered_signers(&self) -> Vec<Address> {
        self.signatures
            .iter()
            .filter_map(|s| crate::signer::decode_sig_hex(s).ok())
            .filter_map(|bytes| Signer::recover_raw(&self.canonical, &bytes).ok())
            .collect()
    }
}

pub type HandlerResult = Result<serde_json::Value, RpcError>;

/// Method groups; a group inherits every check of its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Public,
    TestMode,
    Private,
    History,
    AppSession,
}

impl Group {
    pub fn requires_auth(self) -> bool {
        matches!(self, Self::Private | Self::History | Self::AppSession)
    }

    pub fn records_history(self) -> bool {
        matches!(self, Self::History | Self::AppSession)
    }

    pub fn notifies_balances(self) -> bool {
        matches!(self, Self::AppSession)
    }

    pub fn test_only(self) -> bool {
        matches!(self, Self::TestMode)
    }
}

// ============ Connection serving ============

/// Serve one WebSocket connection: a reader that dispatches frames serially,
/// a writer draining the bounded queue, and a close watcher tying both to the
/// connection's close signal.
pub async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    let (conn, mut write_rx, close_rx) = Connection::new(&conn_id, DEFAULT_WRITE_TIMEOUT);

    if let Err(e) = state.hub.add(conn.clone()).await {
        warn!(error = %e, "rejecting connection");
        return;
    }
    metrics::CONNECTED_CLIENTS.inc();
    debug!(conn_id = %conn_id, "connection opened");

    on_connect(&state, &conn).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer fiber: drains the write queue onto the socket.
    let mut writer_close = close_rx.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = write_rx.recv() => match maybe {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                        metrics::MESSAGES_SENT.inc();
                    }
                    None => break,
                },
                changed = writer_close.changed() => {
                    if changed.is_err() || *writer_close.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader fiber: decodes frames and dispatches them in receive order. One
    // in-flight handler per connection.
    let mut reader_close = close_rx;
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&state, &conn, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "socket read failed");
                    break;
                }
            },
            changed = reader_close.changed() => {
                if changed.is_err() || *reader_close.borrow() {
                    break;
                }
            }
        }
    }

    writer.abort();
    if conn.auth.lock().await.is_some() {
        metrics::AUTHENTICATED_SESSIONS.dec();
    }
    state.hub.remove(&conn.id).await;
    metrics::CONNECTED_CLIENTS.dec();
    debug!(conn_id = %conn.id, "connection closed");
}

/// OnConnect: push the supported-asset catalog to the new client.
async fn on_connect(state: &AppState, conn: &Arc<Connection>) {
    match crate::db::list_assets(&state.db, None).await {
        Ok(assets) => {
            if let Ok(frame) = state.notifier.frame("assets", json!({ "assets": assets })) {
                conn.write(frame).await;
            }
        }
        Err(e) => warn!(error = %e, "failed to load asset catalog"),
    }
}

/// OnAuthenticated: push the wallet's open channels and current balances.
async fn on_authenticated(state: &AppState, wallet: &str) {
    match crate::db::open_channels_for_wallet(&state.db, wallet).await {
        Ok(channels) => {
            state
                .notifier
                .publish(wallet, "channels", json!({ "channels": channels }))
                .await;
        }
        Err(e) => warn!(error = %e, "failed to load channels for wallet"),
    }
    state.notifier.notify_balances(&state.db, wallet).await;
}

/// Process one inbound frame end to end. Guarantees exactly one response.
pub async fn dispatch(state: &Arc<AppState>, conn: &Arc<Connection>, frame: &str) {
    metrics::MESSAGES_RECEIVED.inc();

    let parsed = match wire::parse_request(frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            let err = RpcError::Parse(e.to_string());
            warn!(conn_id = %conn.id, error = %e, "malformed request");
            write_error(state, conn, 0, &err).await;
            return;
        }
    };

    let method = parsed.data.method().to_string();
    let request_id = parsed.data.request_id();
    let started = std::time::Instant::now();

    let mut ctx = RpcContext {
        conn_id: conn.id.clone(),
        user_id: String::new(),
        req_hash: keccak256(&parsed.canonical).into(),
        request: parsed.data,
        canonical: parsed.canonical,
        signatures: parsed.signatures,
        response_method: None,
        authenticated: false,
    };

    let result = run_chain(state, conn, &mut ctx).await;

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::RPC_REQUESTS.with_label_values(&[method.as_str(), status]).inc();
    debug!(
        conn_id = %conn.id,
        method = %method,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rpc request"
    );

    let (response, response_value) = match &result {
        Ok(value) => {
            let response_method = ctx.response_method.clone().unwrap_or_else(|| method.clone());
            (
                RpcData::new(request_id, response_method, value.clone()),
                Some(value.clone()),
            )
        }
        Err(err) => {
            metrics::RPC_ERRORS.with_label_values(&[err.kind()]).inc();
            if matches!(err, RpcError::Internal(_)) {
                error!(conn_id = %conn.id, method = %method, error = ?err, "handler failed");
            } else {
                warn!(conn_id = %conn.id, method = %method, kind = err.kind(), error = %err, "request rejected");
            }
            (
                RpcData::new(request_id, "error", json!({ "error": err.client_message() })),
                None,
            )
        }
    };

    let signature = wire::canonical_bytes(&response)
        .ok()
        .and_then(|bytes| state.signer.sign(&bytes).ok());
    match wire::encode_response(&response, signature) {
        Ok(frame) => conn.write(frame).await,
        Err(e) => error!(error = %e, "failed to encode response"),
    }

    // Post-call middleware, outermost last.
    if let Some(group) = crate::rpc::handlers::group_of(&method) {
        if group.records_history() && !ctx.user_id.is_empty() {
            let res_sig = signature
                .map(|s| json!([format!("0x{}", hex::encode(s))]))
                .unwrap_or_else(|| json!([]));
            let record = crate::db::insert_rpc_record(
                &state.db,
                &ctx.user_id,
                request_id as i64,
                &method,
                ctx.request.params(),
                ctx.request.timestamp() as i64,
                &json!(ctx.signatures),
                response_value.as_ref(),
                &res_sig,
            )
            .await;
            if let Err(e) = record {
                warn!(error = %e, "failed to persist rpc history");
            }
        }
        if group.notifies_balances() && result.is_ok() && !ctx.user_id.is_empty() {
            state.notifier.notify_balances(&state.db, &ctx.user_id).await;
        }
    }

    if ctx.authenticated {
        let wallet = conn.user_id().await;
        if !wallet.is_empty() {
            on_authenticated(state, &wallet).await;
        }
    }
}

/// Root middleware, group middleware, then the handler; panics are recovered
/// into internal errors.
async fn run_chain(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    ctx: &mut RpcContext,
) -> HandlerResult {
    let Some(group) = crate::rpc::handlers::group_of(ctx.request.method()) else {
        return Err(RpcError::Parse(format!(
            "unknown method {:?}",
            ctx.request.method()
        )));
    };

    if group.test_only() && state.cfg.mode != Mode::Test {
        return Err(RpcError::Policy(
            "test endpoints are disabled outside test mode".to_string(),
        ));
    }

    if group.requires_auth() {
        auth_middleware(state, conn, ctx).await?;
    }

    let method = ctx.request.method().to_string();
    let handler_future = crate::rpc::handlers::call(state, ctx);
    match AssertUnwindSafe(handler_future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Internal(eyre::eyre!(
            "handler panicked for method {method}"
        ))),
    }
}

/// Require a live policy on the connection and a fresh request timestamp;
/// refresh the session's last activity.
async fn auth_middleware(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    ctx: &mut RpcContext,
) -> Result<(), RpcError> {
    let mut guard = conn.auth.lock().await;
    let session = guard
        .as_mut()
        .ok_or_else(|| RpcError::Auth("authentication required".to_string()))?;
    if session.expired() {
        return Err(RpcError::Auth("session expired".to_string()));
    }
    wire::validate_timestamp(ctx.request.timestamp(), state.cfg.msg_expiry)
        .map_err(|e| RpcError::Auth(e.to_string()))?;
    session.last_activity = Utc::now();
    ctx.user_id = session.wallet.clone();
    Ok(())
}

async fn write_response(state: &AppState, conn: &Arc<Connection>, data: &RpcData) {
    let signature = wire::canonical_bytes(data)
        .ok()
        .and_then(|bytes| state.signer.sign(&bytes).ok());
    match wire::encode_response(data, signature) {
        Ok(frame) => conn.write(frame).await,
        Err(e) => error!(error = %e, "failed to encode response"),
    }
}

async fn write_error(state: &AppState, conn: &Arc<Connection>, request_id: u64, err: &RpcError) {
    metrics::RPC_ERRORS.with_label_values(&[err.kind()]).inc();
    let data = RpcData::new(request_id, "error", json!({ "error": err.client_message() }));
    write_response(state, conn, &data).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(RpcError::Parse("x".into()).kind(), "parse_error");
        assert_eq!(RpcError::Auth("x".into()).kind(), "auth_error");
        assert_eq!(RpcError::Policy("x".into()).kind(), "policy_error");
        assert_eq!(RpcError::State("x".into()).kind(), "state_error");
        assert_eq!(RpcError::Balance("x".into()).kind(), "balance_error");
        assert_eq!(RpcError::Duplicate("x".into()).kind(), "duplicate_error");
        assert_eq!(
            RpcError::Internal(eyre::eyre!("db down")).kind(),
            "internal_error"
        );
    }

    #[test]
    fn test_internal_errors_are_generic_to_clients() {
        let err = RpcError::Internal(eyre::eyre!("connection refused to 10.0.0.3:5432"));
        assert_eq!(err.client_message(), "internal error");
    }

    #[test]
    fn test_group_tree_inheritance() {
        assert!(!Group::Public.requires_auth());
        assert!(Group::Private.requires_auth());
        assert!(Group::History.requires_auth());
        assert!(Group::History.records_history());
        assert!(!Group::Private.records_history());
        assert!(Group::AppSession.requires_auth());
        assert!(Group::AppSession.records_history());
        assert!(Group::AppSession.notifies_balances());
        assert!(Group::TestMode.test_only());
    }
}
