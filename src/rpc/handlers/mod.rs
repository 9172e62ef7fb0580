//! RPC method handlers and the method → group routing table.
//!
//! Groups form a tree rooted at the public group: `private` requires an
//! authenticated policy, `history` additionally persists the request/response
//! pair, `app_session` additionally pushes a balance update after the call;
//! `test_mode` methods refuse outside CLEARNODE_MODE=test.

pub mod app_sessions;
pub mod channels;
pub mod queries;
pub mod transfer;

use crate::rpc::auth;
use crate::rpc::node::{AppState, Group, HandlerResult, RpcContext, RpcError};

/// The group a method is registered under; None for unknown methods.
pub fn group_of(method: &str) -> Option<Group> {
    Some(match method {
        // Root group: public information and the auth handshake.
        "ping"
        | "get_config"
        | "get_assets"
        | "get_channels"
        | "get_app_definition"
        | "get_app_sessions"
        | "get_ledger_entries"
        | "get_ledger_transactions"
        | "auth_request"
        | "auth_verify" => Group::Public,

        // Private group: authenticated wallet state.
        "get_ledger_balances"
        | "get_rpc_history"
        | "get_session_keys"
        | "revoke_session_key"
        | "get_user_tag" => Group::Private,

        // History group: state-mutating calls persisted to the RPC store.
        "transfer" | "create_channel" | "resize_channel" | "close_channel" => Group::History,

        // App-session group: history plus post-call balance notifications.
        "create_app_session" | "submit_app_state" | "close_app_session" => Group::AppSession,

        // Test-mode group.
        "mint" => Group::TestMode,

        _ => return None,
    })
}

/// Invoke the handler for the request's method.
pub async fn call(state: &AppState, ctx: &mut RpcContext) -> HandlerResult {
    match ctx.request.method() {
        "ping" => queries::ping(state, ctx).await,
        "get_config" => queries::get_config(state, ctx).await,
        "get_assets" => queries::get_assets(state, ctx).await,
        "get_channels" => queries::get_channels(state, ctx).await,
        "get_app_definition" => queries::get_app_definition(state, ctx).await,
        "get_app_sessions" => queries::get_app_sessions(state, ctx).await,
        "get_ledger_entries" => queries::get_ledger_entries(state, ctx).await,
        "get_ledger_transactions" => queries::get_ledger_transactions(state, ctx).await,
        "auth_request" => auth::handle_auth_request(state, ctx).await,
        "auth_verify" => auth::handle_auth_verify(state, ctx).await,

        "get_ledger_balances" => queries::get_ledger_balances(state, ctx).await,
        "get_rpc_history" => queries::get_rpc_history(state, ctx).await,
        "get_session_keys" => queries::get_session_keys(state, ctx).await,
        "revoke_session_key" => queries::revoke_session_key(state, ctx).await,
        "get_user_tag" => queries::get_user_tag(state, ctx).await,

        "transfer" => transfer::handle_transfer(state, ctx).await,
        "create_channel" => channels::create_channel(state, ctx).await,
        "resize_channel" => channels::resize_channel(state, ctx).await,
        "close_channel" => channels::close_channel(state, ctx).await,

        "create_app_session" => app_sessions::create_app_session(state, ctx).await,
        "submit_app_state" => app_sessions::submit_app_state(state, ctx).await,
        "close_app_session" => app_sessions::close_app_session(state, ctx).await,

        "mint" => queries::mint(state, ctx).await,

        other => Err(RpcError::Parse(format!("unknown method {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_partition() {
        assert_eq!(group_of("ping"), Some(Group::Public));
        assert_eq!(group_of("auth_verify"), Some(Group::Public));
        assert_eq!(group_of("get_ledger_balances"), Some(Group::Private));
        assert_eq!(group_of("transfer"), Some(Group::History));
        assert_eq!(group_of("create_app_session"), Some(Group::AppSession));
        assert_eq!(group_of("mint"), Some(Group::TestMode));
        assert_eq!(group_of("no_such_method"), None);
    }

    #[test]
    fn test_every_mutating_method_requires_auth() {
        for method in [
            "transfer",
            "create_channel",
            "resize_channel",
            "close_channel",
            "create_app_session",
            "submit_app_state",
            "close_app_session",
        ] {
            let group = group_of(method).unwrap();
            assert!(group.requires_auth(), "{method} must require auth");
            assert!(group.records_history(), "{method} must record history");
        }
    }
}
