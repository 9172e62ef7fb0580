//! Typed event fan-out over the connection hub.
//!
//! Events are response-shaped frames signed by the broker: `bu` (balance
//! update), `cu` (channel update), `tr` (transfer), `asu` (app session
//! update), plus the `assets` catalog pushed on connect.

use std::sync::Arc;

use eyre::Result;
use serde_json::json;
use sqlx::PgPool;
use tracing::warn;

use crate::db::models::{AppSession, Channel};
use crate::ledger::Ledger;
use crate::rpc::hub::ConnectionHub;
use crate::rpc::wire::{self, RpcData};
use crate::signer::Signer;

#[derive(Clone)]
pub struct Notifier {
    hub: Arc<ConnectionHub>,
    signer: Arc<Signer>,
}

impl Notifier {
    pub fn new(hub: Arc<ConnectionHub>, signer: Arc<Signer>) -> Self {
        Self { hub, signer }
    }

    /// Build a signed notification frame.
    pub fn frame(&self, method: &str, params: serde_json::Value) -> Result<String> {
        let data = RpcData::new(0, method, params);
        let bytes = wire::canonical_bytes(&data)?;
        let signature = self.signer.sign(&bytes).ok();
        wire::encode_response(&data, signature)
    }

    pub async fn publish(&self, user: &str, method: &str, params: serde_json::Value) {
        match self.frame(method, params) {
            Ok(frame) => self.hub.publish(user, &frame).await,
            Err(e) => warn!(method, error = %e, "failed to build notification"),
        }
    }

    /// `bu`: the wallet's current nonzero balances.
    pub async fn notify_balances(&self, db: &PgPool, wallet: &str) {
        let balances = async {
            let mut conn = db.acquire().await?;
            Ledger::new(wallet).get_balances(&mut conn, wallet).await
        }
        .await;

        match balances {
            Ok(balances) => {
                self.publish(wallet, "bu", json!({ "balance_updates": balances }))
                    .await;
            }
            Err(e) => warn!(wallet, error = %e, "failed to load balances for notification"),
        }
    }

    /// `tr`: formatted ledger transactions touching the wallet.
    pub async fn notify_transfer(&self, wallet: &str, transactions: serde_json::Value) {
        self.publish(wallet, "tr", json!({ "transactions": transactions }))
            .await;
    }

    /// `cu`: one channel's current state.
    pub async fn notify_channel_update(&self, channel: &Channel) {
        self.publish(&channel.wallet, "cu", json!(channel)).await;
    }

    /// `asu`: app session state pushed to every participant.
    pub async fn notify_app_session(&self, session: &AppSession) {
        for participant in session.participant_wallets() {
            self.publish(&participant, "asu", json!({ "app_session": session }))
                .await;
        }
    }
}
