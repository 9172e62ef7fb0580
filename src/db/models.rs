use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger account kinds. Wallet addresses and virtual-session identifiers
/// share the AccountID type; the kind is recorded per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum AccountType {
    Wallet = 0,
    Channel = 1,
    AppSession = 2,
}

impl AccountType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Ledger transaction kinds; the numeric codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TransactionType {
    Transfer = 100,
    Deposit = 201,
    Withdrawal = 202,
    AppDeposit = 301,
    AppWithdrawal = 302,
    EscrowLock = 401,
    EscrowUnlock = 402,
}

impl TransactionType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            100 => Some(Self::Transfer),
            201 => Some(Self::Deposit),
            202 => Some(Self::Withdrawal),
            301 => Some(Self::AppDeposit),
            302 => Some(Self::AppWithdrawal),
            401 => Some(Self::EscrowLock),
            402 => Some(Self::EscrowUnlock),
            _ => None,
        }
    }
}

/// Channel lifecycle states.
pub mod channel_status {
    pub const JOINING: &str = "joining";
    pub const OPEN: &str = "open";
    pub const CLOSED: &str = "closed";
    pub const CHALLENGED: &str = "challenged";
    pub const RESIZING: &str = "resizing";
}

/// State transition intents, stored alongside the channel state.
pub mod intent {
    pub const OPERATE: i16 = 0;
    pub const INITIALIZE: i16 = 1;
    pub const RESIZE: i16 = 2;
    pub const FINALIZE: i16 = 3;
}

/// A custody channel between a wallet and the broker.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Channel {
    pub channel_id: String,
    pub chain_id: i64,
    pub token: String,
    pub wallet: String,
    pub participant: String,
    pub raw_amount: BigDecimal,
    pub status: String,
    pub nonce: i64,
    pub adjudicator: String,
    pub challenge_period: i64,
    pub state_intent: i16,
    pub state_version: i64,
    pub state_data: String,
    pub state_allocations: serde_json::Value,
    pub user_signature: Option<String>,
    pub server_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable double-entry ledger row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: String,
    pub account_type: i16,
    pub asset_symbol: String,
    pub wallet: String,
    pub credit: BigDecimal,
    pub debit: BigDecimal,
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub tx_type: i32,
    pub from_account: String,
    pub to_account: String,
    pub asset_symbol: String,
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
}

/// Ledger transaction joined with the user tags of both ends.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaggedLedgerTransaction {
    pub id: i64,
    pub tx_type: i32,
    pub from_account: String,
    pub from_account_tag: Option<String>,
    pub to_account: String,
    pub to_account_tag: Option<String>,
    pub asset_symbol: String,
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
}

/// A virtual application session.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AppSession {
    pub session_id: String,
    pub protocol: String,
    pub application: String,
    pub challenge: i64,
    pub nonce: i64,
    pub participants: serde_json::Value,
    pub weights: serde_json::Value,
    pub quorum: i64,
    pub session_data: Option<String>,
    pub version: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppSession {
    pub fn participant_wallets(&self) -> Vec<String> {
        serde_json::from_value(self.participants.clone()).unwrap_or_default()
    }

    pub fn weight_list(&self) -> Vec<i64> {
        serde_json::from_value(self.weights.clone()).unwrap_or_default()
    }
}

/// App session lifecycle states.
pub mod session_status {
    pub const OPEN: &str = "open";
    pub const CLOSED: &str = "closed";
}

/// A delegated session key bound to a wallet.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionKey {
    pub address: String,
    pub wallet: String,
    pub application: String,
    pub allowances: serde_json::Value,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One per-asset allowance on a session key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetAllowance {
    pub asset: String,
    pub amount: String,
}

/// A contract log already interpreted by the custody handler; the unique key
/// (chain_id, tx_hash, log_index) is the replay guard.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContractEvent {
    pub id: i64,
    pub chain_id: i64,
    pub contract_address: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub name: String,
    pub block_number: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A queued on-chain submission (checkpoint, withdraw, close).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlockchainAction {
    pub id: i64,
    pub channel_id: String,
    pub chain_id: i64,
    pub action_type: String,
    pub data: serde_json::Value,
    pub status: String,
    pub retries: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub mod action_status {
    pub const PENDING: &str = "pending";
    pub const IN_FLIGHT: &str = "in_flight";
    pub const DONE: &str = "done";
    pub const FAILED: &str = "failed";
}

pub mod action_type {
    pub const CHECKPOINT: &str = "checkpoint";
    pub const WITHDRAW: &str = "withdraw";
    pub const CLOSE: &str = "close";
}

/// A supported token on a chain, keyed by (chain_id, token).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Asset {
    pub symbol: String,
    pub chain_id: i64,
    pub token: String,
    pub decimals: i16,
}

/// Human-readable 6-character handle mapped 1:1 to a wallet.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserTag {
    pub id: i64,
    pub wallet: String,
    pub tag: String,
}

/// Persisted RPC request/response pair for the history group.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RpcRecord {
    pub id: i64,
    pub sender: String,
    pub req_id: i64,
    pub method: String,
    pub params: serde_json::Value,
    pub ts: i64,
    pub req_sig: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub res_sig: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_codes() {
        assert_eq!(TransactionType::Transfer.as_i32(), 100);
        assert_eq!(TransactionType::Deposit.as_i32(), 201);
        assert_eq!(TransactionType::Withdrawal.as_i32(), 202);
        assert_eq!(TransactionType::AppDeposit.as_i32(), 301);
        assert_eq!(TransactionType::AppWithdrawal.as_i32(), 302);
        assert_eq!(TransactionType::EscrowLock.as_i32(), 401);
        assert_eq!(TransactionType::EscrowUnlock.as_i32(), 402);
        assert_eq!(
            TransactionType::from_i32(301),
            Some(TransactionType::AppDeposit)
        );
        assert_eq!(TransactionType::from_i32(999), None);
    }
}
