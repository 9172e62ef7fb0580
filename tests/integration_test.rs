//! Integration tests for the ledger engine and stores.
//!
//! Run with: DATABASE_URL=postgres://... cargo test --test integration_test -- --nocapture
//!
//! Prerequisites:
//! - PostgreSQL reachable at DATABASE_URL
//!
//! Tests skip (pass vacuously) when DATABASE_URL is not set.

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use clearnode::db::{self, models::AccountType, models::AssetAllowance, models::TransactionType};
use clearnode::ledger::{self, Ledger, Posting};
use clearnode::session_keys::{SessionKeyError, SessionKeyStore};

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = db::create_pool(&url).await.ok()?;
    db::run_migrations(&pool).await.ok()?;
    Some(pool)
}

/// Unique hex address per test run so reruns do not collide.
fn fresh_wallet(salt: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("0x{:040x}", (nanos ^ salt.rotate_left(17)) as u128)
}

fn d(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

async fn fund(pool: &sqlx::PgPool, wallet: &str, asset: &str, amount: &BigDecimal) {
    let mut tx = pool.begin().await.unwrap();
    ledger::post_transfer(
        &mut tx,
        TransactionType::Deposit,
        Posting {
            account_id: "faucet",
            account_type: AccountType::Channel,
            wallet: "faucet",
            session_key: None,
        },
        Posting {
            account_id: wallet,
            account_type: AccountType::Wallet,
            wallet,
            session_key: None,
        },
        asset,
        amount,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_double_entry_conservation() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let alice = fresh_wallet(1);
    let bob = fresh_wallet(2);
    fund(&pool, &alice, "usdc", &d("10")).await;

    let mut tx = pool.begin().await.unwrap();
    let tx_id = ledger::post_transfer(
        &mut tx,
        TransactionType::Transfer,
        Posting {
            account_id: &alice,
            account_type: AccountType::Wallet,
            wallet: &alice,
            session_key: None,
        },
        Posting {
            account_id: &bob,
            account_type: AccountType::Wallet,
            wallet: &bob,
            session_key: None,
        },
        "usdc",
        &d("3"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let alice_balance = Ledger::new(&alice)
        .balance(&mut conn, &alice, "usdc")
        .await
        .unwrap();
    let bob_balance = Ledger::new(&bob)
        .balance(&mut conn, &bob, "usdc")
        .await
        .unwrap();
    assert_eq!(alice_balance, d("7"));
    assert_eq!(bob_balance, d("3"));

    // The two entries of the transfer must net to zero.
    assert_eq!(&alice_balance + &bob_balance, d("10"));

    let record = ledger::get_ledger_transaction(&mut conn, tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.tx_type, TransactionType::Transfer.as_i32());
    assert_eq!(record.from_account, alice);
    assert_eq!(record.to_account, bob);
    assert_eq!(record.amount, d("3"));
}

#[tokio::test]
async fn test_balances_exclude_other_accounts() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let wallet = fresh_wallet(3);
    let session = format!("0x{:064x}", 0xabcdu64);
    fund(&pool, &wallet, "usdc", &d("5")).await;

    let mut tx = pool.begin().await.unwrap();
    ledger::post_transfer(
        &mut tx,
        TransactionType::AppDeposit,
        Posting {
            account_id: &wallet,
            account_type: AccountType::Wallet,
            wallet: &wallet,
            session_key: None,
        },
        Posting {
            account_id: &session,
            account_type: AccountType::AppSession,
            wallet: &wallet,
            session_key: None,
        },
        "usdc",
        &d("2"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let ledger_view = Ledger::new(&wallet);
    assert_eq!(
        ledger_view.balance(&mut conn, &wallet, "usdc").await.unwrap(),
        d("3")
    );
    assert_eq!(
        ledger_view.balance(&mut conn, &session, "usdc").await.unwrap(),
        d("2")
    );

    let balances = ledger_view.get_balances(&mut conn, &wallet).await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].asset, "usdc");
}

#[tokio::test]
async fn test_contract_event_idempotence() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let tx_hash = format!("0x{:064x}", SystemTime::now().elapsed().unwrap_or_default().as_nanos());
    let custody = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    let mut tx = pool.begin().await.unwrap();
    let first = db::record_contract_event(
        &mut tx, 137, custody, &tx_hash, 4, "Created", 1000, &serde_json::json!({}),
    )
    .await
    .unwrap();
    let second = db::record_contract_event(
        &mut tx, 137, custody, &tx_hash, 4, "Created", 1000, &serde_json::json!({}),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert!(first, "first insert must be fresh");
    assert!(!second, "replayed event must be detected");
}

#[tokio::test]
async fn test_session_key_spending_cap() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let wallet = fresh_wallet(4);
    let key = fresh_wallet(5);
    fund(&pool, &wallet, "usdc", &d("100")).await;

    let store = SessionKeyStore::new(pool.clone());
    store
        .add(
            &wallet,
            &key,
            "console",
            "app.transfer",
            &[AssetAllowance {
                asset: "usdc".to_string(),
                amount: "5".to_string(),
            }],
            Utc::now() + Duration::hours(1),
        )
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    store
        .validate_spending(&mut conn, &key, "usdc", &d("3"))
        .await
        .unwrap();

    // Spend 3 tagged with the key, then 3 more must exceed the 5 cap.
    let recipient = fresh_wallet(6);
    let mut tx = pool.begin().await.unwrap();
    ledger::post_transfer(
        &mut tx,
        TransactionType::Transfer,
        Posting {
            account_id: &wallet,
            account_type: AccountType::Wallet,
            wallet: &wallet,
            session_key: Some(&key),
        },
        Posting {
            account_id: &recipient,
            account_type: AccountType::Wallet,
            wallet: &recipient,
            session_key: None,
        },
        "usdc",
        &d("3"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let err = store
        .validate_spending(&mut conn, &key, "usdc", &d("3"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionKeyError::AllowanceExceeded { .. }));

    // Within the remaining cap still passes.
    store
        .validate_spending(&mut conn, &key, "usdc", &d("2"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_session_key_replacement_per_application() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let wallet = fresh_wallet(7);
    let first = fresh_wallet(8);
    let second = fresh_wallet(9);
    let expiry = Utc::now() + Duration::hours(1);

    let store = SessionKeyStore::new(pool.clone());
    store
        .add(&wallet, &first, "console", "", &[], expiry)
        .await
        .unwrap();
    store
        .add(&wallet, &second, "console", "", &[], expiry)
        .await
        .unwrap();

    // The replacement evicts the prior key for (wallet, application).
    assert_eq!(store.resolve(&first).await, None);
    assert_eq!(store.resolve(&second).await, Some(wallet.clone()));

    // A key registered to one wallet cannot be claimed by another.
    let other_wallet = fresh_wallet(10);
    let err = store
        .add(&other_wallet, &second, "console", "", &[], expiry)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionKeyError::BoundElsewhere));
}

#[tokio::test]
async fn test_action_queue_retry_flow() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let channel_id = format!("0x{:064x}", SystemTime::now().elapsed().unwrap_or_default().as_nanos());
    let mut tx = pool.begin().await.unwrap();
    let id = db::enqueue_action(&mut tx, &channel_id, 137, "checkpoint", &serde_json::json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let due = db::due_actions(&pool, 100).await.unwrap();
    assert!(due.iter().any(|a| a.id == id));

    // A retry scheduled in the future keeps the action out of the due set.
    db::mark_action_retry(&pool, id, Utc::now() + Duration::hours(1), "nonce too low")
        .await
        .unwrap();
    let due = db::due_actions(&pool, 100).await.unwrap();
    assert!(!due.iter().any(|a| a.id == id));

    db::mark_action_done(&pool, id).await.unwrap();
}
