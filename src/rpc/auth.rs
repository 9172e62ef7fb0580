//! Two-round challenge authentication, session binding and JWT issuance.
//!
//! Round one (`auth_request`) stores a single-use UUID challenge bound to the
//! requested policy. Round two (`auth_verify`) accepts either an EIP-712
//! signature over that policy or a previously issued JWT; on success the
//! connection is bound to the wallet and a fresh JWT is minted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::primitives::{keccak256, Address};
use chrono::{DateTime, TimeZone, Utc};
use eyre::{eyre, Result, WrapErr};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::AssetAllowance;
use crate::rpc::node::{AppState, RpcContext, RpcError};
use crate::signer::{decode_sig_hex, Allowance, Policy, Signer};

pub const CHALLENGE_TTL: Duration = Duration::from_secs(300);
pub const JWT_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Authenticated policy bound to a connection for its lifetime.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub wallet: String,
    pub session_key: Option<String>,
    pub application: String,
    pub scope: String,
    pub allowances: Vec<AssetAllowance>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AuthSession {
    pub fn expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone)]
struct PendingChallenge {
    wallet: String,
    session_key: Option<String>,
    application: String,
    scope: String,
    allowances: Vec<AssetAllowance>,
    expires_at: u64,
    issued: Instant,
}

/// Single-use challenge store with a short expiry window.
pub struct ChallengeStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, PendingChallenge>>,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn issue(&self, challenge: PendingChallenge) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().expect("challenge store mutex poisoned");
        // Opportunistically drop stale challenges so the map stays bounded.
        let ttl = self.ttl;
        inner.retain(|_, c| c.issued.elapsed() < ttl);
        inner.insert(id.clone(), challenge);
        id
    }

    fn take(&self, id: &str) -> Option<PendingChallenge> {
        let mut inner = self.inner.lock().expect("challenge store mutex poisoned");
        let challenge = inner.remove(id)?;
        if challenge.issued.elapsed() >= self.ttl {
            return None;
        }
        Some(challenge)
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new(CHALLENGE_TTL)
    }
}

// ============ JWT ============

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub wallet: String,
    pub participant: String,
    pub scope: String,
    pub application: String,
    pub allowances: Vec<AssetAllowance>,
    pub iat: u64,
    pub exp: u64,
}

/// ES256 token issuer. The P-256 signing key is derived deterministically
/// from the broker key so tokens stay valid across restarts.
pub struct JwtIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtIssuer {
    pub fn from_broker_key(key: &[u8; 32]) -> Result<Self> {
        let secret = derive_p256_key(key)?;
        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| eyre!("failed to encode JWT signing key: {e}"))?;
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| eyre!("failed to encode JWT verification key: {e}"))?;

        Ok(Self {
            encoding: EncodingKey::from_ec_pem(private_pem.as_bytes())
                .wrap_err("invalid JWT signing key")?,
            decoding: DecodingKey::from_ec_pem(public_pem.as_bytes())
                .wrap_err("invalid JWT verification key")?,
        })
    }

    pub fn mint(&self, session: &AuthSession) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            wallet: session.wallet.clone(),
            participant: session
                .session_key
                .clone()
                .unwrap_or_else(|| session.wallet.clone()),
            scope: session.scope.clone(),
            application: session.application.clone(),
            allowances: session.allowances.clone(),
            iat: now,
            exp: now + JWT_LIFETIME.as_secs(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.encoding)
            .wrap_err("failed to mint JWT")
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::ES256),
        )
        .wrap_err("invalid JWT")?;
        Ok(data.claims)
    }
}

fn derive_p256_key(broker_key: &[u8; 32]) -> Result<p256::SecretKey> {
    // keccak(broker_key || tag || counter); the counter absorbs the
    // negligible chance the digest falls outside the P-256 scalar field.
    for counter in 0u8..=255 {
        let mut material = Vec::with_capacity(32 + 13 + 1);
        material.extend_from_slice(broker_key);
        material.extend_from_slice(b"clearnode-jwt");
        material.push(counter);
        let digest = keccak256(&material);
        if let Ok(secret) = p256::SecretKey::from_slice(digest.as_slice()) {
            return Ok(secret);
        }
    }
    Err(eyre!("failed to derive JWT signing key"))
}

// ============ Wire shapes ============

#[derive(Debug, Deserialize)]
struct AuthRequestParams {
    #[serde(alias = "address")]
    wallet: String,
    session_key: Option<String>,
    #[serde(default)]
    application: String,
    #[serde(default)]
    allowances: Vec<AssetAllowance>,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    expires_at: u64,
}

#[derive(Debug, Deserialize)]
struct AuthVerifyParams {
    challenge: Option<String>,
    signature: Option<String>,
    jwt: Option<String>,
}

// ============ Handlers ============

pub async fn handle_auth_request(
    state: &AppState,
    ctx: &mut RpcContext,
) -> Result<serde_json::Value, RpcError> {
    let params: AuthRequestParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid auth_request params: {e}")))?;

    parse_wallet(&params.wallet)?;
    if let Some(key) = &params.session_key {
        parse_wallet(key)?;
    }

    let challenge = state.challenges.issue(PendingChallenge {
        wallet: params.wallet.to_lowercase(),
        session_key: params.session_key.map(|k| k.to_lowercase()),
        application: params.application,
        scope: params.scope,
        allowances: params.allowances,
        expires_at: params.expires_at,
        issued: Instant::now(),
    });

    ctx.response_method = Some("auth_challenge".to_string());
    Ok(json!({ "challenge_message": challenge }))
}

pub async fn handle_auth_verify(
    state: &AppState,
    ctx: &mut RpcContext,
) -> Result<serde_json::Value, RpcError> {
    let params: AuthVerifyParams = serde_json::from_value(ctx.request.params().clone())
        .map_err(|e| RpcError::Parse(format!("invalid auth_verify params: {e}")))?;

    let session = if let Some(token) = &params.jwt {
        verify_with_jwt(state, token)?
    } else {
        verify_with_signature(state, &params).await?
    };

    let wallet = session.wallet.clone();
    let session_key = session.session_key.clone();

    state.hub.reauthenticate(&ctx.conn_id, &wallet).await;
    let mut first_auth = false;
    if let Some(conn) = state.hub.get(&ctx.conn_id).await {
        let mut guard = conn.auth.lock().await;
        first_auth = guard.is_none();
        *guard = Some(session.clone());
    }

    let jwt_token = state.jwt.mint(&session).map_err(RpcError::Internal)?;

    let tag = ensure_tag(state, &wallet).await?;
    if let Err(e) = crate::db::log_user_action(
        &state.db,
        &wallet,
        "auth_verify",
        &json!({ "session_key": session_key, "application": session.application }),
    )
    .await
    {
        warn!(error = %e, "failed to record auth action");
    }

    info!(wallet = %wallet, conn_id = %ctx.conn_id, "connection authenticated");
    if first_auth {
        crate::metrics::AUTHENTICATED_SESSIONS.inc();
    }
    ctx.authenticated = true;

    Ok(json!({
        "address": wallet,
        "session_key": session_key,
        "user_tag": tag,
        "jwt_token": jwt_token,
        "success": true,
    }))
}

fn verify_with_jwt(state: &AppState, token: &str) -> Result<AuthSession, RpcError> {
    let claims = state
        .jwt
        .verify(token)
        .map_err(|_| RpcError::Auth("invalid or unsupported JWT".to_string()))?;
    // Successful JWT verification does not refresh the token lifetime.
    let expires_at = Utc
        .timestamp_opt(claims.exp as i64, 0)
        .single()
        .ok_or_else(|| RpcError::Auth("invalid JWT expiry".to_string()))?;
    Ok(AuthSession {
        wallet: claims.wallet.to_lowercase(),
        session_key: if claims.participant == claims.wallet {
            None
        } else {
            Some(claims.participant.to_lowercase())
        },
        application: claims.application,
        scope: claims.scope,
        allowances: claims.allowances,
        expires_at,
        last_activity: Utc::now(),
    })
}

async fn verify_with_signature(
    state: &AppState,
    params: &AuthVerifyParams,
) -> Result<AuthSession, RpcError> {
    let invalid = || RpcError::Auth("invalid challenge or signature".to_string());

    let challenge_id = params.challenge.as_deref().ok_or_else(invalid)?;
    let signature = params.signature.as_deref().ok_or_else(invalid)?;
    let pending = state.challenges.take(challenge_id).ok_or_else(invalid)?;

    let wallet = parse_wallet(&pending.wallet)?;
    let session_key = match &pending.session_key {
        Some(key) => parse_wallet(key)?,
        None => wallet,
    };

    let policy = Policy {
        challenge: challenge_id.to_string(),
        scope: pending.scope.clone(),
        wallet,
        session_key,
        expires_at: pending.expires_at,
        allowances: pending
            .allowances
            .iter()
            .map(|a| Allowance {
                asset: a.asset.clone(),
                amount: a.amount.clone(),
            })
            .collect(),
    };

    let sig_bytes = decode_sig_hex(signature).map_err(|_| invalid())?;
    let recovered = Signer::recover_eip712(&pending.application, &policy, &sig_bytes)
        .map_err(|_| invalid())?;
    if recovered != wallet {
        return Err(invalid());
    }

    let policy_expiry = if pending.expires_at > 0 {
        Utc.timestamp_opt(pending.expires_at as i64, 0)
            .single()
            .ok_or_else(invalid)?
    } else {
        Utc::now()
            + chrono::Duration::from_std(JWT_LIFETIME)
                .unwrap_or_else(|_| chrono::Duration::seconds(86_400))
    };

    if let Some(key) = &pending.session_key {
        if key != &pending.wallet {
            state
                .session_keys
                .add(
                    &pending.wallet,
                    key,
                    &pending.application,
                    &pending.scope,
                    &pending.allowances,
                    policy_expiry,
                )
                .await
                .map_err(|e| RpcError::Auth(e.to_string()))?;
        }
    }

    Ok(AuthSession {
        wallet: pending.wallet,
        session_key: pending.session_key,
        application: pending.application,
        scope: pending.scope,
        allowances: pending.allowances,
        expires_at: policy_expiry,
        last_activity: Utc::now(),
    })
}

async fn ensure_tag(state: &AppState, wallet: &str) -> Result<String, RpcError> {
    if let Some(existing) = crate::db::get_user_tag(&state.db, wallet)
        .await
        .map_err(RpcError::Internal)?
    {
        return Ok(existing.tag);
    }
    // Retry on the unlikely collision with another wallet's tag.
    for _ in 0..8 {
        let candidate = generate_tag();
        match crate::db::ensure_user_tag(&state.db, wallet, &candidate).await {
            Ok(tag) => return Ok(tag),
            Err(e) => warn!(error = %e, "user tag collision, retrying"),
        }
    }
    Err(RpcError::Internal(eyre!("could not allocate user tag")))
}

/// 6-character uppercase alphanumeric handle.
pub fn generate_tag() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn parse_wallet(s: &str) -> Result<Address, RpcError> {
    s.parse::<Address>()
        .map_err(|_| RpcError::Auth(format!("invalid wallet address {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingChallenge {
        PendingChallenge {
            wallet: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            session_key: None,
            application: "console".to_string(),
            scope: "".to_string(),
            allowances: vec![],
            expires_at: 0,
            issued: Instant::now(),
        }
    }

    #[test]
    fn test_challenge_single_use() {
        let store = ChallengeStore::default();
        let id = store.issue(pending());
        assert!(store.take(&id).is_some());
        assert!(store.take(&id).is_none());
    }

    #[test]
    fn test_challenge_expiry() {
        let store = ChallengeStore::new(Duration::from_millis(5));
        let id = store.issue(pending());
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.take(&id).is_none());
    }

    #[test]
    fn test_unknown_challenge_rejected() {
        let store = ChallengeStore::default();
        assert!(store.take("not-a-challenge").is_none());
    }

    #[test]
    fn test_jwt_round_trip() {
        let issuer = JwtIssuer::from_broker_key(&[7u8; 32]).unwrap();
        let session = AuthSession {
            wallet: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            session_key: Some("0x70997970c51812dc3a010c7d01b50e0d17dc79c8".to_string()),
            application: "console".to_string(),
            scope: "app.create".to_string(),
            allowances: vec![AssetAllowance {
                asset: "usdc".to_string(),
                amount: "100".to_string(),
            }],
            expires_at: Utc::now() + chrono::Duration::hours(1),
            last_activity: Utc::now(),
        };
        let token = issuer.mint(&session).unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.wallet, session.wallet);
        assert_eq!(
            claims.participant,
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        );
        assert_eq!(claims.allowances.len(), 1);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_jwt_from_other_broker_rejected() {
        let issuer_a = JwtIssuer::from_broker_key(&[7u8; 32]).unwrap();
        let issuer_b = JwtIssuer::from_broker_key(&[8u8; 32]).unwrap();
        let session = AuthSession {
            wallet: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            session_key: None,
            application: String::new(),
            scope: String::new(),
            allowances: vec![],
            expires_at: Utc::now() + chrono::Duration::hours(1),
            last_activity: Utc::now(),
        };
        let token = issuer_a.mint(&session).unwrap();
        assert!(issuer_b.verify(&token).is_err());
    }

    #[test]
    fn test_generate_tag_shape() {
        for _ in 0..32 {
            let tag = generate_tag();
            assert_eq!(tag.len(), 6);
            assert!(tag
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
