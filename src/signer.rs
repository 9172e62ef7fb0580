//! Broker key operations.
//!
//! All off-chain payloads are signed as raw keccak256 digests (no EIP-191
//! prefix); the EIP-712 path exists only for the session-key Policy challenge.

use alloy::primitives::{keccak256, Address, PrimitiveSignature as Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct};

sol! {
    /// Per-asset spending cap attached to a session key.
    struct Allowance {
        string asset;
        string amount;
    }

    /// Typed payload a wallet signs to delegate a session key.
    struct Policy {
        string challenge;
        string scope;
        address wallet;
        address session_key;
        uint64 expires_at;
        Allowance[] allowances;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signature must be 65 bytes, got {0}")]
    BadLength(usize),
    #[error("invalid recovery id {0}")]
    BadRecoveryId(u8),
    #[error("invalid private key: {0}")]
    BadKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("recovery failed: {0}")]
    Recovery(String),
}

/// Signer wrapping the broker's secp256k1 key.
#[derive(Clone)]
pub struct Signer {
    inner: PrivateKeySigner,
    address: Address,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish()
    }
}

impl Signer {
    pub fn new(private_key: &str) -> Result<Self, SignerError> {
        let inner: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| SignerError::BadKey(format!("{e}")))?;
        let address = inner.address();
        Ok(Self { inner, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Raw private key bytes, used to derive the JWT signing key.
    pub fn key_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes().into()
    }

    /// Clone of the underlying key for wallet-backed providers.
    pub fn alloy_signer(&self) -> PrivateKeySigner {
        self.inner.clone()
    }

    /// Sign keccak256(payload), returning the canonical 65-byte form with
    /// v ∈ {27, 28}.
    pub fn sign(&self, payload: &[u8]) -> Result<[u8; 65], SignerError> {
        let digest = keccak256(payload);
        self.sign_digest(digest)
    }

    pub fn sign_digest(&self, digest: B256) -> Result<[u8; 65], SignerError> {
        let sig = self
            .inner
            .sign_hash_sync(&digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(encode_signature(&sig))
    }

    /// Recover the signing address of keccak256(payload). Accepts v in both
    /// {0, 1} and {27, 28}.
    pub fn recover_raw(payload: &[u8], sig_bytes: &[u8]) -> Result<Address, SignerError> {
        let digest = keccak256(payload);
        Self::recover_digest(digest, sig_bytes)
    }

    pub fn recover_digest(digest: B256, sig_bytes: &[u8]) -> Result<Address, SignerError> {
        let sig = parse_signature(sig_bytes)?;
        sig.recover_address_from_prehash(&digest)
            .map_err(|e| SignerError::Recovery(e.to_string()))
    }

    /// Recover the signer of an EIP-712 Policy under the domain
    /// `{name: application}`.
    pub fn recover_eip712(
        application: &str,
        policy: &Policy,
        sig_bytes: &[u8],
    ) -> Result<Address, SignerError> {
        let domain = Eip712Domain {
            name: Some(application.to_string().into()),
            version: None,
            chain_id: None,
            verifying_contract: None,
            salt: None,
        };
        let digest = policy.eip712_signing_hash(&domain);
        Self::recover_digest(digest, sig_bytes)
    }

    /// Sign an EIP-712 Policy; used by tests and by integration tooling.
    pub fn sign_eip712(&self, application: &str, policy: &Policy) -> Result<[u8; 65], SignerError> {
        let domain = Eip712Domain {
            name: Some(application.to_string().into()),
            version: None,
            chain_id: None,
            verifying_contract: None,
            salt: None,
        };
        self.sign_digest(policy.eip712_signing_hash(&domain))
    }
}

fn encode_signature(sig: &Signature) -> [u8; 65] {
    let mut out = [0u8; 65];
    out[..32].copy_from_slice(&sig.r().to_be_bytes::<32>());
    out[32..64].copy_from_slice(&sig.s().to_be_bytes::<32>());
    out[64] = 27 + sig.v() as u8;
    out
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, SignerError> {
    if bytes.len() != 65 {
        return Err(SignerError::BadLength(bytes.len()));
    }
    let parity: bool = match bytes[64] {
        0 | 27 => false,
        1 | 28 => true,
        other => return Err(SignerError::BadRecoveryId(other)),
    };
    Ok(Signature::from_bytes_and_parity(&bytes[..64], parity))
}

/// Decode a hex signature string (with or without 0x prefix).
pub fn decode_sig_hex(s: &str) -> Result<Vec<u8>, SignerError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| SignerError::Recovery(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_address_matches_known_key() {
        let signer = Signer::new(TEST_KEY).unwrap();
        // First Anvil dev account.
        assert_eq!(
            signer.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
    }

    #[test]
    fn test_sign_recover_round_trip() {
        let signer = Signer::new(TEST_KEY).unwrap();
        let payload = b"clearnode request payload";
        let sig = signer.sign(payload).unwrap();
        assert_eq!(sig.len(), 65);
        assert!(sig[64] == 27 || sig[64] == 28);

        let recovered = Signer::recover_raw(payload, &sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_recover_accepts_zero_one_parity() {
        let signer = Signer::new(TEST_KEY).unwrap();
        let payload = b"parity normalization";
        let mut sig = signer.sign(payload).unwrap();
        sig[64] -= 27;
        assert!(sig[64] == 0 || sig[64] == 1);

        let recovered = Signer::recover_raw(payload, &sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_bad_length_rejected() {
        let err = Signer::recover_raw(b"x", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, SignerError::BadLength(64)));
    }

    #[test]
    fn test_bad_recovery_id_rejected() {
        let mut sig = [0u8; 65];
        sig[64] = 5;
        let err = Signer::recover_raw(b"x", &sig).unwrap_err();
        assert!(matches!(err, SignerError::BadRecoveryId(5)));
    }

    #[test]
    fn test_eip712_policy_round_trip() {
        let signer = Signer::new(TEST_KEY).unwrap();
        let policy = Policy {
            challenge: "f8b8ea0f-52d7-4b23-b5d9-1d4f54b3c7a9".to_string(),
            scope: "app.create".to_string(),
            wallet: signer.address(),
            session_key: address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            expires_at: 1_900_000_000,
            allowances: vec![Allowance {
                asset: "usdc".to_string(),
                amount: "100".to_string(),
            }],
        };
        let sig = signer.sign_eip712("console", &policy).unwrap();
        let recovered = Signer::recover_eip712("console", &policy, &sig).unwrap();
        assert_eq!(recovered, signer.address());

        // A different domain name must not verify back to the wallet.
        let other = Signer::recover_eip712("other-app", &policy, &sig).unwrap();
        assert_ne!(other, signer.address());
    }
}
