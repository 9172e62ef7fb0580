//! Custody contract ABI bindings and channel state encoding.
//!
//! Uses alloy's sol! macro to generate type-safe bindings. The state hash is
//! the digest both parties sign: keccak256 of the ABI encoding of
//! (channelId, intent, version, data, allocations).

#![allow(clippy::too_many_arguments)]

use std::str::FromStr;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolValue;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

sol! {
    /// Custody contract interface
    #[sol(rpc)]
    contract Custody {
        struct Allocation {
            address destination;
            address token;
            uint256 amount;
        }

        struct ChannelDef {
            address[] participants;
            address adjudicator;
            uint64 challenge;
            uint64 nonce;
        }

        struct State {
            uint8 intent;
            uint256 version;
            bytes data;
            Allocation[] allocations;
        }

        /// Record a more recent off-chain state for a challenged channel
        function checkpoint(bytes32 channelId, State calldata candidate, bytes[] calldata sigs) external;

        /// Finalize a channel with a mutually signed final state
        function close(bytes32 channelId, State calldata candidate, bytes[] calldata sigs) external;

        /// Withdraw unlocked funds from the custody balance
        function withdraw(address token, uint256 amount) external;

        // ========================================================================
        // Events
        // ========================================================================

        /// Channel created by the participant; the broker must join
        event Created(bytes32 indexed channelId, address indexed wallet, ChannelDef channel, State initial);

        /// Broker joined; the channel is operational
        event Joined(bytes32 indexed channelId, uint256 index);

        /// Channel finalized on-chain
        event Closed(bytes32 indexed channelId, State finalState);

        /// A state was challenged on-chain
        event Challenged(bytes32 indexed channelId, State state, uint256 expiration);

        /// Channel allocation resized
        event Resized(bytes32 indexed channelId, int256[] deltaAllocations);
    }
}

/// Deterministic channel identifier: keccak256 of the ABI encoding of the
/// definition plus the chain id.
pub fn channel_id(def: &Custody::ChannelDef, chain_id: u64) -> B256 {
    let encoded = (
        def.participants.clone(),
        def.adjudicator,
        def.challenge,
        def.nonce,
        chain_id,
    )
        .abi_encode();
    keccak256(encoded)
}

/// Digest signed by both parties over an unsigned state.
pub fn state_hash(channel: B256, state: &Custody::State) -> B256 {
    let encoded = (
        channel,
        U256::from(state.intent),
        state.version,
        state.data.clone(),
        state.allocations.clone(),
    )
        .abi_encode();
    keccak256(encoded)
}

/// JSON form of an allocation as carried in RPC payloads and stored rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireAllocation {
    pub destination: String,
    pub token: String,
    pub amount: String,
}

/// JSON form of an unsigned channel state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireState {
    pub intent: u8,
    pub version: u64,
    pub state_data: String,
    pub allocations: Vec<WireAllocation>,
}

impl WireAllocation {
    pub fn to_sol(&self) -> Result<Custody::Allocation> {
        Ok(Custody::Allocation {
            destination: parse_address(&self.destination)?,
            token: parse_address(&self.token)?,
            amount: U256::from_str_radix(&self.amount, 10)
                .map_err(|e| eyre!("invalid allocation amount {:?}: {e}", self.amount))?,
        })
    }

    pub fn from_sol(a: &Custody::Allocation) -> Self {
        Self {
            destination: format!("{:#x}", a.destination),
            token: format!("{:#x}", a.token),
            amount: a.amount.to_string(),
        }
    }
}

impl WireState {
    pub fn to_sol(&self) -> Result<Custody::State> {
        let allocations = self
            .allocations
            .iter()
            .map(WireAllocation::to_sol)
            .collect::<Result<Vec<_>>>()?;
        Ok(Custody::State {
            intent: self.intent,
            version: U256::from(self.version),
            data: parse_bytes(&self.state_data)?,
            allocations,
        })
    }

    pub fn from_sol(state: &Custody::State) -> Self {
        Self {
            intent: state.intent,
            version: state.version.try_into().unwrap_or(u64::MAX),
            state_data: format!("0x{}", hex::encode(&state.data)),
            allocations: state
                .allocations
                .iter()
                .map(WireAllocation::from_sol)
                .collect(),
        }
    }
}

pub fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).wrap_err_with(|| format!("invalid address {s:?}"))
}

pub fn parse_bytes(s: &str) -> Result<Bytes> {
    let stripped = s.trim_start_matches("0x");
    let raw = hex::decode(stripped).wrap_err_with(|| format!("invalid hex data {s:?}"))?;
    Ok(Bytes::from(raw))
}

pub fn parse_channel_id(s: &str) -> Result<B256> {
    B256::from_str(s).wrap_err_with(|| format!("invalid channel id {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn def() -> Custody::ChannelDef {
        Custody::ChannelDef {
            participants: vec![
                address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
                address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            ],
            adjudicator: address!("5FbDB2315678afecb367f032d93F642f64180aa3"),
            challenge: 3600,
            nonce: 7,
        }
    }

    #[test]
    fn test_channel_id_deterministic() {
        assert_eq!(channel_id(&def(), 1), channel_id(&def(), 1));
        assert_ne!(channel_id(&def(), 1), channel_id(&def(), 137));

        let mut other = def();
        other.nonce = 8;
        assert_ne!(channel_id(&def(), 1), channel_id(&other, 1));
    }

    #[test]
    fn test_state_hash_varies_with_version() {
        let id = channel_id(&def(), 1);
        let mut state = Custody::State {
            intent: 0,
            version: U256::from(1),
            data: Bytes::new(),
            allocations: vec![],
        };
        let h1 = state_hash(id, &state);
        state.version = U256::from(2);
        let h2 = state_hash(id, &state);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_wire_state_round_trip() {
        let wire = WireState {
            intent: 2,
            version: 5,
            state_data: "0x0000000000000000000000000000000000000000000000000000000000000001"
                .to_string(),
            allocations: vec![WireAllocation {
                destination: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
                token: "0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string(),
                amount: "1500000".to_string(),
            }],
        };
        let sol = wire.to_sol().unwrap();
        assert_eq!(sol.intent, 2);
        assert_eq!(sol.version, U256::from(5));
        assert_eq!(sol.allocations[0].amount, U256::from(1_500_000u64));

        let back = WireState::from_sol(&sol);
        assert_eq!(back.version, wire.version);
        assert_eq!(back.allocations[0].amount, wire.allocations[0].amount);
    }

    #[test]
    fn test_parse_bytes_rejects_bad_hex() {
        assert!(parse_bytes("0xzz").is_err());
        assert_eq!(parse_bytes("0x").unwrap().len(), 0);
    }
}
