pub mod machine;
pub mod store;
pub mod uncharge;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

pub use uncharge::{SwapConfig, UnchargeSwap};

/// 32-byte identifier of a swap: the SHA-256 of its preimage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapHash(pub [u8; 32]);

impl SwapHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapHash({self})")
    }
}

impl FromStr for SwapHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("decode swap hash")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("swap hash must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for SwapHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SwapHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Pending,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Initiated,
    HtlcBroadcast,
    AwaitingConfirmation,
    OffchainSettled,
    Success,
    Failed,
    Expired,
}

impl SwapState {
    pub fn state_type(self) -> StateType {
        match self {
            SwapState::Initiated
            | SwapState::HtlcBroadcast
            | SwapState::AwaitingConfirmation
            | SwapState::OffchainSettled => StateType::Pending,
            SwapState::Success | SwapState::Failed | SwapState::Expired => StateType::Terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.state_type() == StateType::Terminal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Initiated => "initiated",
            SwapState::HtlcBroadcast => "htlc_broadcast",
            SwapState::AwaitingConfirmation => "awaiting_confirmation",
            SwapState::OffchainSettled => "offchain_settled",
            SwapState::Success => "success",
            SwapState::Failed => "failed",
            SwapState::Expired => "expired",
        }
    }

    pub const PENDING: [SwapState; 4] = [
        SwapState::Initiated,
        SwapState::HtlcBroadcast,
        SwapState::AwaitingConfirmation,
        SwapState::OffchainSettled,
    ];
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "initiated" => SwapState::Initiated,
            "htlc_broadcast" => SwapState::HtlcBroadcast,
            "awaiting_confirmation" => SwapState::AwaitingConfirmation,
            "offchain_settled" => SwapState::OffchainSettled,
            "success" => SwapState::Success,
            "failed" => SwapState::Failed,
            "expired" => SwapState::Expired,
            other => anyhow::bail!("unknown swap state: {other}"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnchargeRequest {
    /// Amount in satoshis to move on-chain.
    pub amount: u64,
    pub dest_addr: String,
    pub max_swap_fee: u64,
    pub max_prepay_amount: u64,
    pub max_miner_fee: u64,
    pub sweep_conf_target: u16,
    pub uncharge_channel: Option<u64>,
}

/// Immutable terms of a swap, fixed once the server accepted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnchargeContract {
    pub amount: u64,
    pub dest_addr: String,
    pub max_swap_fee: u64,
    pub max_prepay_amount: u64,
    pub max_miner_fee: u64,
    pub sweep_conf_target: u16,
    pub uncharge_channel: Option<u64>,

    pub swap_invoice: String,
    pub prepay_invoice: String,
    pub preimage_hex: String,
    pub receiver_key_hex: String,
    pub sender_pubkey: String,
    pub cltv_expiry: u32,

    pub initiation_height: u32,
    pub initiation_time: u64,
}

impl UnchargeContract {
    pub fn preimage_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.preimage_hex).context("decode preimage_hex")?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))
    }

    pub fn receiver_secret_key(&self) -> Result<SecretKey> {
        let bytes = hex::decode(&self.receiver_key_hex).context("decode receiver_key_hex")?;
        SecretKey::from_slice(&bytes).context("parse receiver key")
    }
}

/// Protocol data learned while the swap runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapArtifacts {
    pub htlc_outpoint: Option<String>,
    pub htlc_value: Option<u64>,
    pub sweep_txid: Option<String>,
    pub sweep_tx_hex: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub state: SwapState,
    pub height: u32,
    pub time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    pub hash: SwapHash,
    pub contract: UnchargeContract,
    pub artifacts: SwapArtifacts,
    pub events: Vec<SwapEvent>,
}

impl SwapRecord {
    pub fn state(&self) -> SwapState {
        self.events
            .last()
            .map(|e| e.state)
            .unwrap_or(SwapState::Initiated)
    }

    pub fn last_update(&self) -> Option<&SwapEvent> {
        self.events.last()
    }

    pub(crate) fn push_state(&mut self, state: SwapState, height: u32) -> &SwapEvent {
        self.events.push(SwapEvent {
            state,
            height,
            time: unix_time(),
        });
        &self.events[self.events.len() - 1]
    }
}

/// Status update emitted for every persisted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub hash: SwapHash,
    pub state: SwapState,
    pub height: u32,
    pub time: u64,
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
