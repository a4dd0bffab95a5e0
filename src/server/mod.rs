pub mod grpc;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::swap::SwapHash;

/// Terms on which the server executes uncharge swaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnchargeTerms {
    /// Node the off-chain swap payment is routed to, hex encoded.
    pub swap_payment_dest: String,
    pub swap_fee_base: u64,
    /// Proportional fee in parts per million.
    pub swap_fee_rate: u64,
    pub prepay_amt: u64,
    pub min_swap_amount: u64,
    pub max_swap_amount: u64,
    pub cltv_delta: u32,
}

#[derive(Debug, Clone)]
pub struct NewUnchargeSwap {
    pub hash: SwapHash,
    pub amount: u64,
    pub receiver_pubkey: PublicKey,
}

#[derive(Debug, Clone)]
pub struct NewUnchargeSwapResponse {
    pub swap_invoice: String,
    pub prepay_invoice: String,
    pub sender_pubkey: PublicKey,
    pub expiry: u32,
}

#[async_trait]
pub trait SwapServer: Send + Sync {
    async fn get_uncharge_terms(&self) -> Result<UnchargeTerms>;

    async fn new_uncharge_swap(&self, request: NewUnchargeSwap) -> Result<NewUnchargeSwapResponse>;
}

/// Bounds one server round-trip by `timeout`.
pub async fn with_timeout<T>(
    op: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(SwapError::ServerTimeout { op, timeout }.into()),
    }
}
