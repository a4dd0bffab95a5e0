pub mod bitcoind;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub confirmations: u32,
}

/// Block height notifications and the on-chain lookups swaps need.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Stream of block heights, starting with the current tip. The stream
    /// closes when the backend is lost.
    async fn subscribe_heights(&self) -> Result<mpsc::Receiver<u32>>;

    /// First unspent output paying to `script_pubkey`.
    async fn find_output(&self, script_pubkey: &ScriptBuf) -> Result<Option<ChainOutput>>;

    /// Whether `outpoint` has been spent, counting the mempool.
    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool>;

    /// Confirmations of `txid`, `Some(0)` while in the mempool and `None` if
    /// unknown.
    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;
}
