use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::{FeeRate, OutPoint, ScriptBuf, Transaction, Txid};
use bitcoincore_rpc::json::ScanTxOutRequest;
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use tokio::sync::{Mutex, mpsc};

use super::{ChainOutput, ChainSource};
use crate::sweep::FeeEstimator;

const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;
const MIN_FEE_RATE_SAT_PER_KWU: u64 = 253;

/// Chain backend over bitcoind JSON-RPC. The RPC client is blocking, so every
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct BitcoindChain {
    rpc: Arc<Client>,
    poll_interval: Duration,
    // bitcoind rejects concurrent `scantxoutset` calls.
    scan_lock: Arc<Mutex<()>>,
}

impl BitcoindChain {
    pub fn new(url: &str, user: String, password: String, poll_interval: Duration) -> Result<Self> {
        let rpc = Client::new(url, Auth::UserPass(user, password))
            .context("create bitcoind rpc client")?;
        Ok(Self {
            rpc: Arc::new(rpc),
            poll_interval,
            scan_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> bitcoincore_rpc::Result<T> + Send + 'static,
    {
        let rpc = self.rpc.clone();
        tokio::task::spawn_blocking(move || f(&rpc))
            .await
            .with_context(|| format!("join {op}"))?
            .with_context(|| op.to_string())
    }
}

fn rpc_error_code(err: &anyhow::Error) -> Option<i32> {
    match err.downcast_ref::<bitcoincore_rpc::Error>()? {
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(e)) => Some(e.code),
        _ => None,
    }
}

#[async_trait]
impl ChainSource for BitcoindChain {
    async fn subscribe_heights(&self) -> Result<mpsc::Receiver<u32>> {
        let initial = self
            .call("getblockcount", |rpc| rpc.get_block_count())
            .await?;
        let initial = u32::try_from(initial).context("block height out of range")?;

        let (tx, rx) = mpsc::channel(16);
        tx.send(initial)
            .await
            .map_err(|_| anyhow::anyhow!("height receiver dropped"))?;

        let chain = self.clone();
        tokio::spawn(async move {
            let mut last = initial;
            let mut failures = 0;
            loop {
                tokio::time::sleep(chain.poll_interval).await;
                if tx.is_closed() {
                    return;
                }

                match chain
                    .call("getblockcount", |rpc| rpc.get_block_count())
                    .await
                {
                    Ok(height) => {
                        failures = 0;
                        let Ok(height) = u32::try_from(height) else {
                            tracing::error!(height, "block height out of range");
                            return;
                        };
                        if height != last {
                            last = height;
                            if tx.send(height).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        tracing::warn!(error = %format!("{err:#}"), failures, "poll block height");
                        if failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                            tracing::error!("giving up on bitcoind height notifications");
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn find_output(&self, script_pubkey: &ScriptBuf) -> Result<Option<ChainOutput>> {
        let descriptor = format!("raw({})", hex::encode(script_pubkey.as_bytes()));
        let _guard = self.scan_lock.lock().await;

        let tip = self
            .call("getblockcount", |rpc| rpc.get_block_count())
            .await?;
        let scan = self
            .call("scantxoutset", move |rpc| {
                rpc.scan_tx_out_set_blocking(&[ScanTxOutRequest::Single(descriptor)])
            })
            .await?;

        let Some(utxo) = scan.unspents.into_iter().next() else {
            return Ok(None);
        };
        let confirmations = tip.saturating_sub(utxo.height).saturating_add(1);
        Ok(Some(ChainOutput {
            outpoint: OutPoint::new(utxo.txid, utxo.vout),
            value: utxo.amount,
            confirmations: u32::try_from(confirmations).unwrap_or(u32::MAX),
        }))
    }

    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let outpoint = *outpoint;
        let out = self
            .call("gettxout", move |rpc| {
                rpc.get_tx_out(&outpoint.txid, outpoint.vout, Some(true))
            })
            .await?;
        Ok(out.is_none())
    }

    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>> {
        let txid = *txid;
        match self
            .call("getrawtransaction", move |rpc| {
                rpc.get_raw_transaction_info(&txid, None)
            })
            .await
        {
            Ok(info) => Ok(Some(info.confirmations.unwrap_or(0))),
            Err(err) if rpc_error_code(&err) == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        let tx = tx.clone();
        match self
            .call("sendrawtransaction", move |rpc| rpc.send_raw_transaction(&tx))
            .await
        {
            Ok(txid) => Ok(txid),
            Err(err) if rpc_error_code(&err) == Some(RPC_VERIFY_ALREADY_IN_CHAIN) => Ok(txid),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl FeeEstimator for BitcoindChain {
    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<FeeRate> {
        let estimate = self
            .call("estimatesmartfee", move |rpc| {
                rpc.estimate_smart_fee(conf_target, None)
            })
            .await?;
        let per_kvb = estimate.fee_rate.with_context(|| {
            format!(
                "no fee estimate for target {conf_target}: {:?}",
                estimate.errors
            )
        })?;
        let per_kwu = (per_kvb.to_sat() / 4).max(MIN_FEE_RATE_SAT_PER_KWU);
        Ok(FeeRate::from_sat_per_kwu(per_kwu))
    }
}
