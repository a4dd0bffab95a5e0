use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight,
    Witness,
};

use crate::htlc::Htlc;

/// Weight of a one-input one-output segwit sweep without its witness,
/// assuming the largest standard output script (P2WSH/P2TR).
const SWEEP_BASE_WEIGHT: u64 = 4 * (4 + 1 + 41 + 1 + 43 + 4) + 2;

#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<FeeRate>;
}

/// Builds transactions claiming swap HTLCs.
#[derive(Clone)]
pub struct Sweeper {
    fees: Arc<dyn FeeEstimator>,
}

impl Sweeper {
    pub fn new(fees: Arc<dyn FeeEstimator>) -> Self {
        Self { fees }
    }

    /// Miner fee for a sweep whose witness is at most `witness_size` bytes,
    /// confirming within `conf_target` blocks.
    pub async fn get_sweep_fee(&self, witness_size: usize, conf_target: u16) -> Result<Amount> {
        let fee_rate = self
            .fees
            .estimate_fee_rate(conf_target)
            .await
            .with_context(|| format!("estimate fee for conf target {conf_target}"))?;
        let weight = Weight::from_wu(SWEEP_BASE_WEIGHT + witness_size as u64);
        fee_rate
            .fee_wu(weight)
            .context("sweep fee overflow")
    }

    pub fn create_sweep_tx(
        &self,
        htlc: &Htlc,
        outpoint: OutPoint,
        htlc_value: Amount,
        dest: &Address,
        fee: Amount,
        receiver_key: &SecretKey,
        preimage: &[u8; 32],
    ) -> Result<Transaction> {
        let dest_script: ScriptBuf = dest.script_pubkey();
        let value = htlc_value
            .checked_sub(fee)
            .filter(|v| *v >= dest_script.minimal_non_dust())
            .with_context(|| format!("htlc value {htlc_value} does not cover sweep fee {fee}"))?;

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: dest_script,
            }],
        };

        let witness_script = htlc.witness_script();
        let sighash = SighashCache::new(&tx)
            .p2wsh_signature_hash(0, &witness_script, htlc_value, EcdsaSighashType::All)
            .context("compute sweep sighash")?;

        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = bitcoin::ecdsa::Signature {
            signature: secp.sign_ecdsa(&msg, receiver_key),
            sighash_type: EcdsaSighashType::All,
        };

        tx.input[0].witness = htlc.success_witness(&sig.to_vec(), preimage);
        Ok(tx)
    }
}
