use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, ripemd160, sha256};
use bitcoin::opcodes;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Network, Witness};

use crate::swap::UnchargeContract;

/// Upper bound of the success-path witness in bytes: item count, DER
/// signature with sighash flag, preimage and the witness script, each with
/// its length prefix.
pub const MAX_SUCCESS_WITNESS_SIZE: usize = 1 + (1 + 73) + (1 + 32) + (1 + MAX_SCRIPT_SIZE);

const MAX_SCRIPT_SIZE: usize = 107;

/// On-chain HTLC the server locks the swap amount into. The receiver (this
/// client) spends it by revealing the preimage; the sender reclaims it after
/// `cltv_expiry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
    pub swap_hash: [u8; 32],
    pub receiver_pubkey: PublicKey,
    pub sender_pubkey: PublicKey,
    pub cltv_expiry: u32,
}

impl Htlc {
    pub fn from_contract(contract: &UnchargeContract) -> Result<Self> {
        let preimage = contract.preimage_bytes()?;
        let receiver_key = contract.receiver_secret_key()?;
        let sender_pubkey = hex::decode(&contract.sender_pubkey).context("decode sender_pubkey")?;
        let sender_pubkey =
            PublicKey::from_slice(&sender_pubkey).context("parse sender_pubkey")?;

        let secp = Secp256k1::signing_only();
        Ok(Self {
            swap_hash: sha256_preimage(&preimage),
            receiver_pubkey: PublicKey::from_secret_key(&secp, &receiver_key),
            sender_pubkey,
            cltv_expiry: contract.cltv_expiry,
        })
    }

    pub fn witness_script(&self) -> ScriptBuf {
        let hash160 = ripemd160::Hash::hash(&self.swap_hash).to_byte_array();
        Builder::new()
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(hash160)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_slice(self.receiver_pubkey.serialize())
            .push_opcode(opcodes::all::OP_ELSE)
            .push_opcode(opcodes::all::OP_DROP)
            .push_int(i64::from(self.cltv_expiry))
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_slice(self.sender_pubkey.serialize())
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.witness_script().wscript_hash())
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.witness_script(), network)
    }

    pub fn success_witness(&self, signature: &[u8], preimage: &[u8; 32]) -> Witness {
        let mut witness = Witness::new();
        witness.push(signature);
        witness.push(preimage);
        witness.push(self.witness_script().as_bytes());
        witness
    }
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

pub fn random_secret_key() -> Result<SecretKey> {
    use rand::RngCore as _;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretKey::from_slice(&bytes).context("generate secret key")
}
