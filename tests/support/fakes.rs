//! In-memory collaborators for driving the client without a network.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Script, ScriptBuf, Transaction, Txid};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use rand::RngCore as _;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use uncharge_client::chain::{ChainOutput, ChainSource};
use uncharge_client::config::ExpiryTimer;
use uncharge_client::fees::calc_fee;
use uncharge_client::htlc::{Htlc, sha256_preimage};
use uncharge_client::lightning::invoice;
use uncharge_client::lightning::{LightningNode, NodeInfo, PaymentStatus};
use uncharge_client::server::{NewUnchargeSwap, NewUnchargeSwapResponse, SwapServer, UnchargeTerms};
use uncharge_client::signal::Signal;
use uncharge_client::swap::store::{SqliteStore, SwapStore};
use uncharge_client::swap::{
    SwapArtifacts, SwapEvent, SwapHash, SwapRecord, SwapState, UnchargeContract, UnchargeRequest,
};
use uncharge_client::sweep::FeeEstimator;
use uncharge_client::{Client, ClientConfig, Services, SwapInfo};

use super::wait::wait_for;

pub const START_HEIGHT: u32 = 100;
pub const SWAP_AMOUNT: u64 = 50_000;
pub const FEE_RATE_SAT_PER_KWU: u64 = 1_000;

const SENDER_KEY: [u8; 32] = [0x11; 32];
const INVOICE_KEY: [u8; 32] = [0x22; 32];

pub fn default_terms() -> UnchargeTerms {
    UnchargeTerms {
        swap_payment_dest: "02".repeat(33),
        swap_fee_base: 100,
        swap_fee_rate: 10_000,
        prepay_amt: 1_000,
        min_swap_amount: 10_000,
        max_swap_amount: 1_000_000,
        cltv_delta: 100,
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        network: Network::Regtest,
        server_rpc_timeout: Duration::from_secs(5),
        payment_poll_interval: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

pub fn dest_address() -> String {
    Address::p2wsh(Script::new(), Network::Regtest).to_string()
}

pub fn request(amount: u64) -> UnchargeRequest {
    UnchargeRequest {
        amount,
        dest_addr: dest_address(),
        max_swap_fee: 1_000,
        max_prepay_amount: 2_000,
        max_miner_fee: 10_000,
        sweep_conf_target: 6,
        uncharge_channel: None,
    }
}

pub fn sender_pubkey() -> PublicKey {
    let key = SecretKey::from_slice(&SENDER_KEY).expect("valid key");
    PublicKey::from_secret_key(&Secp256k1::signing_only(), &key)
}

/// Signed regtest BOLT11 invoice for `payment_hash`.
pub fn make_invoice(payment_hash: [u8; 32], amount_sat: u64) -> String {
    let key = SecretKey::from_slice(&INVOICE_KEY).expect("valid key");
    InvoiceBuilder::new(Currency::Regtest)
        .description("uncharge test".to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([42u8; 32]))
        .amount_milli_satoshis(amount_sat * 1000)
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .build_signed(|hash| Secp256k1::new().sign_ecdsa_recoverable(hash, &key))
        .expect("build invoice")
        .to_string()
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A persisted-looking record whose history ends in `state`.
pub fn sample_record(state: SwapState, height: u32) -> SwapRecord {
    let preimage = random_bytes();
    let hash = sha256_preimage(&preimage);
    let receiver_key = SecretKey::from_slice(&random_bytes()).expect("valid key");

    let contract = UnchargeContract {
        amount: SWAP_AMOUNT,
        dest_addr: dest_address(),
        max_swap_fee: 1_000,
        max_prepay_amount: 2_000,
        max_miner_fee: 10_000,
        sweep_conf_target: 6,
        uncharge_channel: None,
        swap_invoice: make_invoice(hash, SWAP_AMOUNT - 400),
        prepay_invoice: make_invoice(random_bytes(), 1_000),
        preimage_hex: hex::encode(preimage),
        receiver_key_hex: hex::encode(receiver_key.secret_bytes()),
        sender_pubkey: hex::encode(sender_pubkey().serialize()),
        cltv_expiry: height + 100,
        initiation_height: height,
        initiation_time: 1_700_000_000,
    };

    let mut events = vec![SwapEvent {
        state: SwapState::Initiated,
        height,
        time: 1_700_000_000,
    }];
    if state != SwapState::Initiated {
        events.push(SwapEvent {
            state,
            height: height + 1,
            time: 1_700_000_600,
        });
    }

    SwapRecord {
        hash: SwapHash(hash),
        contract,
        artifacts: SwapArtifacts::default(),
        events,
    }
}

#[derive(Debug, Default)]
pub struct ServerBehavior {
    /// Added to the swap invoice amount on top of the advertised fee.
    pub extra_swap_fee: u64,
    pub prepay_override: Option<u64>,
    pub expiry_delta_override: Option<u32>,
    pub wrong_payment_hash: bool,
    pub delay: Option<Duration>,
}

pub struct FakeServer {
    chain: Arc<FakeChain>,
    terms: Mutex<UnchargeTerms>,
    behavior: Mutex<ServerBehavior>,
    swaps: Mutex<Vec<NewUnchargeSwap>>,
}

impl FakeServer {
    pub fn new(chain: Arc<FakeChain>) -> Self {
        Self {
            chain,
            terms: Mutex::new(default_terms()),
            behavior: Mutex::new(ServerBehavior::default()),
            swaps: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: ServerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn new_swap_calls(&self) -> usize {
        self.swaps.lock().unwrap().len()
    }

    async fn maybe_delay(&self) {
        let delay = self.behavior.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SwapServer for FakeServer {
    async fn get_uncharge_terms(&self) -> Result<UnchargeTerms> {
        self.maybe_delay().await;
        Ok(self.terms.lock().unwrap().clone())
    }

    async fn new_uncharge_swap(&self, request: NewUnchargeSwap) -> Result<NewUnchargeSwapResponse> {
        self.maybe_delay().await;
        let terms = self.terms.lock().unwrap().clone();
        let behavior = self.behavior.lock().unwrap();

        let fee = calc_fee(request.amount, terms.swap_fee_base, terms.swap_fee_rate)
            + behavior.extra_swap_fee;
        let prepay = behavior.prepay_override.unwrap_or(terms.prepay_amt);
        let swap_amount = (request.amount + fee).saturating_sub(prepay);
        let payment_hash = if behavior.wrong_payment_hash {
            random_bytes()
        } else {
            request.hash.0
        };
        let delta = behavior.expiry_delta_override.unwrap_or(terms.cltv_delta);

        let resp = NewUnchargeSwapResponse {
            swap_invoice: make_invoice(payment_hash, swap_amount),
            prepay_invoice: make_invoice(random_bytes(), prepay),
            sender_pubkey: sender_pubkey(),
            expiry: self.chain.height() + delta,
        };
        drop(behavior);
        self.swaps.lock().unwrap().push(request);
        Ok(resp)
    }
}

#[derive(Default)]
pub struct FakeNode {
    payments: Mutex<HashMap<[u8; 32], PaymentStatus>>,
    sent: Mutex<Vec<[u8; 32]>>,
    fail_payments: AtomicBool,
}

impl FakeNode {
    pub fn fail_payments(&self, fail: bool) {
        self.fail_payments.store(fail, Ordering::SeqCst);
    }

    /// Payment hashes dispatched so far, in order.
    pub fn sent(&self) -> Vec<[u8; 32]> {
        self.sent.lock().unwrap().clone()
    }

    pub fn settle(&self, payment_hash: [u8; 32], preimage: [u8; 32]) {
        self.payments
            .lock()
            .unwrap()
            .insert(payment_hash, PaymentStatus::Succeeded { preimage });
    }
}

#[async_trait]
impl LightningNode for FakeNode {
    async fn get_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            node_id: "fake-node".to_string(),
            best_height: None,
        })
    }

    async fn send_payment(&self, invoice_str: &str) -> Result<()> {
        let decoded = invoice::decode(invoice_str)?;
        let status = if self.fail_payments.load(Ordering::SeqCst) {
            PaymentStatus::Failed {
                reason: "no route".to_string(),
            }
        } else {
            PaymentStatus::Pending
        };
        self.payments
            .lock()
            .unwrap()
            .insert(decoded.payment_hash, status);
        self.sent.lock().unwrap().push(decoded.payment_hash);
        Ok(())
    }

    async fn payment_status(&self, payment_hash: &[u8; 32]) -> Result<Option<PaymentStatus>> {
        Ok(self.payments.lock().unwrap().get(payment_hash).cloned())
    }
}

struct FakeOutput {
    script_pubkey: ScriptBuf,
    outpoint: OutPoint,
    value: Amount,
    mined_at: Option<u32>,
}

#[derive(Default)]
struct ChainState {
    outputs: Vec<FakeOutput>,
    spent: HashSet<OutPoint>,
    txs: HashMap<Txid, Option<u32>>,
    broadcasts: Vec<Transaction>,
}

/// Chain with a manually advanced tip. Broadcast transactions sit in the
/// mempool until the next [`FakeChain::mine`].
pub struct FakeChain {
    height: AtomicU32,
    state: Mutex<ChainState>,
    subscribers: Mutex<Vec<mpsc::Sender<u32>>>,
    seq: AtomicU32,
}

impl FakeChain {
    pub fn new(height: u32) -> Self {
        Self {
            height: AtomicU32::new(height),
            state: Mutex::new(ChainState::default()),
            subscribers: Mutex::new(Vec::new()),
            seq: AtomicU32::new(0),
        }
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }

    /// Mines `blocks` blocks, confirming everything in the mempool, and
    /// announces the new tip.
    pub fn mine(&self, blocks: u32) {
        let height = self.height.fetch_add(blocks, Ordering::SeqCst) + blocks;
        {
            let mut state = self.state.lock().unwrap();
            let first = height - blocks + 1;
            for output in state.outputs.iter_mut() {
                output.mined_at.get_or_insert(first);
            }
            for mined_at in state.txs.values_mut() {
                mined_at.get_or_insert(first);
            }
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(height).is_ok());
    }

    /// Adds an unconfirmed output paying `value` to `script_pubkey`.
    pub fn fund(&self, script_pubkey: ScriptBuf, value: Amount) -> OutPoint {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let txid = Txid::from_byte_array(sha256::Hash::hash(&seq.to_le_bytes()).to_byte_array());
        let outpoint = OutPoint { txid, vout: 0 };
        self.state.lock().unwrap().outputs.push(FakeOutput {
            script_pubkey,
            outpoint,
            value,
            mined_at: None,
        });
        outpoint
    }

    pub fn spend_elsewhere(&self, outpoint: OutPoint) {
        self.state.lock().unwrap().spent.insert(outpoint);
    }

    /// Evicts every unconfirmed transaction, returning their inputs to the
    /// UTXO set.
    pub fn drop_mempool(&self) {
        let mut state = self.state.lock().unwrap();
        let evicted: Vec<Txid> = state
            .txs
            .iter()
            .filter(|(_, mined_at)| mined_at.is_none())
            .map(|(txid, _)| *txid)
            .collect();
        for txid in evicted {
            state.txs.remove(&txid);
            let inputs: Vec<OutPoint> = state
                .broadcasts
                .iter()
                .filter(|tx| tx.compute_txid() == txid)
                .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
                .collect();
            for input in inputs {
                state.spent.remove(&input);
            }
        }
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    /// Closes every height stream, as a lost backend does.
    pub fn disconnect(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn confirmations(&self, mined_at: Option<u32>) -> u32 {
        mined_at.map_or(0, |h| self.height() - h + 1)
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn subscribe_heights(&self) -> Result<mpsc::Receiver<u32>> {
        let (tx, rx) = mpsc::channel(1024);
        tx.try_send(self.height()).context("announce tip")?;
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn find_output(&self, script_pubkey: &ScriptBuf) -> Result<Option<ChainOutput>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .outputs
            .iter()
            .find(|o| &o.script_pubkey == script_pubkey && !state.spent.contains(&o.outpoint))
            .map(|o| ChainOutput {
                outpoint: o.outpoint,
                value: o.value,
                confirmations: self.confirmations(o.mined_at),
            }))
    }

    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.state.lock().unwrap().spent.contains(outpoint))
    }

    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>> {
        let mined_at = self.state.lock().unwrap().txs.get(txid).copied();
        Ok(mined_at.map(|m| self.confirmations(m)))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        let mut state = self.state.lock().unwrap();
        for input in &tx.input {
            state.spent.insert(input.previous_output);
        }
        state.txs.entry(txid).or_insert(None);
        state.broadcasts.push(tx.clone());
        Ok(txid)
    }
}

pub struct FixedFees(pub u64);

#[async_trait]
impl FeeEstimator for FixedFees {
    async fn estimate_fee_rate(&self, _conf_target: u16) -> Result<FeeRate> {
        Ok(FeeRate::from_sat_per_kwu(self.0))
    }
}

/// Expiry timer that fires when the test says so.
pub fn manual_timer() -> (ExpiryTimer, Arc<Signal>) {
    let signal = Arc::new(Signal::new());
    let timer: ExpiryTimer = Arc::new({
        let signal = signal.clone();
        move |_| {
            let signal = signal.clone();
            Box::pin(async move { signal.wait().await })
        }
    });
    (timer, signal)
}

/// One client environment: fakes plus a store file that survives restarts.
pub struct Harness {
    _dir: TempDir,
    pub store_path: PathBuf,
    pub chain: Arc<FakeChain>,
    pub server: Arc<FakeServer>,
    pub node: Arc<FakeNode>,
    pub timer: Arc<Signal>,
    expiry_timer: ExpiryTimer,
}

impl Harness {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let store_path = dir.path().join("swaps.sqlite3");
        let chain = Arc::new(FakeChain::new(START_HEIGHT));
        let (expiry_timer, timer) = manual_timer();
        Ok(Self {
            _dir: dir,
            store_path,
            server: Arc::new(FakeServer::new(chain.clone())),
            chain,
            node: Arc::new(FakeNode::default()),
            timer,
            expiry_timer,
        })
    }

    pub fn store(&self) -> Result<SqliteStore> {
        SqliteStore::open(self.store_path.clone()).context("open sqlite store")
    }

    pub fn client(&self, cfg: ClientConfig) -> Result<Client> {
        Ok(Client::new(
            cfg,
            Services {
                server: self.server.clone(),
                node: self.node.clone(),
                chain: self.chain.clone(),
                fees: Arc::new(FixedFees(FEE_RATE_SAT_PER_KWU)),
                store: Arc::new(self.store()?),
                expiry_timer: self.expiry_timer.clone(),
            },
        ))
    }

    pub fn start(&self) -> Result<Running> {
        Ok(Running::start(self.client(test_config())?))
    }

    pub fn swap(&self, hash: &SwapHash) -> Result<SwapRecord> {
        self.store()?
            .get_swap(hash)?
            .with_context(|| format!("swap {hash} not stored"))
    }

    pub async fn wait_state(&self, hash: &SwapHash, state: SwapState) -> Result<SwapRecord> {
        wait_for(
            &format!("swap {hash} in state {state}"),
            Duration::from_secs(10),
            || async move {
                let record = self.swap(hash)?;
                Ok((record.state() == state).then_some(record))
            },
        )
        .await
    }

    /// Output script of the HTLC for a stored swap.
    pub fn htlc_script(&self, hash: &SwapHash) -> Result<ScriptBuf> {
        let record = self.swap(hash)?;
        Ok(Htlc::from_contract(&record.contract)?.script_pubkey())
    }
}

/// A client running on a background task.
pub struct Running {
    pub client: Arc<Client>,
    pub cancel: CancellationToken,
    pub statuses: Arc<Mutex<Vec<SwapInfo>>>,
    handle: JoinHandle<Result<()>>,
}

impl Running {
    pub fn start(client: Client) -> Self {
        Self::start_shared(Arc::new(client))
    }

    pub fn start_shared(client: Arc<Client>) -> Self {
        let cancel = CancellationToken::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let (status_tx, mut status_rx) = mpsc::channel(16);

        tokio::spawn({
            let statuses = statuses.clone();
            async move {
                while let Some(info) = status_rx.recv().await {
                    statuses.lock().unwrap().push(info);
                }
            }
        });
        let handle = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.run(cancel, status_tx).await }
        });

        Self {
            client,
            cancel,
            statuses,
            handle,
        }
    }

    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }

    pub async fn join(self) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .context("client did not stop")?
            .context("join client")?
    }

    pub fn states_of(&self, hash: &SwapHash) -> Vec<SwapState> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| &s.hash == hash)
            .map(|s| s.state)
            .collect()
    }
}
