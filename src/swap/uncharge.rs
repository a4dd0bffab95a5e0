use std::collections::VecDeque;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use rand::RngCore as _;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use super::machine::{Effect, Event, PaymentKind, TransitionContext, transition};
use super::store::SwapStore;
use super::{
    SwapArtifacts, SwapHash, SwapInfo, SwapRecord, SwapState, UnchargeContract, UnchargeRequest,
    unix_time,
};
use crate::chain::ChainSource;
use crate::config::{ClientConfig, ExpiryTimer};
use crate::error::SwapError;
use crate::fees::check_amount;
use crate::htlc::{self, Htlc, MAX_SUCCESS_WITNESS_SIZE};
use crate::lightning::invoice::{self, DecodedInvoice};
use crate::lightning::{LightningNode, PaymentStatus};
use crate::server::{NewUnchargeSwap, SwapServer, with_timeout};
use crate::sweep::Sweeper;

/// Collaborators and parameters shared by every swap.
#[derive(Clone)]
pub struct SwapConfig {
    pub params: ClientConfig,
    pub node: Arc<dyn LightningNode>,
    pub chain: Arc<dyn ChainSource>,
    pub store: Arc<dyn SwapStore>,
    pub sweeper: Sweeper,
    pub expiry_timer: ExpiryTimer,
}

/// What the executor hands a swap when it starts running it.
pub(crate) struct ExecutionEnv {
    pub cancel: CancellationToken,
    pub heights: broadcast::Receiver<u32>,
    pub height: u32,
    pub status: mpsc::UnboundedSender<SwapInfo>,
}

/// One uncharge swap: its persisted record plus the logic advancing it.
pub struct UnchargeSwap {
    cfg: SwapConfig,
    record: SwapRecord,
    htlc: Htlc,
    dest: Address,
    height: u32,
}

impl UnchargeSwap {
    /// Negotiates a new swap with the server. Nothing is persisted; the caller
    /// stores [`UnchargeSwap::record`] before submitting the swap.
    pub async fn new(
        cfg: SwapConfig,
        server: &dyn SwapServer,
        initiation_height: u32,
        request: UnchargeRequest,
    ) -> Result<Self> {
        parse_destination(&request.dest_addr, &cfg)?;
        let timeout = cfg.params.server_rpc_timeout;

        let terms = with_timeout("UnchargeTerms", timeout, server.get_uncharge_terms())
            .await
            .context("get uncharge terms")?;
        check_amount(request.amount, &terms)?;

        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let hash = SwapHash(htlc::sha256_preimage(&preimage));
        let receiver_key = htlc::random_secret_key()?;
        let receiver_pubkey = PublicKey::from_secret_key(&Secp256k1::signing_only(), &receiver_key);

        let resp = with_timeout(
            "NewUnchargeSwap",
            timeout,
            server.new_uncharge_swap(NewUnchargeSwap {
                hash,
                amount: request.amount,
                receiver_pubkey,
            }),
        )
        .await
        .with_context(|| format!("request swap {hash}"))?;

        let swap_invoice = invoice::decode(&resp.swap_invoice).context("decode swap invoice")?;
        anyhow::ensure!(
            swap_invoice.payment_hash == hash.0,
            "swap invoice payment hash does not match swap {hash}"
        );
        let prepay_invoice =
            invoice::decode(&resp.prepay_invoice).context("decode prepay invoice")?;
        validate_offer(
            &request,
            &swap_invoice,
            &prepay_invoice,
            resp.expiry,
            initiation_height,
            &cfg.params,
        )?;

        let contract = UnchargeContract {
            amount: request.amount,
            dest_addr: request.dest_addr,
            max_swap_fee: request.max_swap_fee,
            max_prepay_amount: request.max_prepay_amount,
            max_miner_fee: request.max_miner_fee,
            sweep_conf_target: request.sweep_conf_target,
            uncharge_channel: request.uncharge_channel,
            swap_invoice: resp.swap_invoice,
            prepay_invoice: resp.prepay_invoice,
            preimage_hex: hex::encode(preimage),
            receiver_key_hex: hex::encode(receiver_key.secret_bytes()),
            sender_pubkey: hex::encode(resp.sender_pubkey.serialize()),
            cltv_expiry: resp.expiry,
            initiation_height,
            initiation_time: unix_time(),
        };

        let mut record = SwapRecord {
            hash,
            contract,
            artifacts: SwapArtifacts::default(),
            events: Vec::new(),
        };
        record.push_state(SwapState::Initiated, initiation_height);

        tracing::info!(
            swap = %hash,
            amount = request.amount,
            cltv_expiry = resp.expiry,
            swap_fee = swap_fee(request.amount, &swap_invoice, &prepay_invoice),
            "swap negotiated"
        );

        Self::from_record(cfg, record)
    }

    /// Rebuilds a pending swap from its persisted record without contacting
    /// the server.
    pub fn resume(cfg: SwapConfig, record: SwapRecord) -> Result<Self> {
        anyhow::ensure!(
            !record.state().is_terminal(),
            "swap {} is already {}",
            record.hash,
            record.state()
        );
        Self::from_record(cfg, record)
    }

    fn from_record(cfg: SwapConfig, record: SwapRecord) -> Result<Self> {
        let htlc = Htlc::from_contract(&record.contract)
            .with_context(|| format!("rebuild htlc of swap {}", record.hash))?;
        anyhow::ensure!(
            htlc.swap_hash == record.hash.0,
            "preimage of swap {} does not match its hash",
            record.hash
        );
        let dest = parse_destination(&record.contract.dest_addr, &cfg)
            .with_context(|| format!("destination of swap {}", record.hash))?;
        let height = record
            .last_update()
            .map(|e| e.height)
            .unwrap_or(record.contract.initiation_height);

        Ok(Self {
            cfg,
            record,
            htlc,
            dest,
            height,
        })
    }

    pub fn hash(&self) -> SwapHash {
        self.record.hash
    }

    pub fn state(&self) -> SwapState {
        self.record.state()
    }

    pub fn record(&self) -> &SwapRecord {
        &self.record
    }

    pub fn htlc(&self) -> &Htlc {
        &self.htlc
    }

    /// Runs the swap until it is final or `env.cancel` fires. Errors end the
    /// swap as `Failed` and never escape.
    pub(crate) async fn execute(mut self, mut env: ExecutionEnv) {
        self.height = self.height.max(env.height);
        tracing::info!(state = %self.state(), height = self.height, "swap running");

        match self.drive(&mut env).await {
            Ok(()) => {}
            Err(err) if env.cancel.is_cancelled() => {
                tracing::debug!(error = %format!("{err:#}"), "swap interrupted by shutdown");
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(error = %reason, "swap failed");
                self.record.artifacts.failure_reason = Some(reason);
                if let Err(err) = self.commit(SwapState::Failed, &env) {
                    tracing::error!(error = %format!("{err:#}"), "persist failed swap");
                }
            }
        }
    }

    async fn drive(&mut self, env: &mut ExecutionEnv) -> Result<()> {
        let params = &self.cfg.params;
        let ctx = TransitionContext {
            cltv_expiry: self.record.contract.cltv_expiry,
            htlc_confirmations: params.htlc_confirmations,
            sweep_confirmations: params.sweep_confirmations,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        // Dropping the set on return aborts the trackers.
        let mut payments = JoinSet::new();
        let state = self.state();
        if matches!(state, SwapState::Initiated | SwapState::HtlcBroadcast) {
            self.track_payment(&mut payments, PaymentKind::Prepay, &events_tx)?;
        }
        if matches!(
            state,
            SwapState::Initiated | SwapState::HtlcBroadcast | SwapState::AwaitingConfirmation
        ) {
            self.track_payment(&mut payments, PaymentKind::Swap, &events_tx)?;
        }

        let mut timer = (self.cfg.expiry_timer)(params.htlc_publish_timeout);
        let mut timer_done = state != SwapState::Initiated;

        let mut queue = VecDeque::from([Event::BlockHeight(self.height)]);
        loop {
            while let Some(event) = queue.pop_front() {
                self.apply(&ctx, event, &mut queue, env).await?;
            }
            if self.state().is_terminal() {
                return Ok(());
            }

            let event = tokio::select! {
                _ = env.cancel.cancelled() => {
                    tracing::debug!(state = %self.state(), "swap stopped by shutdown");
                    return Ok(());
                }
                height = env.heights.recv() => match height {
                    Ok(height) => {
                        self.height = height;
                        Event::BlockHeight(height)
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed block notifications");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                () = &mut timer, if !timer_done => {
                    timer_done = true;
                    Event::TimerExpired
                }
                Some(event) = events_rx.recv() => event,
            };
            queue.push_back(event);
        }
    }

    async fn apply(
        &mut self,
        ctx: &TransitionContext,
        event: Event,
        queue: &mut VecDeque<Event>,
        env: &ExecutionEnv,
    ) -> Result<()> {
        let state = self.state();
        let t = transition(state, ctx, &event);

        if let Some(next) = t.next {
            tracing::info!(from = %state, to = %next, ?event, "swap state transition");
            if t.reason.is_some() {
                self.record.artifacts.failure_reason = t.reason;
            }
            self.commit(next, env)?;
        }

        for effect in t.effects {
            match effect {
                Effect::CheckChain => match self.check_chain().await {
                    Ok(Some(event)) => queue.push_back(event),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %format!("{err:#}"), "chain lookup failed");
                    }
                },
                Effect::PrepareSweep => {
                    if self.prepare_sweep().await? {
                        queue.push_back(Event::SweepPrepared);
                    }
                }
                Effect::PublishSweep => self.publish_sweep().await?,
            }
        }
        Ok(())
    }

    /// Appends `state` to the history and persists the record. The store
    /// write is the commit point for everything the transition implies.
    fn commit(&mut self, state: SwapState, env: &ExecutionEnv) -> Result<()> {
        let hash = self.hash();
        let event = self.record.push_state(state, self.height).clone();
        self.cfg
            .store
            .save_swap(&self.record)
            .with_context(|| format!("persist swap {hash} in state {state}"))?;

        let _ = env.status.send(SwapInfo {
            hash,
            state: event.state,
            height: event.height,
            time: event.time,
        });
        Ok(())
    }

    async fn check_chain(&mut self) -> Result<Option<Event>> {
        let chain = self.cfg.chain.clone();
        match self.state() {
            SwapState::Initiated | SwapState::HtlcBroadcast => {
                if let Some(outpoint) = self.htlc_outpoint()?
                    && chain.is_spent(&outpoint).await.context("check htlc spend")?
                {
                    return Ok(Some(Event::HtlcSpentElsewhere {
                        height: self.height,
                    }));
                }

                let Some(output) = chain
                    .find_output(&self.htlc.script_pubkey())
                    .await
                    .context("look up htlc")?
                else {
                    return Ok(None);
                };

                let amount = Amount::from_sat(self.record.contract.amount);
                if output.value < amount {
                    return Ok(Some(Event::Fault(format!(
                        "htlc {} pays {} instead of {amount}",
                        output.outpoint, output.value
                    ))));
                }

                self.record.artifacts.htlc_outpoint = Some(output.outpoint.to_string());
                self.record.artifacts.htlc_value = Some(output.value.to_sat());
                Ok(Some(Event::HtlcObserved {
                    confirmations: output.confirmations,
                }))
            }
            SwapState::AwaitingConfirmation | SwapState::OffchainSettled => {
                let txid = self.sweep_txid()?;
                if let Some(confirmations) = chain
                    .tx_confirmations(&txid)
                    .await
                    .context("look up sweep")?
                {
                    return Ok(Some(Event::SweepConfirmed { confirmations }));
                }

                let outpoint = self
                    .htlc_outpoint()?
                    .context("sweeping swap has no htlc outpoint")?;
                if chain.is_spent(&outpoint).await.context("check htlc spend")? {
                    Ok(Some(Event::HtlcSpentElsewhere {
                        height: self.height,
                    }))
                } else {
                    Ok(Some(Event::SweepMissing))
                }
            }
            SwapState::Success | SwapState::Failed | SwapState::Expired => Ok(None),
        }
    }

    /// Builds and signs the sweep into the record's artifacts. Returns
    /// `false` when the sweep has to wait for a cheaper block.
    async fn prepare_sweep(&mut self) -> Result<bool> {
        let contract = &self.record.contract;
        let fee = match self
            .cfg
            .sweeper
            .get_sweep_fee(MAX_SUCCESS_WITNESS_SIZE, contract.sweep_conf_target)
            .await
        {
            Ok(fee) => fee,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "sweep fee estimate failed");
                return Ok(false);
            }
        };

        let max_miner_fee = Amount::from_sat(contract.max_miner_fee);
        if fee > max_miner_fee {
            tracing::warn!(%fee, %max_miner_fee, "miner fee too high, postponing sweep");
            return Ok(false);
        }

        let outpoint = self
            .htlc_outpoint()?
            .context("no htlc outpoint to sweep")?;
        let value = Amount::from_sat(
            self.record
                .artifacts
                .htlc_value
                .context("no htlc value to sweep")?,
        );
        let tx = self.cfg.sweeper.create_sweep_tx(
            &self.htlc,
            outpoint,
            value,
            &self.dest,
            fee,
            &contract.receiver_secret_key()?,
            &contract.preimage_bytes()?,
        )?;

        let txid = tx.compute_txid();
        tracing::info!(%txid, %fee, "sweep prepared");
        self.record.artifacts.sweep_txid = Some(txid.to_string());
        self.record.artifacts.sweep_tx_hex = Some(hex::encode(bitcoin::consensus::serialize(&tx)));
        Ok(true)
    }

    async fn publish_sweep(&self) -> Result<()> {
        let tx = self.sweep_tx()?;
        match self.cfg.chain.broadcast(&tx).await {
            Ok(txid) => tracing::info!(%txid, "sweep published"),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "publish sweep, retrying next block");
            }
        }
        Ok(())
    }

    fn track_payment(
        &self,
        set: &mut JoinSet<()>,
        kind: PaymentKind,
        events: &mpsc::UnboundedSender<Event>,
    ) -> Result<()> {
        let contract = &self.record.contract;
        let invoice = match kind {
            PaymentKind::Swap => contract.swap_invoice.clone(),
            PaymentKind::Prepay => contract.prepay_invoice.clone(),
        };
        let payment_hash = invoice::decode(&invoice)
            .with_context(|| format!("decode {kind:?} invoice"))?
            .payment_hash;

        set.spawn(
            track_payment(
                self.cfg.node.clone(),
                kind,
                invoice,
                payment_hash,
                self.cfg.params.payment_poll_interval,
                events.clone(),
            )
            .in_current_span(),
        );
        Ok(())
    }

    fn htlc_outpoint(&self) -> Result<Option<OutPoint>> {
        self.record
            .artifacts
            .htlc_outpoint
            .as_deref()
            .map(|s| OutPoint::from_str(s).context("parse htlc outpoint"))
            .transpose()
    }

    fn sweep_txid(&self) -> Result<Txid> {
        let txid = self
            .record
            .artifacts
            .sweep_txid
            .as_deref()
            .context("swap has no sweep txid")?;
        Txid::from_str(txid).context("parse sweep txid")
    }

    fn sweep_tx(&self) -> Result<Transaction> {
        let raw = self
            .record
            .artifacts
            .sweep_tx_hex
            .as_deref()
            .context("swap has no sweep transaction")?;
        let bytes = hex::decode(raw).context("decode sweep tx hex")?;
        bitcoin::consensus::deserialize(&bytes).context("decode sweep tx")
    }
}

/// Dispatches the payment unless the node already knows it, then polls
/// until it settles or fails.
async fn track_payment(
    node: Arc<dyn LightningNode>,
    kind: PaymentKind,
    invoice: String,
    payment_hash: [u8; 32],
    poll_interval: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut dispatched = false;
    let event = loop {
        match node.payment_status(&payment_hash).await {
            Ok(None) if !dispatched => {
                if let Err(err) = node.send_payment(&invoice).await {
                    break Event::PaymentFailed {
                        kind,
                        reason: format!("{err:#}"),
                    };
                }
                dispatched = true;
                tracing::info!(?kind, "payment dispatched");
            }
            Ok(None) | Ok(Some(PaymentStatus::Pending)) => {}
            Ok(Some(PaymentStatus::Succeeded { preimage })) => {
                if htlc::sha256_preimage(&preimage) == payment_hash {
                    tracing::info!(?kind, "payment settled");
                    break Event::PaymentSettled { kind };
                }
                break Event::PaymentFailed {
                    kind,
                    reason: "preimage does not match payment hash".to_string(),
                };
            }
            Ok(Some(PaymentStatus::Failed { reason })) => {
                break Event::PaymentFailed { kind, reason };
            }
            Err(err) => {
                tracing::warn!(?kind, error = %format!("{err:#}"), "payment status lookup failed");
            }
        }
        tokio::time::sleep(poll_interval).await;
    };
    let _ = events.send(event);
}

fn parse_destination(dest_addr: &str, cfg: &SwapConfig) -> Result<Address> {
    let network = cfg.params.network;
    let addr = Address::<NetworkUnchecked>::from_str(dest_addr)
        .map_err(|e| SwapError::InvalidDestination(format!("{dest_addr}: {e}")))?;
    Ok(addr
        .require_network(network)
        .map_err(|e| SwapError::InvalidDestination(format!("{dest_addr}: {e}")))?)
}

fn swap_fee(amount: u64, swap_invoice: &DecodedInvoice, prepay_invoice: &DecodedInvoice) -> u64 {
    (swap_invoice.amount_sat + prepay_invoice.amount_sat).saturating_sub(amount)
}

fn validate_offer(
    request: &UnchargeRequest,
    swap_invoice: &DecodedInvoice,
    prepay_invoice: &DecodedInvoice,
    expiry: u32,
    height: u32,
    params: &ClientConfig,
) -> Result<(), SwapError> {
    let fee = swap_fee(request.amount, swap_invoice, prepay_invoice);
    if fee > request.max_swap_fee {
        return Err(SwapError::SwapFeeTooHigh {
            fee,
            max: request.max_swap_fee,
        });
    }

    if prepay_invoice.amount_sat > request.max_prepay_amount {
        return Err(SwapError::PrepayAmountTooHigh {
            amount: prepay_invoice.amount_sat,
            max: request.max_prepay_amount,
        });
    }

    if expiry < height.saturating_add(params.min_expiry_delta) {
        return Err(SwapError::ExpiryTooSoon { expiry, height });
    }
    if expiry > height.saturating_add(params.max_expiry_delta) {
        return Err(SwapError::ExpiryTooFar { expiry, height });
    }

    Ok(())
}
