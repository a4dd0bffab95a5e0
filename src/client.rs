use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainSource;
use crate::config::{ClientConfig, ExpiryTimer};
use crate::error::SwapError;
use crate::executor::Executor;
use crate::fees::{calc_fee, check_amount};
use crate::htlc::MAX_SUCCESS_WITNESS_SIZE;
use crate::lightning::LightningNode;
use crate::server::{SwapServer, UnchargeTerms, with_timeout};
use crate::signal::Signal;
use crate::swap::store::SwapStore;
use crate::swap::{
    StateType, SwapConfig, SwapHash, SwapInfo, SwapRecord, UnchargeRequest, UnchargeSwap,
};
use crate::sweep::{FeeEstimator, Sweeper};

/// External systems the client drives.
#[derive(Clone)]
pub struct Services {
    pub server: Arc<dyn SwapServer>,
    pub node: Arc<dyn LightningNode>,
    pub chain: Arc<dyn ChainSource>,
    pub fees: Arc<dyn FeeEstimator>,
    pub store: Arc<dyn SwapStore>,
    pub expiry_timer: ExpiryTimer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnchargeQuoteRequest {
    pub amount: u64,
    pub sweep_conf_target: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnchargeQuote {
    pub swap_fee: u64,
    pub miner_fee: u64,
    pub prepay_amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// Entry point for uncharge swaps: resumes pending swaps on start and runs
/// new ones until cancelled.
pub struct Client {
    swap_cfg: SwapConfig,
    server: Arc<dyn SwapServer>,
    executor: Executor,
    lifecycle: Mutex<Lifecycle>,
    resume_done: Signal,
    stopped: Signal,
}

impl Client {
    pub fn new(cfg: ClientConfig, services: Services) -> Self {
        let swap_cfg = SwapConfig {
            params: cfg,
            node: services.node,
            chain: services.chain.clone(),
            store: services.store,
            sweeper: Sweeper::new(services.fees),
            expiry_timer: services.expiry_timer,
        };
        Self {
            swap_cfg,
            server: services.server,
            executor: Executor::new(services.chain),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            resume_done: Signal::new(),
            stopped: Signal::new(),
        }
    }

    /// Runs until `cancel` fires or the executor hits a fatal error, then
    /// waits for every swap to stop. Cancellation is not an error. Can only
    /// be called once per client.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken, status: mpsc::Sender<SwapInfo>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::NotStarted {
                return Err(SwapError::AlreadyStarted.into());
            }
            *lifecycle = Lifecycle::Running;
        }

        let res = self.serve(cancel, status).await;

        *self.lifecycle() = Lifecycle::Stopped;
        self.stopped.fire();
        match &res {
            Ok(()) => tracing::info!("swap client stopped"),
            Err(err) => tracing::error!(error = %format!("{err:#}"), "swap client failed"),
        }
        res
    }

    async fn serve(&self, cancel: CancellationToken, status: mpsc::Sender<SwapInfo>) -> Result<()> {
        let info = self
            .swap_cfg
            .node
            .get_info()
            .await
            .context("connect to lightning node")?;
        tracing::info!(node_id = %info.node_id, "connected to lightning node");

        let pending = self
            .swap_cfg
            .store
            .fetch_pending_swaps()
            .context("load pending swaps")?;

        let main = cancel.child_token();
        let (res, ()) = tokio::join!(
            self.executor.run(main.clone(), status),
            self.resume(pending)
        );

        main.cancel();
        self.executor.wait_finished().await;
        res
    }

    /// Resubmits persisted swaps. New swaps are held back until this is
    /// done so they queue behind them.
    async fn resume(&self, pending: Vec<SwapRecord>) {
        let mut resumed = 0usize;
        for record in pending {
            if record.state().state_type() != StateType::Pending {
                continue;
            }
            let hash = record.hash;
            match UnchargeSwap::resume(self.swap_cfg.clone(), record) {
                Ok(swap) => {
                    tracing::info!(swap = %hash, state = %swap.state(), "resuming swap");
                    self.executor.initiate(swap);
                    resumed += 1;
                }
                Err(err) => {
                    tracing::error!(swap = %hash, error = %format!("{err:#}"), "cannot resume swap");
                }
            }
        }
        tracing::info!(resumed, "pending swaps resumed");
        self.resume_done.fire();
    }

    /// Negotiates, persists and starts a new swap, returning its hash.
    /// Waits for the client to be running with all pending swaps resumed.
    #[tracing::instrument(skip_all, fields(amount = request.amount))]
    pub async fn uncharge(&self, request: UnchargeRequest) -> Result<SwapHash> {
        self.wait_ready().await?;

        let height = self.executor.height();
        let swap =
            UnchargeSwap::new(self.swap_cfg.clone(), self.server.as_ref(), height, request).await?;
        let hash = swap.hash();
        self.swap_cfg
            .store
            .create_swap(swap.record())
            .with_context(|| format!("persist new swap {hash}"))?;

        tracing::info!(swap = %hash, height, "swap created");
        self.executor.initiate(swap);
        Ok(hash)
    }

    /// Expected costs of a swap of `request.amount` under the current terms.
    #[tracing::instrument(skip_all, fields(amount = request.amount))]
    pub async fn uncharge_quote(&self, request: &UnchargeQuoteRequest) -> Result<UnchargeQuote> {
        let terms = self.uncharge_terms().await?;
        check_amount(request.amount, &terms)?;

        let swap_fee = calc_fee(request.amount, terms.swap_fee_base, terms.swap_fee_rate);
        let miner_fee = self
            .swap_cfg
            .sweeper
            .get_sweep_fee(MAX_SUCCESS_WITNESS_SIZE, request.sweep_conf_target)
            .await
            .context("estimate sweep fee")?;

        Ok(UnchargeQuote {
            swap_fee,
            miner_fee: miner_fee.to_sat(),
            prepay_amount: terms.prepay_amt,
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn uncharge_terms(&self) -> Result<UnchargeTerms> {
        with_timeout(
            "UnchargeTerms",
            self.swap_cfg.params.server_rpc_timeout,
            self.server.get_uncharge_terms(),
        )
        .await
        .context("get uncharge terms")
    }

    /// Every stored swap, oldest first.
    pub fn get_uncharge_swaps(&self) -> Result<Vec<SwapRecord>> {
        self.swap_cfg.store.fetch_swaps().context("list swaps")
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    async fn wait_ready(&self) -> Result<()> {
        let ready = async {
            self.executor.ready().wait().await;
            self.resume_done.wait().await;
        };
        tokio::select! {
            biased;
            () = self.stopped.wait() => Err(SwapError::ClientStopped.into()),
            () = ready => Ok(()),
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
