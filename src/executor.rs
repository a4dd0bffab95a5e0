//! Runs swaps concurrently, one task per swap, and fans block heights out
//! to all of them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::chain::ChainSource;
use crate::signal::Signal;
use crate::swap::uncharge::ExecutionEnv;
use crate::swap::{SwapHash, SwapInfo, UnchargeSwap};

const HEIGHT_BUFFER: usize = 64;

pub struct Executor {
    chain: Arc<dyn ChainSource>,
    queue_tx: mpsc::UnboundedSender<UnchargeSwap>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<UnchargeSwap>>>,
    active: Arc<Mutex<HashSet<SwapHash>>>,
    height: AtomicU32,
    ready: Signal,
    closed: AtomicBool,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(chain: Arc<dyn ChainSource>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            chain,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            active: Arc::new(Mutex::new(HashSet::new())),
            height: AtomicU32::new(0),
            ready: Signal::new(),
            closed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
        }
    }

    /// Queues `swap` for execution. Never blocks. Swaps submitted after the
    /// executor stopped are dropped; their persisted record is picked up on
    /// the next start.
    pub fn initiate(&self, swap: UnchargeSwap) {
        let hash = swap.hash();
        if self.closed.load(Ordering::Acquire) || self.queue_tx.send(swap).is_err() {
            tracing::error!(swap = %hash, "executor stopped, swap not started");
        }
    }

    /// Fires once the first block height is known.
    pub fn ready(&self) -> &Signal {
        &self.ready
    }

    /// Last block height seen by the executor.
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub fn active_swaps(&self) -> Vec<SwapHash> {
        let mut out: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        out.sort();
        out
    }

    /// Launches queued swaps and relays block heights until `cancel` fires or
    /// the height stream fails. Status updates of every swap are forwarded
    /// to `status`. Can only run once.
    pub async fn run(&self, cancel: CancellationToken, status: mpsc::Sender<SwapInfo>) -> Result<()> {
        let span = tracing::info_span!("executor");
        let queue = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(queue) = queue else {
            anyhow::bail!("executor already ran");
        };

        let units = cancel.child_token();
        let res = self.serve(&cancel, &units, queue, status).instrument(span).await;

        self.closed.store(true, Ordering::Release);
        self.tracker.close();
        if res.is_err() {
            units.cancel();
        }
        res
    }

    async fn serve(
        &self,
        cancel: &CancellationToken,
        units: &CancellationToken,
        mut queue: mpsc::UnboundedReceiver<UnchargeSwap>,
        status: mpsc::Sender<SwapInfo>,
    ) -> Result<()> {
        let mut heights = self
            .chain
            .subscribe_heights()
            .await
            .context("subscribe to block heights")?;

        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            height = heights.recv() => height.context("block height stream closed before first block")?,
        };
        self.height.store(first, Ordering::Release);
        self.ready.fire();
        tracing::info!(height = first, "executor ready");

        let (height_tx, _) = broadcast::channel(HEIGHT_BUFFER);
        let (unit_status_tx, unit_status_rx) = mpsc::unbounded_channel::<SwapInfo>();

        self.tracker.spawn(forward_status(units.clone(), unit_status_rx, status));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("executor stopping");
                    return Ok(());
                }
                height = heights.recv() => {
                    let height = height.context("block height stream closed")?;
                    self.height.store(height, Ordering::Release);
                    tracing::debug!(height, "new block");
                    let _ = height_tx.send(height);
                }
                Some(swap) = queue.recv() => {
                    self.launch(swap, units, &height_tx, &unit_status_tx);
                }
            }
        }
    }

    fn launch(
        &self,
        swap: UnchargeSwap,
        units: &CancellationToken,
        heights: &broadcast::Sender<u32>,
        status: &mpsc::UnboundedSender<SwapInfo>,
    ) {
        let hash = swap.hash();
        if !self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash)
        {
            tracing::warn!(swap = %hash, "swap already running, ignoring duplicate");
            return;
        }

        // Subscribe before reading the height so no block falls in between.
        let env = ExecutionEnv {
            cancel: units.clone(),
            heights: heights.subscribe(),
            height: self.height(),
            status: status.clone(),
        };
        let active = self.active.clone();
        self.tracker.spawn(
            async move {
                swap.execute(env).await;
                active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&hash);
            }
            .instrument(tracing::info_span!("swap", %hash)),
        );
    }

    /// Waits until every swap task and the status forwarder have exited.
    pub async fn wait_finished(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Relays swap status updates to the caller. Ends when every swap task has
/// dropped its sender, or on shutdown, after handing over whatever the
/// caller still has room for. A caller that stops reading never holds up
/// shutdown.
async fn forward_status(
    cancel: CancellationToken,
    mut updates: mpsc::UnboundedReceiver<SwapInfo>,
    status: mpsc::Sender<SwapInfo>,
) {
    let mut dropped = 0usize;
    loop {
        let info = tokio::select! {
            _ = cancel.cancelled() => break,
            info = updates.recv() => match info {
                Some(info) => info,
                None => return,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                if status.try_send(info).is_err() {
                    dropped += 1;
                }
                break;
            }
            permit = status.reserve() => match permit {
                Ok(permit) => permit.send(info),
                Err(_) => return,
            },
        }
    }

    while let Ok(info) = updates.try_recv() {
        if status.try_send(info).is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, "status updates not delivered before shutdown");
    }
}
