//! Pure swap state transitions.
//!
//! The driver in [`super::uncharge`] turns observations (blocks, chain
//! lookups, payment results, timers) into [`Event`]s, feeds them through
//! [`transition`], persists the resulting state and only then performs the
//! returned [`Effect`]s.

use super::SwapState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Swap,
    Prepay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BlockHeight(u32),
    TimerExpired,
    HtlcObserved { confirmations: u32 },
    HtlcSpentElsewhere { height: u32 },
    SweepPrepared,
    SweepMissing,
    SweepConfirmed { confirmations: u32 },
    PaymentSettled { kind: PaymentKind },
    PaymentFailed { kind: PaymentKind, reason: String },
    Fault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Look up the HTLC or the sweep on chain.
    CheckChain,
    /// Build and sign the sweep; yields [`Event::SweepPrepared`] when the
    /// miner fee is acceptable.
    PrepareSweep,
    /// Broadcast the stored sweep transaction.
    PublishSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub cltv_expiry: u32,
    pub htlc_confirmations: u32,
    pub sweep_confirmations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub next: Option<SwapState>,
    pub reason: Option<String>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay() -> Self {
        Self::default()
    }

    fn effects(effects: Vec<Effect>) -> Self {
        Self {
            effects,
            ..Self::default()
        }
    }

    fn to(state: SwapState) -> Self {
        Self {
            next: Some(state),
            ..Self::default()
        }
    }

    fn end(state: SwapState, reason: impl Into<String>) -> Self {
        Self {
            next: Some(state),
            reason: Some(reason.into()),
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub fn transition(state: SwapState, ctx: &TransitionContext, event: &Event) -> Transition {
    use SwapState::*;

    if state.is_terminal() {
        return Transition::stay();
    }

    match (state, event) {
        (_, Event::Fault(reason)) => Transition::end(Failed, reason.clone()),

        (Initiated | HtlcBroadcast, Event::BlockHeight(height)) if *height >= ctx.cltv_expiry => {
            Transition::end(Expired, format!("htlc expiry {} reached", ctx.cltv_expiry))
        }
        (_, Event::BlockHeight(_)) => Transition::effects(vec![Effect::CheckChain]),

        (Initiated, Event::TimerExpired) => {
            Transition::end(Expired, "server did not publish the htlc in time")
        }
        (_, Event::TimerExpired) => Transition::stay(),

        (Initiated, Event::HtlcObserved { confirmations }) => {
            let t = Transition::to(HtlcBroadcast);
            if *confirmations >= ctx.htlc_confirmations {
                t.with(Effect::PrepareSweep)
            } else {
                t
            }
        }
        (HtlcBroadcast, Event::HtlcObserved { confirmations })
            if *confirmations >= ctx.htlc_confirmations =>
        {
            Transition::effects(vec![Effect::PrepareSweep])
        }
        (_, Event::HtlcObserved { .. }) => Transition::stay(),

        (HtlcBroadcast, Event::SweepPrepared) => {
            Transition::to(AwaitingConfirmation).with(Effect::PublishSweep)
        }
        (_, Event::SweepPrepared) => Transition::stay(),

        (AwaitingConfirmation | OffchainSettled, Event::SweepMissing) => {
            Transition::effects(vec![Effect::PublishSweep])
        }
        (_, Event::SweepMissing) => Transition::stay(),

        (AwaitingConfirmation | OffchainSettled, Event::SweepConfirmed { confirmations })
            if *confirmations >= ctx.sweep_confirmations =>
        {
            Transition::to(Success)
        }
        (_, Event::SweepConfirmed { .. }) => Transition::stay(),

        (_, Event::HtlcSpentElsewhere { height }) => {
            if *height >= ctx.cltv_expiry {
                Transition::end(Expired, "htlc reclaimed by the server after expiry")
            } else {
                Transition::end(Failed, "htlc spent by an unknown transaction")
            }
        }

        (AwaitingConfirmation, Event::PaymentSettled { kind: PaymentKind::Swap }) => {
            Transition::to(OffchainSettled)
        }
        (_, Event::PaymentSettled { .. }) => Transition::stay(),

        (Initiated | HtlcBroadcast, Event::PaymentFailed { kind, reason }) => {
            let what = match kind {
                PaymentKind::Swap => "swap",
                PaymentKind::Prepay => "prepay",
            };
            Transition::end(Failed, format!("{what} payment failed: {reason}"))
        }
        (_, Event::PaymentFailed { .. }) => Transition::stay(),
    }
}
