use std::time::Duration;

use thiserror::Error;

/// Failures a caller can act on. Infrastructure errors travel as plain
/// `anyhow::Error` with context; these are carried inside it and recovered
/// with `downcast_ref`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwapError {
    #[error("swap amount too low: {amount} < {min}")]
    SwapAmountTooLow { amount: u64, min: u64 },

    #[error("swap amount too high: {amount} > {max}")]
    SwapAmountTooHigh { amount: u64, max: u64 },

    #[error("swap fee too high: {fee} > {max}")]
    SwapFeeTooHigh { fee: u64, max: u64 },

    #[error("prepay amount too high: {amount} > {max}")]
    PrepayAmountTooHigh { amount: u64, max: u64 },

    #[error("swap expiry too soon: expiry {expiry} at height {height}")]
    ExpiryTooSoon { expiry: u32, height: u32 },

    #[error("swap expiry too far: expiry {expiry} at height {height}")]
    ExpiryTooFar { expiry: u32, height: u32 },

    #[error("invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("swap client can only be started once")]
    AlreadyStarted,

    #[error("swap client stopped")]
    ClientStopped,

    #[error("swap server call {op} timed out after {timeout:?}")]
    ServerTimeout { op: &'static str, timeout: Duration },
}
