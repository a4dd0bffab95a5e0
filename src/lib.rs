pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod fees;
pub mod htlc;
pub mod lightning;
pub mod logging;
pub mod server;
pub mod signal;
pub mod swap;
pub mod sweep;

pub use client::{Client, Services, UnchargeQuote, UnchargeQuoteRequest};
pub use config::ClientConfig;
pub use error::SwapError;
pub use swap::{StateType, SwapHash, SwapInfo, SwapRecord, SwapState, UnchargeRequest};
