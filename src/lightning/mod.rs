pub mod invoice;
pub mod ldk;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub best_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Succeeded { preimage: [u8; 32] },
    Failed { reason: String },
}

/// The payment node that pays the swap and prepay invoices.
#[async_trait]
pub trait LightningNode: Send + Sync {
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Dispatches a payment. Completion is observed through
    /// [`LightningNode::payment_status`].
    async fn send_payment(&self, invoice: &str) -> Result<()>;

    /// Status of the outbound payment for `payment_hash`, `None` if the node
    /// never attempted it.
    async fn payment_status(&self, payment_hash: &[u8; 32]) -> Result<Option<PaymentStatus>>;
}
