use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11SendRequest, GetNodeInfoRequest, ListPaymentsRequest};
use ldk_server_protos::types::{PaymentDirection, PaymentStatus as LdkPaymentStatus, payment_kind};

use super::{LightningNode, NodeInfo, PaymentStatus};

/// [`LightningNode`] backed by an ldk-server REST endpoint. Bolt11 payments
/// are identified by their payment hash.
#[derive(Clone)]
pub struct LdkNode {
    client: LdkServerClient,
}

impl LdkNode {
    pub fn new(rest_service_address: String) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
        }
    }
}

#[async_trait]
impl LightningNode for LdkNode {
    async fn get_info(&self) -> Result<NodeInfo> {
        let info = self
            .client
            .get_node_info(GetNodeInfoRequest {})
            .await
            .context("GetNodeInfo")?;
        Ok(NodeInfo {
            node_id: info.node_id,
            best_height: info.current_best_block.map(|b| b.height),
        })
    }

    async fn send_payment(&self, invoice: &str) -> Result<()> {
        self.client
            .bolt11_send(Bolt11SendRequest {
                invoice: invoice.to_string(),
                amount_msat: None,
                route_parameters: None,
            })
            .await
            .context("Bolt11Send")?;
        Ok(())
    }

    async fn payment_status(&self, payment_hash: &[u8; 32]) -> Result<Option<PaymentStatus>> {
        let payment_id = hex::encode(payment_hash);
        let payments = self
            .client
            .list_payments(ListPaymentsRequest { page_token: None })
            .await
            .context("ListPayments")?
            .payments;

        let Some(p) = payments
            .into_iter()
            .find(|p| p.id == payment_id && p.direction == PaymentDirection::Outbound as i32)
        else {
            return Ok(None);
        };

        if p.status == LdkPaymentStatus::Failed as i32 {
            return Ok(Some(PaymentStatus::Failed {
                reason: "payment failed".to_string(),
            }));
        }
        if p.status != LdkPaymentStatus::Succeeded as i32 {
            return Ok(Some(PaymentStatus::Pending));
        }

        let preimage_hex = p
            .kind
            .and_then(|k| k.kind)
            .and_then(|k| match k {
                payment_kind::Kind::Bolt11(b) => b.preimage,
                _ => None,
            })
            .context("missing payment preimage")?;

        let bytes = hex::decode(preimage_hex).context("decode preimage hex")?;
        let preimage: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
        Ok(Some(PaymentStatus::Succeeded { preimage }))
    }
}
