use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash: [u8; 32],
    pub amount_sat: u64,
}

/// Decodes a BOLT11 invoice that must carry an amount.
pub fn decode(invoice: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    let amount_msat = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| anyhow::anyhow!("invoice amount is required"))?;
    Ok(DecodedInvoice {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_sat: amount_msat / 1000,
    })
}
