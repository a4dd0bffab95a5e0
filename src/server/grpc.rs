use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use super::{NewUnchargeSwap, NewUnchargeSwapResponse, SwapServer, UnchargeTerms};

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerUnchargeTermsRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerUnchargeTerms {
    #[prost(string, tag = "1")]
    pub swap_payment_dest: String,
    #[prost(uint64, tag = "2")]
    pub swap_fee_base: u64,
    #[prost(uint64, tag = "3")]
    pub swap_fee_rate: u64,
    #[prost(uint64, tag = "4")]
    pub prepay_amt: u64,
    #[prost(uint64, tag = "5")]
    pub min_swap_amount: u64,
    #[prost(uint64, tag = "6")]
    pub max_swap_amount: u64,
    #[prost(uint32, tag = "7")]
    pub cltv_delta: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerUnchargeSwapRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub swap_hash: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub amt: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub receiver_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerUnchargeSwapResponse {
    #[prost(string, tag = "1")]
    pub swap_invoice: String,
    #[prost(string, tag = "2")]
    pub prepay_invoice: String,
    #[prost(bytes = "vec", tag = "3")]
    pub sender_key: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub expiry: u32,
}

const UNCHARGE_TERMS_PATH: &str = "/swapserverrpc.SwapServer/UnchargeTerms";
const NEW_UNCHARGE_SWAP_PATH: &str = "/swapserverrpc.SwapServer/NewUnchargeSwap";

/// Swap server client over gRPC. The channel connects lazily, so
/// construction never touches the network.
#[derive(Clone)]
pub struct GrpcSwapServer {
    grpc: tonic::client::Grpc<Channel>,
    timeout: Duration,
}

impl GrpcSwapServer {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(url.clone())
            .with_context(|| format!("parse swap server url {url}"))?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            grpc: tonic::client::Grpc::new(channel),
            timeout,
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, req: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .with_context(|| format!("swap server not ready for {path}"))?;

        let mut request = tonic::Request::new(req);
        request.set_timeout(self.timeout);
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let resp = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .with_context(|| format!("call {path}"))?;
        Ok(resp.into_inner())
    }
}

#[async_trait]
impl SwapServer for GrpcSwapServer {
    async fn get_uncharge_terms(&self) -> Result<UnchargeTerms> {
        let terms: ServerUnchargeTerms = self
            .unary(UNCHARGE_TERMS_PATH, ServerUnchargeTermsRequest {})
            .await?;
        Ok(UnchargeTerms {
            swap_payment_dest: terms.swap_payment_dest,
            swap_fee_base: terms.swap_fee_base,
            swap_fee_rate: terms.swap_fee_rate,
            prepay_amt: terms.prepay_amt,
            min_swap_amount: terms.min_swap_amount,
            max_swap_amount: terms.max_swap_amount,
            cltv_delta: terms.cltv_delta,
        })
    }

    async fn new_uncharge_swap(&self, request: NewUnchargeSwap) -> Result<NewUnchargeSwapResponse> {
        let resp: ServerUnchargeSwapResponse = self
            .unary(
                NEW_UNCHARGE_SWAP_PATH,
                ServerUnchargeSwapRequest {
                    swap_hash: request.hash.0.to_vec(),
                    amt: request.amount,
                    receiver_key: request.receiver_pubkey.serialize().to_vec(),
                },
            )
            .await?;

        let sender_pubkey =
            PublicKey::from_slice(&resp.sender_key).context("parse server sender key")?;
        Ok(NewUnchargeSwapResponse {
            swap_invoice: resp.swap_invoice,
            prepay_invoice: resp.prepay_invoice,
            sender_pubkey,
            expiry: resp.expiry,
        })
    }
}
