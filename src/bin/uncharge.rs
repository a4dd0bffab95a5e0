use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use clap::{Parser as _, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uncharge_client::chain::bitcoind::BitcoindChain;
use uncharge_client::client::UnchargeQuoteRequest;
use uncharge_client::config::tokio_expiry_timer;
use uncharge_client::lightning::ldk::LdkNode;
use uncharge_client::server::grpc::GrpcSwapServer;
use uncharge_client::swap::store::SqliteStore;
use uncharge_client::swap::{SwapHash, UnchargeRequest};
use uncharge_client::{Client, ClientConfig, Services, SwapInfo};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "uncharge.sqlite3")]
    store_path: PathBuf,

    #[arg(long, default_value = "http://127.0.0.1:11010")]
    server_url: String,

    #[arg(long, default_value = "127.0.0.1:3000")]
    ldk_rest_addr: String,

    #[arg(long, default_value = "http://127.0.0.1:18443")]
    bitcoind_rpc_url: String,

    #[arg(long, default_value = "")]
    bitcoind_rpc_user: String,

    #[arg(long, default_value = "")]
    bitcoind_rpc_password: String,

    #[arg(long, default_value = "regtest")]
    network: Network,

    #[arg(long, default_value_t = 5)]
    chain_poll_interval_secs: u64,

    #[arg(long, default_value_t = 30)]
    server_rpc_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resume pending swaps and keep running until interrupted.
    Run,
    /// Start a swap and follow it until it is final.
    Uncharge {
        #[arg(long)]
        amount: u64,

        #[arg(long)]
        dest_addr: String,

        #[arg(long)]
        max_swap_fee: u64,

        #[arg(long)]
        max_prepay_amount: u64,

        #[arg(long)]
        max_miner_fee: u64,

        #[arg(long, default_value_t = 6)]
        sweep_conf_target: u16,

        #[arg(long)]
        uncharge_channel: Option<u64>,
    },
    Quote {
        #[arg(long)]
        amount: u64,

        #[arg(long, default_value_t = 6)]
        sweep_conf_target: u16,
    },
    Terms,
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    uncharge_client::logging::init().ok();
    let args = Args::parse();

    let client = Arc::new(build_client(&args)?);

    let out = match args.command {
        Command::Run => {
            let cancel = cancel_on_ctrl_c();
            let (status_tx, mut status_rx) = mpsc::channel(64);
            let printer = tokio::spawn(async move {
                while let Some(info) = status_rx.recv().await {
                    print_status(&info);
                }
            });
            client.run(cancel, status_tx).await.context("run swap client")?;
            printer.await.context("join status printer")?;
            return Ok(());
        }
        Command::Uncharge {
            amount,
            dest_addr,
            max_swap_fee,
            max_prepay_amount,
            max_miner_fee,
            sweep_conf_target,
            uncharge_channel,
        } => {
            let request = UnchargeRequest {
                amount,
                dest_addr,
                max_swap_fee,
                max_prepay_amount,
                max_miner_fee,
                sweep_conf_target,
                uncharge_channel,
            };
            return uncharge_and_follow(client, request).await;
        }
        Command::Quote {
            amount,
            sweep_conf_target,
        } => {
            let quote = client
                .uncharge_quote(&UnchargeQuoteRequest {
                    amount,
                    sweep_conf_target,
                })
                .await
                .context("UnchargeQuote")?;
            serde_json::to_value(quote).context("encode quote")?
        }
        Command::Terms => {
            let terms = client.uncharge_terms().await.context("UnchargeTerms")?;
            serde_json::to_value(terms).context("encode terms")?
        }
        Command::List => {
            let swaps = client.get_uncharge_swaps()?;
            let swaps: Vec<_> = swaps
                .iter()
                .map(|s| {
                    json!({
                      "hash": s.hash,
                      "state": s.state(),
                      "amount": s.contract.amount,
                      "dest_addr": s.contract.dest_addr,
                      "cltv_expiry": s.contract.cltv_expiry,
                      "initiation_height": s.contract.initiation_height,
                      "last_update": s.last_update(),
                      "artifacts": s.artifacts,
                    })
                })
                .collect();
            json!(swaps)
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&out).context("serialize output")?
    );
    Ok(())
}

fn build_client(args: &Args) -> Result<Client> {
    let cfg = ClientConfig {
        network: args.network,
        server_rpc_timeout: Duration::from_secs(args.server_rpc_timeout_secs),
        ..ClientConfig::default()
    };

    let store = SqliteStore::open(args.store_path.clone()).context("open sqlite store")?;
    let chain = Arc::new(
        BitcoindChain::new(
            &args.bitcoind_rpc_url,
            args.bitcoind_rpc_user.clone(),
            args.bitcoind_rpc_password.clone(),
            Duration::from_secs(args.chain_poll_interval_secs),
        )
        .context("create bitcoind backend")?,
    );
    let server = GrpcSwapServer::new(args.server_url.clone(), cfg.server_rpc_timeout)
        .context("create swap server client")?;

    Ok(Client::new(
        cfg,
        Services {
            server: Arc::new(server),
            node: Arc::new(LdkNode::new(args.ldk_rest_addr.clone())),
            chain: chain.clone(),
            fees: chain,
            store: Arc::new(store),
            expiry_timer: tokio_expiry_timer(),
        },
    ))
}

async fn uncharge_and_follow(client: Arc<Client>, request: UnchargeRequest) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (status_tx, mut status_rx) = mpsc::channel(64);
    let runner = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.run(cancel, status_tx).await }
    });

    let hash: SwapHash = match client.uncharge(request).await {
        Ok(hash) => hash,
        Err(err) => {
            cancel.cancel();
            runner.await.context("join swap client")??;
            return Err(err.context("Uncharge"));
        }
    };
    println!("{}", json!({ "hash": hash }));

    while let Some(info) = status_rx.recv().await {
        if info.hash != hash {
            continue;
        }
        print_status(&info);
        if info.state.is_terminal() {
            cancel.cancel();
        }
    }

    runner.await.context("join swap client")?
}

fn print_status(info: &SwapInfo) {
    println!(
        "{}",
        json!({
          "hash": info.hash,
          "state": info.state,
          "height": info.height,
          "time": info.time,
        })
    );
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupted, shutting down");
                    cancel.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "cannot listen for ctrl-c"),
            }
        }
    });
    cancel
}
