use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use bitcoincore_rpc::bitcoin::address::{NetworkChecked, NetworkUnchecked};
use bitcoincore_rpc::bitcoin::{Address, Amount, Network, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use tempfile::TempDir;

const RPC_USER: &str = "uncharge";
const RPC_PASSWORD: &str = "uncharge";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// A throwaway regtest `bitcoind` living in a temporary data directory.
pub struct BitcoindProcess {
    datadir: Option<TempDir>,
    rpc_port: u16,
    child: Child,
}

impl BitcoindProcess {
    pub fn start() -> Result<Self> {
        let datadir = tempfile::tempdir().context("create bitcoind datadir")?;
        let rpc_port = free_port().context("pick bitcoind rpc port")?;
        let p2p_port = free_port().context("pick bitcoind p2p port")?;

        let conf_path = datadir.path().join("bitcoin.conf");
        std::fs::write(&conf_path, bitcoin_conf(rpc_port, p2p_port))
            .context("write bitcoin.conf")?;

        let log_path = datadir.path().join("bitcoind.log");
        let log = std::fs::File::create(&log_path).context("create bitcoind log")?;
        let child = Command::new("bitcoind")
            .arg(format!("-datadir={}", datadir.path().display()))
            .arg(format!("-conf={}", conf_path.display()))
            .arg("-printtoconsole=1")
            .stdout(Stdio::from(log.try_clone().context("clone bitcoind log")?))
            .stderr(Stdio::from(log))
            .spawn()
            .context("spawn bitcoind")?;

        let mut process = Self {
            datadir: Some(datadir),
            rpc_port,
            child,
        };
        process
            .wait_rpc_ready(&log_path)
            .context("wait for bitcoind rpc")?;
        Ok(process)
    }

    fn wait_rpc_ready(&mut self, log_path: &Path) -> Result<()> {
        let client = self.rpc(None)?;
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while client.get_blockchain_info().is_err() {
            if let Some(status) = self.child.try_wait().context("poll bitcoind")? {
                anyhow::bail!("bitcoind exited with {status}, see {}", log_path.display());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("bitcoind rpc not ready, see {}", log_path.display());
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.rpc_port)
    }

    pub fn rpc_user(&self) -> &str {
        RPC_USER
    }

    pub fn rpc_password(&self) -> &str {
        RPC_PASSWORD
    }

    fn rpc(&self, wallet: Option<&str>) -> Result<Client> {
        let url = match wallet {
            Some(name) => format!("{}/wallet/{name}", self.rpc_url()),
            None => self.rpc_url(),
        };
        let auth = Auth::UserPass(RPC_USER.to_string(), RPC_PASSWORD.to_string());
        Client::new(&url, auth).context("create bitcoind rpc client")
    }

    /// Returns a client for `wallet`, creating the wallet on first use.
    fn wallet(&self, wallet: &str) -> Result<Client> {
        let node = self.rpc(None)?;
        if !node.list_wallets()?.iter().any(|w| w == wallet) {
            node.create_wallet(wallet, None, None, None, None)
                .with_context(|| format!("create wallet {wallet}"))?;
        }
        self.rpc(Some(wallet))
    }

    pub fn new_address(&self, wallet: &str) -> Result<Address<NetworkChecked>> {
        let address: Address<NetworkUnchecked> = self
            .wallet(wallet)?
            .get_new_address(None, None)
            .context("get new address")?;
        address
            .require_network(Network::Regtest)
            .context("address is not regtest")
    }

    pub fn mine_blocks(&self, wallet: &str, blocks: u64) -> Result<()> {
        let reward_to = self.new_address(wallet)?;
        self.rpc(None)?
            .generate_to_address(blocks, &reward_to)
            .with_context(|| format!("mine {blocks} blocks"))?;
        Ok(())
    }

    pub fn send_to_address(
        &self,
        wallet: &str,
        address: &Address<NetworkChecked>,
        amount_sats: u64,
    ) -> Result<Txid> {
        self.wallet(wallet)?
            .send_to_address(
                address,
                Amount::from_sat(amount_sats),
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .with_context(|| format!("send {amount_sats} sat to {address}"))
    }
}

impl Drop for BitcoindProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();

        let keep = std::env::var("KEEP_E2E_ARTIFACTS").is_ok_and(|v| v == "1");
        if (keep || std::thread::panicking())
            && let Some(datadir) = self.datadir.take()
        {
            let _ = datadir.keep();
        }
    }
}

fn bitcoin_conf(rpc_port: u16, p2p_port: u16) -> String {
    format!(
        "regtest=1\n\
         server=1\n\
         txindex=1\n\
         rpcuser={RPC_USER}\n\
         rpcpassword={RPC_PASSWORD}\n\
         [regtest]\n\
         fallbackfee=0.0001\n\
         rpcbind=127.0.0.1\n\
         rpcallowip=127.0.0.1\n\
         rpcport={rpc_port}\n\
         port={p2p_port}\n"
    )
}

fn free_port() -> std::io::Result<u16> {
    Ok(TcpListener::bind(("127.0.0.1", 0))?.local_addr()?.port())
}
