use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use pyrite_chain::{ChainError, ChainManager};
use pyrite_wallet::WalletError;
use pyrited::addrbook::AddressBook;
use pyrited::http::{self, AppState};
use pyrited::p2p::{P2pError, SyncEngine};
use pyrited::store::{NodeStore, StoreError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often chain and address state is flushed to disk.
const SAVE_INTERVAL_SECS: u64 = 600;

#[derive(Debug, Parser)]
#[command(name = "pyrited", version, about = "Pyrite ledger node")]
struct Cli {
    /// P2P listen address.
    #[arg(long, default_value = "0.0.0.0:6001")]
    listen: String,

    /// HTTP API listen address.
    #[arg(long, default_value = "127.0.0.1:3001")]
    http_listen: String,

    /// Public `host:port` this node advertises to peers.
    #[arg(long)]
    advertise: Option<String>,

    /// Peer to dial at startup. May be given multiple times.
    #[arg(long)]
    peer: Vec<String>,

    /// Directory for the node database.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// File with one peer address per line. Blank lines and lines starting
    /// with '#' are skipped.
    #[arg(long)]
    seed_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("invalid http listen address '{0}'")]
    BadHttpAddr(String),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(NodeStore::open(&cli.data_dir)?);
    let wallet = store.load_or_create_wallet()?;
    info!(address = %wallet.address(), "node wallet ready");

    let (events_tx, events_rx) = mpsc::channel();
    let chain = Arc::new(
        ChainManager::with_events(events_tx)
            .with_store(Arc::clone(&store) as Arc<dyn pyrite_chain::BlobStore>),
    );
    chain.init()?;
    info!(height = chain.height()?, "chain initialized");

    let mut known = store.load_addresses()?;
    known.extend(cli.peer.iter().cloned());
    if let Some(ref path) = cli.seed_file {
        known.extend(load_seed_file(path)?);
    }
    let book = AddressBook::new(known, cli.advertise.clone());

    let engine = SyncEngine::new(Arc::clone(&chain), book, cli.advertise.clone());
    engine.start(&cli.listen)?;
    engine.pump_events(events_rx);
    spawn_persister(Arc::clone(&store), Arc::clone(&chain), Arc::clone(&engine));

    let http_addr: SocketAddr = cli
        .http_listen
        .parse()
        .map_err(|_| NodeError::BadHttpAddr(cli.http_listen.clone()))?;
    let state = AppState {
        chain: Arc::clone(&chain),
        engine: Arc::clone(&engine),
        wallet_address: wallet.address(),
        wallet_public_key: wallet.public_key_hex(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(http::serve(http_addr, state))?;

    // Final flush after the API has shut down.
    store.save_chain(&chain.chain()?)?;
    store.save_addresses(&engine.known_addresses())?;
    store.flush()?;
    info!("shutdown complete");
    Ok(())
}

/// Periodically persists chain and address state.
fn spawn_persister(store: Arc<NodeStore>, chain: Arc<ChainManager>, engine: Arc<SyncEngine>) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(SAVE_INTERVAL_SECS));
        if let Err(err) = chain.save_locally() {
            warn!(error = %err, "failed to snapshot chain");
        }
        if let Err(err) = store.save_addresses(&engine.known_addresses()) {
            warn!(error = %err, "failed to persist addresses");
        }
    });
}

fn load_seed_file(path: &Path) -> Result<Vec<String>, NodeError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn seed_file_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# seeds").unwrap();
        writeln!(file, "10.0.0.1:6001").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  10.0.0.2:6001  ").unwrap();
        let seeds = load_seed_file(&path).unwrap();
        assert_eq!(
            seeds,
            vec!["10.0.0.1:6001".to_string(), "10.0.0.2:6001".to_string()]
        );
    }

    #[test]
    fn cli_defaults_are_sane() {
        let cli = Cli::parse_from(["pyrited"]);
        assert_eq!(cli.listen, "0.0.0.0:6001");
        assert_eq!(cli.http_listen, "127.0.0.1:3001");
        assert!(cli.peer.is_empty());
    }
}
