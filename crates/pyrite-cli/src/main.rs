use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyrite_codec::Transaction;
use pyrite_wallet::WalletKeypair;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pyrite-cli")]
#[command(about = "CLI client for a pyrite node")]
struct Cli {
    /// Node base URL
    #[arg(long, default_value = "http://127.0.0.1:3001", global = true)]
    node: String,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show node status
    Status,
    /// List every block on the node's chain
    Blocks,
    /// Show one block by hex hash, or the latest
    Block {
        /// Block hash in hex. Omit for the latest block.
        hash: Option<String>,
    },
    /// Ask the node to mine an empty block
    Mine,
    /// List connected peers and known addresses
    Peers,
    /// Tell the node to dial a peer
    Connect {
        /// Peer address as host:port
        addr: String,
    },
    /// Show the node's wallet address
    Wallet,
    /// Generate a standalone keypair locally, without a node
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let node = cli.node;
    match cli.cmd {
        Command::Status => print_json(client.get(format!("{node}/status"))).await,
        Command::Blocks => print_json(client.get(format!("{node}/blocks"))).await,
        Command::Block { hash: Some(hash) } => {
            print_json(client.get(format!("{node}/blocks/{hash}"))).await
        }
        Command::Block { hash: None } => {
            print_json(client.get(format!("{node}/blocks/latest"))).await
        }
        Command::Mine => {
            let empty: Vec<Transaction> = Vec::new();
            print_json(client.post(format!("{node}/mine")).json(&empty)).await
        }
        Command::Peers => print_json(client.get(format!("{node}/peers"))).await,
        Command::Connect { addr } => {
            let body = serde_json::json!({ "peer": addr });
            print_json(client.post(format!("{node}/peers")).json(&body)).await
        }
        Command::Wallet => print_json(client.get(format!("{node}/wallet"))).await,
        Command::Keygen => {
            let keypair = WalletKeypair::generate();
            let file = keypair.to_wallet_file();
            println!("{}", serde_json::to_string_pretty(&file)?);
            Ok(())
        }
    }
}

/// Sends the request and pretty-prints the JSON response.
async fn print_json(req: reqwest::RequestBuilder) -> Result<()> {
    let res = req.send().await.context("request failed")?;
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;
    if !status.is_success() {
        eprintln!("status: {status}");
    }
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}
