//! CLI commands module.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::Subcommand;
use dposchain_chain::{Chain, NodeConfig};
use dposchain_core::{Keypair, COIN};
use dposchain_storage::{ChainStore, Storage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

mod account;
mod block;
mod delegates;
mod forge;
mod init;
mod status;

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new chain with a generated delegate set
    Init(init::InitArgs),
    /// Show the chain tip and round
    Status(status::StatusArgs),
    /// List the forgers of a round
    Delegates(delegates::DelegatesArgs),
    /// Show an account
    Account(account::AccountArgs),
    /// Show a block, or list recent blocks
    Block(block::BlockArgs),
    /// Forge a block if a local delegate owns the current slot
    Forge(forge::ForgeArgs),
}

pub fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init(args) => init::run(args),
        Commands::Status(args) => status::run(args),
        Commands::Delegates(args) => delegates::run(args),
        Commands::Account(args) => account::run(args),
        Commands::Block(args) => block::run(args),
        Commands::Forge(args) => forge::run(args),
    }
}

/// A delegate keypair as saved under `keys/`.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub username: String,
    pub address: String,
    pub public_key: String,
    pub private_key: String,
}

impl KeyFile {
    pub fn new(username: &str, keypair: &Keypair) -> Self {
        Self {
            username: username.to_string(),
            address: keypair.address().to_hex(),
            public_key: keypair.public_key.to_hex(),
            private_key: hex::encode(keypair.private_key()),
        }
    }

    pub fn keypair(&self) -> Result<Keypair> {
        let bytes = hex::decode(&self.private_key).context("Invalid private key hex")?;
        let private_key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .with_context(|| format!("Invalid private key length: expected 32 bytes, got {}", bytes.len()))?;
        Ok(Keypair::from_private_key(&private_key))
    }
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("db")
}

pub fn keys_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("keys")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

pub fn load_config(data_dir: &Path) -> Result<NodeConfig> {
    let contents = fs::read_to_string(config_path(data_dir))
        .context("Failed to read config.json. Did you run 'dposchain init'?")?;
    let config: NodeConfig = serde_json::from_str(&contents).context("Invalid config.json")?;
    config
        .chain
        .constants
        .validate()
        .context("Invalid chain constants in config.json")?;
    Ok(config)
}

pub fn save_config(data_dir: &Path, config: &NodeConfig) -> Result<()> {
    fs::write(config_path(data_dir), serde_json::to_string_pretty(config)?)?;
    Ok(())
}

/// Open the chain stored under `data_dir`.
pub fn open_chain(data_dir: &Path) -> Result<Chain> {
    let config = load_config(data_dir)?;
    let storage = Storage::open(db_path(data_dir))
        .context("Failed to open storage. Did you run 'dposchain init'?")?;
    let chain = Chain::open(ChainStore::new(storage), config.chain)?;
    if !chain.store().is_initialized()? {
        bail!("Chain has no genesis block. Run 'dposchain init' first.");
    }
    Ok(chain)
}

/// All delegate keypairs saved under `keys/`.
pub fn load_keypairs(data_dir: &Path) -> Result<Vec<Keypair>> {
    let dir = keys_dir(data_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut keypairs = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path)?;
        let file: KeyFile = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid key file {}", path.display()))?;
        keypairs.push(file.keypair()?);
    }
    Ok(keypairs)
}

/// Amount in whole coins with eight decimals.
pub fn format_amount(amount: u64) -> String {
    format!("{}.{:08}", amount / COIN, amount % COIN)
}

/// Wall-clock time of an epoch-relative timestamp.
pub fn format_timestamp(epoch_time: u64, timestamp: u64) -> String {
    i64::try_from(epoch_time.saturating_add(timestamp))
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
