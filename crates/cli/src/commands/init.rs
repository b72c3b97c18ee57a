//! Initialize chain command.

use super::{db_path, format_amount, keys_dir, save_config, KeyFile};
use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use dposchain_chain::{Chain, GenesisBuilder, NodeConfig};
use dposchain_consensus::unix_now;
use dposchain_core::{Keypair, COIN};
use dposchain_storage::{ChainStore, Storage};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct InitArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Number of delegates to generate; also the round length
    #[arg(long, default_value = "101")]
    delegates: usize,

    /// Genesis balance of each delegate, in whole coins
    #[arg(long, default_value = "1000")]
    balance: u64,
}

pub fn run(args: InitArgs) -> Result<()> {
    println!("{}", "Initializing dposchain...".bold().cyan());
    println!();

    let keypairs = initialize(&args.data_dir, args.delegates, args.balance)?;

    println!("{}  Created genesis block", "✓".green().bold());
    println!("    Delegates: {}", keypairs.len().to_string().bright_cyan());
    println!(
        "    Balance:   {} each",
        format_amount(args.balance * COIN).bright_cyan()
    );
    println!(
        "{}  Saved {} delegate keys to: {}",
        "✓".green().bold(),
        keypairs.len(),
        keys_dir(&args.data_dir).display().to_string().bright_black()
    );

    println!();
    println!("{}", "Chain initialized successfully!".green().bold());
    println!();
    println!("Next steps:");
    println!("  • Use {} to inspect the tip", "dposchain status".bright_cyan());
    println!("  • Use {} to forge in our slot", "dposchain forge".bright_cyan());
    println!("  • Use {} to see the forging order", "dposchain delegates".bright_cyan());

    Ok(())
}

/// Write a fresh chain under `data_dir`: genesis with `count` funded,
/// self-voting delegates, their key files and `config.json`.
pub fn initialize(data_dir: &Path, count: usize, balance: u64) -> Result<Vec<Keypair>> {
    if count == 0 {
        bail!("At least one delegate is required");
    }
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

    let mut config = NodeConfig::default();
    config.chain.constants.active_delegates = count as u64;
    config.chain.constants.epoch_time = unix_now();

    let storage = Storage::open(db_path(data_dir)).context("Failed to open storage")?;
    let mut chain = Chain::open(ChainStore::new(storage), config.chain.clone())?;
    if chain.store().is_initialized()? {
        bail!("Chain already initialized in {}", data_dir.display());
    }

    let keypairs: Vec<Keypair> = (0..count).map(|_| Keypair::generate()).collect();
    let mut genesis = GenesisBuilder::new(Keypair::generate());
    for (i, keypair) in keypairs.iter().enumerate() {
        genesis = genesis.delegate(keypair.clone(), &format!("genesis_{}", i), balance * COIN);
    }
    let tip = chain
        .init_genesis(&genesis.build())
        .context("Failed to initialize genesis block")?;
    tracing::info!(id = %tip.id, delegates = count, "Initialized chain");

    let keys = keys_dir(data_dir);
    fs::create_dir_all(&keys)?;
    for (i, keypair) in keypairs.iter().enumerate() {
        let username = format!("genesis_{}", i);
        let file = KeyFile::new(&username, keypair);
        fs::write(keys.join(format!("{}.json", username)), serde_json::to_string_pretty(&file)?)?;
    }
    save_config(data_dir, &config)?;

    Ok(keypairs)
}
