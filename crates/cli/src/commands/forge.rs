//! Forge command.

use super::{load_keypairs, open_chain};
use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use dposchain_consensus::{unix_now, BlockForger};
use std::path::PathBuf;

#[derive(Args)]
pub struct ForgeArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,
}

pub fn run(args: ForgeArgs) -> Result<()> {
    let keypairs = load_keypairs(&args.data_dir)?;
    if keypairs.is_empty() {
        bail!("No delegate keys found. Run 'dposchain init' first.");
    }
    let mut chain = open_chain(&args.data_dir)?;
    let forger = BlockForger::new(keypairs, chain.constants().clone());

    let now = unix_now();
    let slot = chain.clock().current_slot(now);
    match chain.forge(&forger, now)? {
        Some(block) => {
            println!(
                "{}  Forged block {} at height {} in slot {}",
                "✓".green().bold(),
                block.id().to_hex()[..16].bright_yellow(),
                block.height().to_string().bright_cyan(),
                slot
            );
        }
        None => {
            println!(
                "{}",
                format!("Slot {} is not ours or already forged.", slot).yellow()
            );
        }
    }

    Ok(())
}
