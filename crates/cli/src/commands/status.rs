//! Chain status command.

use super::{format_timestamp, open_chain};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use dposchain_consensus::unix_now;
use std::path::PathBuf;

#[derive(Args)]
pub struct StatusArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let chain = open_chain(&args.data_dir)?;
    let stats = chain.stats()?;
    let tip = chain.latest_block()?;
    let constants = chain.constants();

    println!();
    println!("{}", "Chain Status:".bold().cyan());
    println!();
    println!("  Height:        {}", stats.height.to_string().bright_cyan());
    println!("  Tip:           {}", stats.tip.to_hex().bright_yellow());
    println!(
        "  Forged at:     {}",
        format_timestamp(constants.epoch_time, tip.header.timestamp).bright_black()
    );
    println!("  Round:         {}", stats.round.to_string().bright_cyan());
    println!(
        "  Current slot:  {}",
        chain.clock().current_slot(unix_now()).to_string().bright_cyan()
    );
    println!(
        "  Delegates:     {} per round, {} s slots",
        constants.active_delegates.to_string().bright_cyan(),
        constants.block_time
    );
    println!(
        "  Selection:     {}",
        if constants.uses_weighted_selection(stats.round.max(1)) {
            "weighted".green()
        } else {
            "legacy".bright_black()
        }
    );
    println!();

    Ok(())
}
