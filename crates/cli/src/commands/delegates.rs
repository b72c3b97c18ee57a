//! Forging order command.

use super::{format_amount, open_chain};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use dposchain_consensus::DelegateSelector;
use dposchain_storage::LedgerReader;
use std::path::PathBuf;

#[derive(Args)]
pub struct DelegatesArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Height whose round to show; defaults to the next block
    #[arg(long)]
    height: Option<u64>,
}

pub fn run(args: DelegatesArgs) -> Result<()> {
    let mut chain = open_chain(&args.data_dir)?;
    let height = match args.height {
        Some(height) => height,
        None => chain.tip()?.height + 1,
    };
    let round = chain.constants().round_of(height);
    let first_slot_height = chain.constants().first_height(round);
    let forgers = chain.get_delegate_list(height)?;
    let accounts = chain.store().accounts();

    println!();
    println!(
        "{}",
        format!("Forgers of round {} (from height {}):", round, first_slot_height)
            .bold()
            .cyan()
    );
    println!();
    for (position, key) in forgers.iter().enumerate() {
        let account = accounts.delegate(key)?;
        let name = account
            .as_ref()
            .and_then(|account| account.confirmed.username.clone())
            .unwrap_or_else(|| "?".to_string());
        let weight = account.map(|account| account.delegate.vote_weight).unwrap_or(0);
        println!(
            "  {} {:<20} {} {}",
            format!("{:>3}.", position + 1).bright_black(),
            name.bright_yellow(),
            key.to_hex()[..16].bright_black(),
            format_amount(weight).bright_cyan()
        );
    }

    let tip = chain.latest_block()?;
    let next_slot = chain.clock().slot_of(tip.header.timestamp) + 1;
    if let Some(next) = DelegateSelector::generator_for_slot(&forgers, next_slot) {
        println!();
        println!("  Slot {} belongs to {}", next_slot, next.to_hex()[..16].bright_yellow());
    }
    println!();

    Ok(())
}
