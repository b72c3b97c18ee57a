//! Block inspection command.

use super::{format_amount, format_timestamp, open_chain};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dposchain_core::{Block, Hash};
use dposchain_storage::ChainReader;
use std::path::PathBuf;

#[derive(Args)]
pub struct BlockArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Block height or id (hex format); lists recent blocks when omitted
    block_id: Option<String>,

    /// Number of recent blocks to list
    #[arg(short, long, default_value = "10")]
    count: u64,
}

pub fn run(args: BlockArgs) -> Result<()> {
    let chain = open_chain(&args.data_dir)?;
    let store = chain.store();
    let epoch_time = chain.constants().epoch_time;

    let Some(block_id) = args.block_id else {
        println!();
        println!("{}", "Recent Blocks:".bold().cyan());
        println!();
        for block in store.recent_blocks(args.count)? {
            println!(
                "  {} {} {} {}",
                format!("#{}", block.height()).bright_black(),
                block.id().to_hex()[..16].bright_yellow(),
                format!("({} txs)", block.tx_count()).bright_black(),
                format_timestamp(epoch_time, block.header.timestamp).bright_black()
            );
        }
        println!();
        return Ok(());
    };

    // Try parsing as height first, then as id
    let block = if let Ok(height) = block_id.parse::<u64>() {
        store.block_at(height)?.context("Block not found")?
    } else {
        let id = Hash::from_hex(&block_id).with_context(|| format!("Invalid block id: {}", block_id))?;
        store.block(&id)?.context("Block not found")?
    };
    print_block(&block, epoch_time);
    Ok(())
}

fn print_block(block: &Block, epoch_time: u64) {
    let header = &block.header;
    println!();
    println!("{}", "Block Information:".bold().cyan());
    println!();
    println!("  Height:       {}", header.height.to_string().bright_cyan());
    println!("  Id:           {}", block.id().to_hex().bright_yellow());
    println!("  Previous:     {}", header.previous_block_id.to_hex().bright_black());
    println!(
        "  Timestamp:    {} ({})",
        header.timestamp.to_string().bright_black(),
        format_timestamp(epoch_time, header.timestamp)
    );
    println!("  Generator:    {}", header.generator_public_key.to_hex().bright_yellow());
    println!("  Payload Hash: {}", header.payload_hash.to_hex().bright_black());
    println!("  Amount:       {}", format_amount(header.total_amount).bright_cyan());
    println!("  Fees:         {}", format_amount(header.total_fee).bright_cyan());
    println!("  Reward:       {}", format_amount(header.reward).bright_cyan());
    println!(
        "  Transactions: {}",
        header.number_of_transactions.to_string().bright_cyan()
    );
    println!();

    if !block.transactions.is_empty() {
        println!("{}", "Transactions:".bold());
        println!();
        for (i, tx) in block.transactions.iter().enumerate() {
            println!(
                "  {} {} {:?} {}",
                format!("{}.", i + 1).bright_black(),
                tx.id().to_hex()[..16].bright_yellow(),
                tx.tx_type(),
                format_amount(tx.amount).bright_cyan()
            );
        }
        println!();
    }
}
