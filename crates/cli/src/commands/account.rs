//! Account inspection command.

use super::{format_amount, open_chain};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dposchain_core::Address;
use dposchain_storage::LedgerReader;
use std::path::PathBuf;

#[derive(Args)]
pub struct AccountArgs {
    /// Directory to store blockchain data
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Account address (hex format)
    address: String,
}

pub fn run(args: AccountArgs) -> Result<()> {
    let address = Address::from_hex(&args.address)
        .with_context(|| format!("Invalid address format: {}", args.address))?;
    let chain = open_chain(&args.data_dir)?;
    let accounts = chain.store().accounts();
    let account = accounts.account_or_default(&address)?;

    println!();
    println!("{}", "Account Information:".bold().cyan());
    println!();
    println!("  Address:      {}", address.to_hex().bright_yellow());
    println!(
        "  Balance:      {}",
        format_amount(account.balance()).bright_cyan()
    );
    println!(
        "  Unconfirmed:  {}",
        format_amount(account.unconfirmed_balance()).bright_black()
    );
    if let Some(key) = &account.confirmed.public_key {
        println!("  Public Key:   {}", key.to_hex().bright_black());
    }
    if account.confirmed.second_public_key.is_some() {
        println!("  Second Sig:   {}", "Yes".green());
    }
    if let Some(multisig) = &account.confirmed.multisig {
        println!(
            "  Multisig:     {} of {}",
            multisig.min,
            multisig.members.len()
        );
    }

    if !account.confirmed.votes.is_empty() {
        println!();
        println!("{}", "Votes:".bold());
        for key in &account.confirmed.votes {
            let name = accounts
                .delegate(key)?
                .and_then(|delegate| delegate.confirmed.username)
                .unwrap_or_else(|| key.to_hex()[..16].to_string());
            println!("  • {}", name.bright_yellow());
        }
    }

    if let Some(username) = &account.confirmed.username {
        let stats = &account.delegate;
        println!();
        println!("{}", "Delegate:".bold());
        println!("  Username:     {}", username.bright_yellow());
        println!("  Vote:         {}", format_amount(stats.vote).bright_cyan());
        println!("  Vote Weight:  {}", format_amount(stats.vote_weight).bright_cyan());
        println!(
            "  Produced:     {} (missed {})",
            stats.produced_blocks.to_string().bright_cyan(),
            stats.missed_blocks
        );
        println!("  Rewards:      {}", format_amount(stats.rewards).bright_cyan());
        println!("  Fees:         {}", format_amount(stats.fees).bright_cyan());
    }
    println!();

    Ok(())
}
