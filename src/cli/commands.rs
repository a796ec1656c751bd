use crate::core::Transfer;
use crate::error::{BlockchainError, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "utxo-chain", version, about = "A proof-of-work UTXO ledger node")]
pub struct Opt {
    #[arg(
        long,
        global = true,
        env = "CHAIN_CONFIG",
        help = "Path to a TOML configuration file"
    )]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(help = "The address to send genesis block reward to")]
        address: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(
        name = "send",
        about = "Send coins between addresses",
        long_about = "Send coins between addresses. Repeat --from, --to and --amount to \
                      build several transfers in order; later ones may spend the change \
                      of earlier ones."
    )]
    Send {
        #[arg(long, required = true, help = "Source wallet address")]
        from: Vec<String>,
        #[arg(long, required = true, help = "Destination wallet address")]
        to: Vec<String>,
        #[arg(long, required = true, help = "Amount to send")]
        amount: Vec<u64>,
        #[arg(long, help = "Mine the transactions on this node instead of relaying them")]
        mine: bool,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain {
        #[arg(long, help = "Emit the chain as JSON")]
        json: bool,
    },
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a blockchain node")]
    StartNode {
        #[arg(help = "Enable mining mode and send reward to ADDRESS")]
        miner: Option<String>,
    },
}

/// Zips the repeated `send` flags into transfers, the i-th of each.
pub fn pair_transfers(from: &[String], to: &[String], amount: &[u64]) -> Result<Vec<Transfer>> {
    if from.len() != to.len() || from.len() != amount.len() {
        return Err(BlockchainError::Transaction(format!(
            "Got {} senders, {} recipients and {} amounts",
            from.len(),
            to.len(),
            amount.len()
        )));
    }
    Ok(from
        .iter()
        .zip(to)
        .zip(amount)
        .map(|((from, to), amount)| Transfer {
            from: from.clone(),
            to: to.clone(),
            amount: *amount,
        })
        .collect())
}
