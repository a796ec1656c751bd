use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::process;
use std::sync::Arc;
use utxo_chain::{
    convert_address, hash_pub_key, join_network, pair_transfers, send_tx, validate_address,
    Block, Blockchain, BlockchainError, Command, Config, Opt, Server, Transaction, UTXOSet,
    Wallets,
};

fn main() {
    // Info by default; RUST_LOG still wins
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(opt.config.as_deref())?;

    match opt.command {
        Command::Createblockchain { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            Blockchain::create(&address, config.db_path())?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            let utxo_set = UTXOSet::new(Blockchain::open(config.db_path())?);
            let balance = utxo_set.get_balance(&address)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            let transfers = pair_transfers(&from, &to, &amount)?;
            for transfer in &transfers {
                if !validate_address(&transfer.from) {
                    return Err(format!("Invalid sender address: {}", transfer.from).into());
                }
                if !validate_address(&transfer.to) {
                    return Err(format!("Invalid recipient address: {}", transfer.to).into());
                }
                if transfer.amount == 0 {
                    return Err("Amount must be positive".into());
                }
            }

            let wallets = Wallets::load(config.wallet_path())?;
            let blockchain = Blockchain::open(config.db_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transactions = Transaction::new_utxo_transactions(&wallets, &transfers, &utxo_set)?;

            if mine {
                let block = blockchain.mine_block(&transactions)?;
                utxo_set.update(&block)?;
                info!("Mined block {} at height {}", block.hash_hex(), block.get_height());
            } else {
                for transaction in &transactions {
                    send_tx(
                        &config.bootstrap_address,
                        &config.node_address,
                        transaction,
                        config.connect_timeout(),
                    )?;
                }
            }
            println!("Success!")
        }
        Command::Printchain { json } => {
            let blockchain = Blockchain::open(config.db_path())?;
            if json {
                let blocks = blockchain
                    .iterator()
                    .map(|block| block.map(|b| block_json(&b)))
                    .collect::<Result<Vec<Value>, _>>()?;
                println!("{}", serde_json::to_string_pretty(&blocks)?);
            } else {
                for block in blockchain.iterator() {
                    print_block(&block?);
                }
            }
        }
        Command::Reindexutxo => {
            let utxo_set = UTXOSet::new(Blockchain::open(config.db_path())?);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            let config = config.with_mining_address(miner)?;
            if let Some(address) = &config.mining_address {
                println!("Mining is on. Address to receive rewards: {address}");
            }

            let listener = TcpListener::bind(&config.node_address)?;
            let blockchain = match Blockchain::open(config.db_path()) {
                Ok(blockchain) => blockchain,
                Err(BlockchainError::ChainUninitialized) if config.is_bootstrap() => {
                    return Err(format!(
                        "No blockchain found for node {}. Use 'createblockchain' first.",
                        config.node_id
                    )
                    .into());
                }
                Err(BlockchainError::ChainUninitialized) => join_network(&config, &listener)?,
                Err(e) => return Err(e.into()),
            };

            info!("Node {} starting", config.node_id);
            Arc::new(Server::new(config, blockchain)).run(listener)?;
        }
    }
    Ok(())
}

fn print_block(block: &Block) {
    println!("Height: {}", block.get_height());
    println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
    println!("Cur block hash: {}", block.hash_hex());
    println!("Timestamp: {}", block.get_timestamp());
    println!("Nonce: {}", block.get_nonce());

    for tx in block.get_transactions() {
        println!("- Transaction txid_hex: {}", tx.id_hex());
        if !tx.is_coinbase() {
            for input in tx.get_vin() {
                let address = convert_address(&hash_pub_key(input.get_pub_key()));
                println!(
                    "-- Input txid = {}, vout = {}, from = {}",
                    HEXLOWER.encode(input.get_txid()),
                    input.get_vout(),
                    address,
                )
            }
        }
        for output in tx.get_vout() {
            let address = convert_address(output.get_pub_key_hash());
            println!("-- Output value = {}, to = {}", output.get_value(), address)
        }
    }
    println!()
}

fn block_json(block: &Block) -> Value {
    let transactions: Vec<Value> = block
        .get_transactions()
        .iter()
        .map(|tx| {
            let inputs: Vec<Value> = if tx.is_coinbase() {
                vec![]
            } else {
                tx.get_vin()
                    .iter()
                    .map(|input| {
                        json!({
                            "txid": HEXLOWER.encode(input.get_txid()),
                            "vout": input.get_vout(),
                            "from": convert_address(&hash_pub_key(input.get_pub_key())),
                        })
                    })
                    .collect()
            };
            let outputs: Vec<Value> = tx
                .get_vout()
                .iter()
                .map(|output| {
                    json!({
                        "value": output.get_value(),
                        "to": convert_address(output.get_pub_key_hash()),
                    })
                })
                .collect();
            json!({
                "txid": tx.id_hex(),
                "coinbase": tx.is_coinbase(),
                "inputs": inputs,
                "outputs": outputs,
            })
        })
        .collect();

    json!({
        "height": block.get_height(),
        "hash": block.hash_hex(),
        "pre_block_hash": HEXLOWER.encode(block.get_pre_block_hash()),
        "timestamp": block.get_timestamp(),
        "nonce": block.get_nonce(),
        "transactions": transactions,
    })
}
