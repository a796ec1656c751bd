use crate::config::Config;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::Result;
use crate::network::Server;
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use tempfile::TempDir;

/// A chain whose genesis output (one subsidy) belongs to `wallet`.
///
/// Keep `dir` bound for as long as the chain is used; dropping it removes
/// the database.
pub struct TestChain {
    pub dir: TempDir,
    pub blockchain: Blockchain,
    pub wallet: Wallet,
}

pub fn chain_with_wallet() -> TestChain {
    let dir = tempfile::tempdir().unwrap();
    let wallet = Wallet::new().unwrap();
    let blockchain = Blockchain::create(&wallet.get_address(), dir.path().join("db")).unwrap();
    TestChain {
        dir,
        blockchain,
        wallet,
    }
}

/// Builds and signs a transfer from `wallet`, treating `pending` as the mempool.
pub fn signed_transfer(
    wallet: &Wallet,
    to: &str,
    amount: u64,
    utxo_set: &UTXOSet,
    pending: &[Transaction],
) -> Result<Transaction> {
    Transaction::new_utxo_transaction(wallet, to, amount, utxo_set, pending)
}

/// Appends `count` coinbase-only blocks paying `address`, keeping the UTXO
/// index current.
pub fn mine_coinbase_blocks(blockchain: &Blockchain, address: &str, count: usize) -> Vec<Block> {
    let utxo_set = UTXOSet::new(blockchain.clone());
    (0..count)
        .map(|_| {
            let coinbase = Transaction::new_coinbase_tx(address).unwrap();
            let block = blockchain.mine_block(&[coinbase]).unwrap();
            utxo_set.update(&block).unwrap();
            block
        })
        .collect()
}

pub struct TestNode {
    pub dir: TempDir,
    pub server: Server,
    pub wallet: Wallet,
}

/// Config for a node listening on `127.0.0.1:<port>` with the bootstrap
/// node at `127.0.0.1:3000`.
pub fn test_config(dir: &TempDir, port: u16, mining_address: Option<String>) -> Config {
    Config {
        node_id: port.to_string(),
        node_address: format!("127.0.0.1:{port}"),
        data_dir: dir.path().to_path_buf(),
        mining_address,
        ..Config::default()
    }
}

/// A node with a fresh chain funded to `wallet`. Miners pay rewards to the
/// same wallet.
pub fn test_server(port: u16, miner: bool) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let wallet = Wallet::new().unwrap();
    let config = test_config(&dir, port, miner.then(|| wallet.get_address()));
    let blockchain = Blockchain::create(&wallet.get_address(), config.db_path()).unwrap();
    TestNode {
        server: Server::new(config, blockchain),
        dir,
        wallet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_blocks_extend_chain_and_index() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let blocks = mine_coinbase_blocks(&blockchain, &wallet.get_address(), 3);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blockchain.get_best_height().unwrap(), 3);
        let utxo_set = UTXOSet::new(blockchain);
        assert_eq!(utxo_set.get_balance(&wallet.get_address()).unwrap(), 40);
    }

    #[test]
    fn test_server_fixture_roles() {
        let TestNode { dir: _dir, server, wallet } = test_server(3000, true);
        assert!(server.get_config().is_bootstrap());
        assert_eq!(server.get_config().mining_address, Some(wallet.get_address()));
    }
}
