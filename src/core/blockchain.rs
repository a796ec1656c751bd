// The chain manager: owns the block tree in sled and the tip pointer.
// Blocks are keyed by hash; one extra key holds the hash of the current tip.

use crate::core::{Block, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::{TXOutputs, UTXOSet, UTXO};
use data_encoding::HEXLOWER;
use log::{debug, info};
use sled::transaction::ConflictableTransactionResult;
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
const BLOCKS_TREE: &str = "blocks";

/// What [`Blockchain::add_block`] did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAdded {
    /// Already stored; nothing changed.
    Known,
    /// Stored, but the tip did not move: the block is on a shorter branch
    /// or some ancestor is still missing.
    Stored,
    /// Stored on top of the previous tip, and now the tip.
    Extended,
    /// Stored, and the tip moved to another branch or past this block.
    TipMoved,
}

#[derive(Clone)]
pub struct Blockchain {
    tip_hash: Arc<RwLock<Vec<u8>>>,
    db: Db,
    db_path: PathBuf,
    // serializes block appends so the stored tip and the in-memory tip agree
    append_lock: Arc<Mutex<()>>,
}

impl Blockchain {
    /// Initializes a new chain at `db_path` whose genesis block pays the
    /// subsidy to `genesis_address`, then builds the UTXO index.
    pub fn create(genesis_address: &str, db_path: impl AsRef<Path>) -> Result<Blockchain> {
        let (db, blocks_tree) = Self::open_store(db_path.as_ref())?;
        if blocks_tree.get(TIP_BLOCK_HASH_KEY)?.is_some() {
            return Err(BlockchainError::ChainAlreadyExists);
        }

        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address)?;
        let genesis = Block::generate_genesis_block(&coinbase_tx)?;
        Self::initialize(db, blocks_tree, db_path.as_ref(), &genesis)
    }

    /// Initializes a chain from a genesis block mined elsewhere, so that this
    /// node shares the network's first block and can sync the rest.
    pub fn create_from_genesis(genesis: &Block, db_path: impl AsRef<Path>) -> Result<Blockchain> {
        let (db, blocks_tree) = Self::open_store(db_path.as_ref())?;
        if blocks_tree.get(TIP_BLOCK_HASH_KEY)?.is_some() {
            return Err(BlockchainError::ChainAlreadyExists);
        }
        if genesis.get_height() != 0 || !genesis.is_genesis() {
            return Err(BlockchainError::InvalidBlock(format!(
                "{} is not a genesis block",
                genesis.hash_hex()
            )));
        }
        if !ProofOfWork::validate(genesis)? {
            return Err(BlockchainError::InvalidBlock(format!(
                "Proof of work check failed for {}",
                genesis.hash_hex()
            )));
        }
        Self::initialize(db, blocks_tree, db_path.as_ref(), genesis)
    }

    fn initialize(db: Db, blocks_tree: Tree, db_path: &Path, genesis: &Block) -> Result<Blockchain> {
        Self::update_blocks_tree(&blocks_tree, genesis, true)?;
        let blockchain = Blockchain {
            tip_hash: Arc::new(RwLock::new(genesis.get_hash().to_vec())),
            db,
            db_path: db_path.to_path_buf(),
            append_lock: Arc::new(Mutex::new(())),
        };
        UTXOSet::new(blockchain.clone()).reindex()?;
        Ok(blockchain)
    }

    /// Opens an existing chain at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Blockchain> {
        let (db, blocks_tree) = Self::open_store(db_path.as_ref())?;
        let tip_hash = blocks_tree
            .get(TIP_BLOCK_HASH_KEY)?
            .ok_or(BlockchainError::ChainUninitialized)?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.to_vec())),
            db,
            db_path: db_path.as_ref().to_path_buf(),
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    fn open_store(path: &Path) -> Result<(Db, Tree)> {
        let db = sled::open(path).map_err(|e| {
            BlockchainError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;
        let blocks_tree = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        Ok((db, blocks_tree))
    }

    fn blocks_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))
    }

    /// Stores `block` and, when `advance_tip` is set, points the tip at it.
    /// Both writes commit together or not at all.
    fn update_blocks_tree(blocks_tree: &Tree, block: &Block, advance_tip: bool) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        blocks_tree.transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
            tx_db.insert(block_hash, block_data.as_slice())?;
            if advance_tip {
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
            }
            Ok(())
        })?;
        blocks_tree.flush()?;
        Ok(())
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &[u8]) {
        let mut tip_hash = self.tip_hash.write().unwrap_or_else(PoisonError::into_inner);
        *tip_hash = new_tip_hash.to_vec();
    }

    /// Verifies `transactions`, mines them into a block on the current tip
    /// and persists it. The caller supplies the coinbase, if any.
    ///
    /// Fails when a transaction does not verify, when two transactions share
    /// an id or spend the same output, or when an input spends an output that
    /// is not in the UTXO index. Nothing is written in those cases.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        for transaction in transactions {
            if !self.verify_transaction(transaction, transactions)? {
                return Err(BlockchainError::InvalidSignature(transaction.id_hex()));
            }
        }
        Self::check_for_double_spending(transactions)?;
        self.check_inputs_unspent(transactions)?;

        let next_height = self.get_best_height()? + 1;
        info!(
            "Mining block at height {next_height} with {} transactions",
            transactions.len()
        );
        let block = Block::new_block(self.get_tip_hash(), transactions, next_height)?;

        Self::update_blocks_tree(&self.blocks_tree()?, &block, true)?;
        self.set_tip_hash(block.get_hash());
        info!("Successfully mined block: {}", block.hash_hex());

        Ok(block)
    }

    fn check_for_double_spending(transactions: &[Transaction]) -> Result<()> {
        let mut ids: HashSet<&[u8]> = HashSet::new();
        for transaction in transactions {
            if !ids.insert(transaction.get_id()) {
                return Err(BlockchainError::Transaction(format!(
                    "Transaction id {} appears twice in the batch",
                    transaction.id_hex()
                )));
            }
        }

        let mut spent_outputs: HashSet<(&[u8], i64)> = HashSet::new();

        for transaction in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in transaction.get_vin() {
                if !spent_outputs.insert((input.get_txid(), input.get_vout())) {
                    return Err(BlockchainError::Transaction(format!(
                        "Double spend in {}: output {}:{} is consumed twice",
                        transaction.id_hex(),
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }

    // Outputs created inside the batch are spendable by later transactions of
    // the same batch; everything else must still be in the index.
    fn check_inputs_unspent(&self, transactions: &[Transaction]) -> Result<()> {
        let utxo_set = UTXOSet::new(self.clone());
        let batch_ids: HashSet<&[u8]> = transactions.iter().map(|tx| tx.get_id()).collect();

        for transaction in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in transaction.get_vin() {
                if batch_ids.contains(input.get_txid()) {
                    continue;
                }
                let index = input.output_index().ok_or_else(|| {
                    BlockchainError::Transaction(format!(
                        "Negative output index in {}",
                        transaction.id_hex()
                    ))
                })?;
                if !utxo_set.is_unspent(input.get_txid(), index)? {
                    return Err(BlockchainError::Transaction(format!(
                        "Transaction {} spends {}:{} which is not unspent",
                        transaction.id_hex(),
                        HEXLOWER.encode(input.get_txid()),
                        index
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stores a block received from a peer after checking its proof of work
    /// and the ids of its transactions.
    ///
    /// The tip only moves once the block's ancestry is stored all the way
    /// down to genesis. A block whose parent is missing waits in the store;
    /// when the parent arrives, the highest block now linked to genesis
    /// becomes the tip if it is higher than the current one.
    pub fn add_block(&self, block: &Block) -> Result<BlockAdded> {
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.block_exists(block.get_hash())? {
            debug!("Block {} already stored", block.hash_hex());
            return Ok(BlockAdded::Known);
        }
        if !ProofOfWork::validate(block)? {
            return Err(BlockchainError::InvalidBlock(format!(
                "Proof of work check failed for {}",
                block.hash_hex()
            )));
        }
        for tx in block.get_transactions() {
            if !tx.has_valid_id()? {
                return Err(BlockchainError::InvalidBlock(format!(
                    "Block {} carries transaction {} whose id does not match its content",
                    block.hash_hex(),
                    tx.id_hex()
                )));
            }
        }

        let blocks_tree = self.blocks_tree()?;
        Self::update_blocks_tree(&blocks_tree, block, false)?;
        if !self.is_linked_to_genesis(block)? {
            info!(
                "Stored block {} at height {}; waiting for its ancestors",
                block.hash_hex(),
                block.get_height()
            );
            return Ok(BlockAdded::Stored);
        }

        let previous_tip = self.get_tip_hash();
        let (best_hash, best_height) = Self::highest_descendant(&blocks_tree, block)?;
        if best_height <= self.get_best_height()? {
            return Ok(BlockAdded::Stored);
        }

        blocks_tree.insert(TIP_BLOCK_HASH_KEY, best_hash.as_slice())?;
        blocks_tree.flush()?;
        self.set_tip_hash(&best_hash);
        info!(
            "Tip advanced to {} at height {best_height}",
            HEXLOWER.encode(&best_hash)
        );

        if best_hash == block.get_hash() && block.get_pre_block_hash() == previous_tip.as_slice() {
            Ok(BlockAdded::Extended)
        } else {
            Ok(BlockAdded::TipMoved)
        }
    }

    // Every ancestor must be stored, each exactly one below its child.
    fn is_linked_to_genesis(&self, block: &Block) -> Result<bool> {
        let mut current = block.clone();
        while !current.is_genesis() {
            match self.get_block(current.get_pre_block_hash())? {
                Some(parent) if parent.get_height() + 1 == current.get_height() => {
                    current = parent
                }
                _ => return Ok(false),
            }
        }
        Ok(current.get_height() == 0)
    }

    /// The highest stored block descending from `root` through correctly
    /// numbered links, `root` itself included.
    fn highest_descendant(blocks_tree: &Tree, root: &Block) -> Result<(Vec<u8>, usize)> {
        let mut children: HashMap<Vec<u8>, Vec<(Vec<u8>, usize)>> = HashMap::new();
        for entry in blocks_tree.iter() {
            let (key, value) = entry?;
            if key.as_ref() == TIP_BLOCK_HASH_KEY.as_bytes() {
                continue;
            }
            let stored = Block::deserialize(value.as_ref())?;
            children
                .entry(stored.get_pre_block_hash().to_vec())
                .or_default()
                .push((stored.get_hash().to_vec(), stored.get_height()));
        }

        let mut best = (root.get_hash().to_vec(), root.get_height());
        let mut stack = vec![best.clone()];
        while let Some((hash, height)) = stack.pop() {
            for (child, child_height) in children.get(&hash).into_iter().flatten() {
                if *child_height != height + 1 {
                    continue;
                }
                if *child_height > best.1 {
                    best = (child.clone(), *child_height);
                }
                stack.push((child.clone(), *child_height));
            }
        }
        Ok(best)
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.db.clone())
    }

    /// Walks the chain and returns every unspent output, keyed by hex txid.
    pub fn find_utxo(&self) -> Result<HashMap<String, TXOutputs>> {
        let mut utxo: HashMap<String, TXOutputs> = HashMap::new();
        let mut spent_txos: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for block in self.iterator() {
            let block = block?;
            // a block may spend its own outputs, so record its inputs first
            for tx in block.get_transactions().iter().filter(|tx| !tx.is_coinbase()) {
                for txin in tx.get_vin() {
                    spent_txos.insert((txin.get_txid().to_vec(), txin.get_vout()));
                }
            }
            for tx in block.get_transactions() {
                let txid_hex = tx.id_hex();
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    if spent_txos.contains(&(tx.get_id().to_vec(), idx as i64)) {
                        continue;
                    }
                    utxo.entry(txid_hex.clone())
                        .or_default()
                        .push(UTXO::new(tx.get_id(), idx, out.clone()));
                }
            }
        }
        Ok(utxo)
    }

    /// Looks up a transaction by id in `pending` first, then on the chain.
    pub fn find_transaction(&self, txid: &[u8], pending: &[Transaction]) -> Result<Option<Transaction>> {
        if let Some(tx) = pending.iter().find(|tx| tx.get_id() == txid) {
            return Ok(Some(tx.clone()));
        }
        for block in self.iterator() {
            let block = block?;
            if let Some(tx) = block.get_transactions().iter().find(|tx| tx.get_id() == txid) {
                return Ok(Some(tx.clone()));
            }
        }
        Ok(None)
    }

    /// Resolves every transaction `tx` spends from, keyed by hex txid, with a
    /// single chain walk for whatever `pending` does not cover.
    pub fn find_referenced_transactions(
        &self,
        tx: &Transaction,
        pending: &[Transaction],
    ) -> Result<HashMap<String, Transaction>> {
        let mut wanted: HashSet<&[u8]> = tx.get_vin().iter().map(|vin| vin.get_txid()).collect();
        let mut found = HashMap::new();

        for pending_tx in pending {
            if wanted.remove(pending_tx.get_id()) {
                found.insert(pending_tx.id_hex(), pending_tx.clone());
            }
        }
        if !wanted.is_empty() {
            for block in self.iterator() {
                let block = block?;
                for chain_tx in block.get_transactions() {
                    if wanted.remove(chain_tx.get_id()) {
                        found.insert(chain_tx.id_hex(), chain_tx.clone());
                    }
                }
                if wanted.is_empty() {
                    break;
                }
            }
        }

        match wanted.into_iter().next() {
            Some(missing) => Err(BlockchainError::UnknownTransaction(HEXLOWER.encode(missing))),
            None => Ok(found),
        }
    }

    pub fn verify_transaction(&self, tx: &Transaction, pending: &[Transaction]) -> Result<bool> {
        if tx.is_coinbase() {
            return tx.verify(&HashMap::new());
        }
        let prev_txs = self.find_referenced_transactions(tx, pending)?;
        tx.verify(&prev_txs)
    }

    pub fn get_best_height(&self) -> Result<usize> {
        let tip_hash = self.get_tip_hash();
        let tip_block = self
            .get_block(&tip_hash)?
            .ok_or_else(|| BlockchainError::Database("Tip block not found".to_string()))?;
        Ok(tip_block.get_height())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks_tree()?.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Every block hash from the tip back to genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()
            .map(|block| block.map(|b| b.get_hash().to_vec()))
            .collect()
    }

    pub fn block_exists(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks_tree()?.contains_key(block_hash)?)
    }
}

/// Walks from a tip back to genesis through previous-hash links.
pub struct BlockchainIterator {
    db: Db,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: Some(tip_hash),
            db,
        }
    }

    fn load(&self, hash: &[u8]) -> Result<Block> {
        let block_tree = self.db.open_tree(BLOCKS_TREE)?;
        let data = block_tree.get(hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Block {} not found", HEXLOWER.encode(hash)))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.load(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_pre_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::{chain_with_wallet, mine_coinbase_blocks, signed_transfer, TestChain};
    use crate::wallet::Wallet;

    #[test]
    fn test_create_and_reopen() {
        let TestChain { dir, blockchain, .. } = chain_with_wallet();
        let tip = blockchain.get_tip_hash();
        let path = blockchain.get_db_path().to_path_buf();
        drop(blockchain);

        let reopened = Blockchain::open(&path).unwrap();
        assert_eq!(reopened.get_tip_hash(), tip);
        assert_eq!(reopened.get_best_height().unwrap(), 0);
        drop(dir);
    }

    #[test]
    fn test_open_without_chain_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Blockchain::open(dir.path().join("node")),
            Err(BlockchainError::ChainUninitialized)
        ));
    }

    #[test]
    fn test_create_twice_fails() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let path = blockchain.get_db_path().to_path_buf();
        drop(blockchain);

        assert!(matches!(
            Blockchain::create(&wallet.get_address(), &path),
            Err(BlockchainError::ChainAlreadyExists)
        ));
    }

    #[test]
    fn test_iterator_walks_tip_to_genesis() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let address = wallet.get_address();
        for _ in 0..2 {
            let coinbase = Transaction::new_coinbase_tx(&address).unwrap();
            blockchain.mine_block(&[coinbase]).unwrap();
        }

        let heights: Vec<usize> = blockchain
            .iterator()
            .map(|b| b.unwrap().get_height())
            .collect();
        assert_eq!(heights, vec![2, 1, 0]);

        let hashes = blockchain.get_block_hashes().unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0], blockchain.get_tip_hash());
        assert_eq!(blockchain.get_best_height().unwrap(), 2);
    }

    #[test]
    fn test_mined_block_links_to_previous_tip() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let genesis_hash = blockchain.get_tip_hash();
        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();

        let block = blockchain.mine_block(&[coinbase]).unwrap();
        assert_eq!(block.get_pre_block_hash(), genesis_hash.as_slice());
        assert_eq!(block.get_height(), 1);
        assert_eq!(blockchain.get_tip_hash(), block.get_hash());
        assert!(blockchain.block_exists(&genesis_hash).unwrap());
    }

    #[test]
    fn test_find_transaction_prefers_pending() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let pending = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();

        assert!(blockchain
            .find_transaction(pending.get_id(), &[])
            .unwrap()
            .is_none());
        assert_eq!(
            blockchain
                .find_transaction(pending.get_id(), std::slice::from_ref(&pending))
                .unwrap(),
            Some(pending.clone())
        );

        let genesis = blockchain
            .get_block(&blockchain.get_tip_hash())
            .unwrap()
            .unwrap();
        let genesis_tx = &genesis.get_transactions()[0];
        assert_eq!(
            blockchain.find_transaction(genesis_tx.get_id(), &[]).unwrap(),
            Some(genesis_tx.clone())
        );
    }

    #[test]
    fn test_add_block_rejects_bad_proof_of_work() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();
        let block = Block::new_block(blockchain.get_tip_hash(), &[coinbase], 1).unwrap();
        let forged = block.with_nonce(block.get_nonce() + 1);

        assert!(matches!(
            blockchain.add_block(&forged),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(blockchain.get_best_height().unwrap(), 0);

        assert_eq!(blockchain.add_block(&block).unwrap(), BlockAdded::Extended);
        assert_eq!(blockchain.add_block(&block).unwrap(), BlockAdded::Known);
        assert_eq!(blockchain.get_tip_hash(), block.get_hash());
    }

    #[test]
    fn test_add_lower_block_keeps_tip() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let address = wallet.get_address();
        let genesis_hash = blockchain.get_tip_hash();
        blockchain
            .mine_block(&[Transaction::new_coinbase_tx(&address).unwrap()])
            .unwrap();
        let tip = blockchain.get_tip_hash();

        let sibling = Block::new_block(
            genesis_hash,
            &[Transaction::new_coinbase_tx(&address).unwrap()],
            1,
        )
        .unwrap();
        assert_eq!(blockchain.add_block(&sibling).unwrap(), BlockAdded::Stored);
        assert!(blockchain.block_exists(sibling.get_hash()).unwrap());
        assert_eq!(blockchain.get_tip_hash(), tip);
    }

    #[test]
    fn test_block_without_parent_waits_for_it() {
        let TestChain { dir: _dir, blockchain: source, wallet } = chain_with_wallet();
        let genesis = source.get_block(&source.get_tip_hash()).unwrap().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let blockchain = Blockchain::create_from_genesis(&genesis, dir.path().join("peer")).unwrap();

        let blocks = mine_coinbase_blocks(&source, &wallet.get_address(), 3);

        // tip first, the way sync requests them
        assert_eq!(blockchain.add_block(&blocks[2]).unwrap(), BlockAdded::Stored);
        assert_eq!(blockchain.add_block(&blocks[1]).unwrap(), BlockAdded::Stored);
        assert_eq!(blockchain.get_tip_hash(), genesis.get_hash());
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
        assert_eq!(blockchain.get_block_hashes().unwrap().len(), 1);
        UTXOSet::new(blockchain.clone()).reindex().unwrap();

        // the missing link arrives and the tip jumps to the deferred block
        assert_eq!(blockchain.add_block(&blocks[0]).unwrap(), BlockAdded::TipMoved);
        assert_eq!(blockchain.get_tip_hash(), blocks[2].get_hash());
        assert_eq!(blockchain.get_best_height().unwrap(), 3);
        assert_eq!(blockchain.get_block_hashes().unwrap(), source.get_block_hashes().unwrap());

        // a block lying about its height never links
        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();
        let liar = Block::new_block(blocks[2].get_hash().to_vec(), &[coinbase], 9).unwrap();
        assert_eq!(blockchain.add_block(&liar).unwrap(), BlockAdded::Stored);
        assert_eq!(blockchain.get_best_height().unwrap(), 3);
    }

    #[test]
    fn test_relabelled_transaction_cannot_overwrite_an_output() {
        let TestChain { dir: _dir, blockchain, wallet: alice } = chain_with_wallet();
        let mallory = Wallet::new().unwrap();
        mine_coinbase_blocks(&blockchain, &mallory.get_address(), 1);
        let utxo_set = UTXOSet::new(blockchain.clone());
        let alice_genesis_id = blockchain
            .iterator()
            .last()
            .unwrap()
            .unwrap()
            .get_transactions()[0]
            .get_id()
            .to_vec();

        let spend = signed_transfer(&mallory, &mallory.get_address(), 10, &utxo_set, &[]).unwrap();
        let relabelled = spend.with_id(&alice_genesis_id);

        assert!(!blockchain.verify_transaction(&relabelled, &[]).unwrap());
        assert!(matches!(
            blockchain.mine_block(&[relabelled]),
            Err(BlockchainError::InvalidSignature(_))
        ));
        assert!(matches!(
            blockchain.mine_block(&[spend.clone(), spend]),
            Err(BlockchainError::Transaction(_))
        ));
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
        assert_eq!(utxo_set.get_balance(&alice.get_address()).unwrap(), 10);
        assert_eq!(utxo_set.get_balance(&mallory.get_address()).unwrap(), 10);
    }

    #[test]
    fn test_create_from_genesis_shares_first_block() {
        let TestChain { dir: _dir, blockchain, .. } = chain_with_wallet();
        let genesis = blockchain
            .get_block(&blockchain.get_tip_hash())
            .unwrap()
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let copy = Blockchain::create_from_genesis(&genesis, dir.path().join("peer")).unwrap();
        assert_eq!(copy.get_tip_hash(), genesis.get_hash());

        let other = Wallet::new().unwrap();
        let not_genesis = Block::new_block(
            genesis.get_hash().to_vec(),
            &[Transaction::new_coinbase_tx(&other.get_address()).unwrap()],
            1,
        )
        .unwrap();
        assert!(matches!(
            Blockchain::create_from_genesis(&not_genesis, dir.path().join("other")),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }
}
