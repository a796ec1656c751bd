use crate::core::{MerkleTree, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Length of a block hash; the genesis block links to this many zero bytes.
pub const HASH_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    pre_block_hash: Vec<u8>,
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
    height: usize,
}

impl Block {
    /// Assembles a block on top of `pre_block_hash` and mines it.
    pub fn new_block(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        height: usize,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            timestamp: current_timestamp()?,
            pre_block_hash,
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
            height,
        };

        info!("Starting proof-of-work for block at height {height}");
        loop {
            let pow = ProofOfWork::new_proof_of_work(&block)?;
            if let Some((hash, nonce)) = pow.run() {
                block.hash = hash;
                block.nonce = nonce;
                break;
            }
            warn!("Nonce space exhausted at height {height}, advancing timestamp");
            block.timestamp += 1;
        }
        info!("Proof-of-work completed for block: {}", block.hash_hex());

        Ok(block)
    }

    pub fn generate_genesis_block(transaction: &Transaction) -> Result<Block> {
        Block::new_block(vec![0; HASH_LEN], std::slice::from_ref(transaction), 0)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> usize {
        self.height
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    /// Whether this block sits at the start of the chain.
    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.iter().all(|b| *b == 0)
    }

    /// Merkle root over the serialized transactions, in block order.
    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        let serialized = self
            .transactions
            .iter()
            .map(Transaction::serialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(MerkleTree::new(&serialized)?.get_root_hash())
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        let wallet = Wallet::new().unwrap();
        Transaction::new_coinbase_tx(&wallet.get_address()).unwrap()
    }

    #[test]
    fn test_empty_block_is_rejected() {
        assert!(matches!(
            Block::new_block(vec![0; HASH_LEN], &[], 1),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_genesis_block() {
        let block = Block::generate_genesis_block(&coinbase()).unwrap();

        assert!(block.is_genesis());
        assert_eq!(block.get_height(), 0);
        assert_eq!(block.get_pre_block_hash(), &[0u8; HASH_LEN]);
        assert_eq!(block.get_hash().len(), HASH_LEN);
        assert_eq!(block.get_transactions().len(), 1);
        assert!(block.get_hash().starts_with(&[0, 0]));
    }

    #[test]
    fn test_linked_block_is_not_genesis() {
        let genesis = Block::generate_genesis_block(&coinbase()).unwrap();
        let next = Block::new_block(genesis.get_hash().to_vec(), &[coinbase()], 1).unwrap();

        assert!(!next.is_genesis());
        assert_eq!(next.get_pre_block_hash(), genesis.get_hash());
        assert!(ProofOfWork::validate(&next).unwrap());
    }

    #[test]
    fn test_serialization_round_trip() {
        let block = Block::generate_genesis_block(&coinbase()).unwrap();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();

        assert_eq!(decoded, block);
        assert!(ProofOfWork::validate(&decoded).unwrap());
    }

    #[test]
    fn test_merkle_root_tracks_transaction_order() {
        let (a, b) = (coinbase(), coinbase());
        let block = Block::new_block(vec![0; HASH_LEN], &[a.clone(), b.clone()], 0).unwrap();
        let swapped = Block {
            transactions: vec![b, a],
            ..block.clone()
        };

        assert_ne!(
            block.hash_transactions().unwrap(),
            swapped.hash_transactions().unwrap()
        );
        assert!(!ProofOfWork::validate(&swapped).unwrap());
    }
}
