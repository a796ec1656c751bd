//! Core blockchain functionality
//!
//! Blocks, transactions, the Merkle commitment, proof-of-work and the chain
//! manager that persists blocks and tracks the tip.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, HASH_LEN};
pub use blockchain::{BlockAdded, Blockchain, BlockchainIterator};
pub use merkle::{MerkleNode, MerkleTree};
pub use proof_of_work::{ProofOfWork, TARGET_BITS};
pub use transaction::{TXInput, TXOutput, Transaction, Transfer, COINBASE_VOUT, SUBSIDY};
