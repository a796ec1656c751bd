//! Data storage and persistence
//!
//! The UTXO index kept beside the block tree, plus the in-memory pools a
//! node holds between messages: pending transactions and block hashes still
//! being fetched from a peer.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::{TXOutputs, UTXOSet, UTXO};
