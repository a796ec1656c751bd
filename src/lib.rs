//! # utxo-chain
//!
//! A proof-of-work ledger in the UTXO model, with a small peer-to-peer
//! protocol for catching nodes up and relaying transactions.
//!
//! ## Layout
//! - `core/`: blocks, transactions, the Merkle commitment, proof-of-work and
//!   the chain manager
//! - `storage/`: the UTXO index, the mempool and the block-transit queue
//! - `network/`: wire messages, known peers and the node server
//! - `wallet/`: key pairs, the wallet file and base58 addresses
//! - `config/`: node settings from defaults, a TOML file and the environment
//! - `utils/`: hashing, signatures and the bincode record codec
//! - `cli/`: command definitions for the `utxo-chain` binary
//!
//! Blocks and the UTXO index live in one sled database per node. Each block
//! commits to its transactions through a Merkle root, and its hash must fall
//! below a fixed target ([`TARGET_BITS`]). Nodes talk over short-lived TCP
//! connections, one message per connection.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{pair_transfers, Command, Opt};
pub use config::Config;
pub use core::{
    Block, BlockAdded, Blockchain, BlockchainIterator, MerkleTree, ProofOfWork, TXInput, TXOutput,
    Transaction, Transfer, SUBSIDY, TARGET_BITS,
};
pub use error::{BlockchainError, Result};
pub use network::{join_network, send_tx, Message, Node, Nodes, OpType, Outbound, Server};
pub use storage::{BlockInTransit, MemoryPool, TXOutputs, UTXOSet, UTXO};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_from_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
