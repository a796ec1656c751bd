//! Wallet management and the address codec
//!
//! Key pairs, the per-node wallet file, and conversion between locking
//! hashes and checksummed base58 addresses.

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    convert_address, hash_from_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN, PUB_KEY_HASH_LEN,
};
pub use wallets::Wallets;
