//! Command-line interface
//!
//! Argument parsing for the `utxo-chain` binary. Dispatch lives in `main.rs`.

pub mod commands;

pub use commands::{pair_transfers, Command, Opt};
