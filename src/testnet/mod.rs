//! Shared fixtures for unit tests
//!
//! Throwaway chains in temporary directories, funded wallets and node
//! servers wired for in-process message routing.

pub mod test_utils;

pub use test_utils::*;
