//! Configuration management
//!
//! Node identity, peer addresses, storage locations and mining settings.

pub mod settings;

pub use settings::Config;
