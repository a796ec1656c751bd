use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A file of wallets keyed by address. One file per node id.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    /// Loads the wallet file at `path`, starting empty when it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        let wallets = if path.exists() {
            let bytes = fs::read(&path)?;
            deserialize(&bytes).map_err(|e| {
                BlockchainError::Wallet(format!("Corrupt wallet file {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(Wallets { wallets, path })
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    fn save_to_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&serialize(&self.wallets)?)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallets_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet_3000.dat");

        let mut wallets = Wallets::load(&path).unwrap();
        assert!(wallets.get_addresses().is_empty());
        let address = wallets.create_wallet().unwrap();

        let reloaded = Wallets::load(&path).unwrap();
        assert_eq!(reloaded.get_addresses(), vec![address.clone()]);
        let wallet = reloaded.get_wallet(&address).unwrap();
        assert_eq!(wallet.get_address(), address);
    }

    #[test]
    fn test_corrupt_wallet_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");
        fs::write(&path, [0xFF, 0xFF, 0xFF]).unwrap();

        assert!(matches!(
            Wallets::load(&path),
            Err(BlockchainError::Wallet(_))
        ));
    }
}
