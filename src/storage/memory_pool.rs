use crate::core::Transaction;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

/// Pending transactions received but not yet mined.
/// ( K -> txid_hex, V => Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        pool.get(txid_hex).cloned()
    }

    /// Inserts `tx`; returns `false` when it was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        let mut pool = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        pool.insert(tx.id_hex(), tx).is_none()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        pool.contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        let mut pool = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        pool.remove(txid_hex)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        pool.values().cloned().collect()
    }
}

/// Block hashes announced by a peer and still to be fetched, in order.
pub struct BlockInTransit {
    inner: RwLock<VecDeque<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(VecDeque::new()),
        }
    }

    /// Replaces the queue with `blocks`.
    pub fn set(&self, blocks: Vec<Vec<u8>>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = blocks.into();
    }

    pub fn pop_front(&self) -> Option<Vec<u8>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn test_memory_pool_add_remove() {
        let pool = MemoryPool::new();
        let wallet = Wallet::new().unwrap();
        let tx = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();
        let id = tx.id_hex();

        assert!(pool.is_empty());
        assert!(pool.add(tx.clone()));
        assert!(!pool.add(tx.clone()));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&id));
        assert_eq!(pool.get(&id), Some(tx.clone()));
        assert_eq!(pool.get_all(), vec![tx.clone()]);

        assert_eq!(pool.remove(&id), Some(tx));
        assert!(pool.remove(&id).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_block_in_transit_is_fifo() {
        let transit = BlockInTransit::new();
        transit.set(vec![vec![1], vec![2], vec![3]]);
        assert_eq!(transit.len(), 3);
        assert_eq!(transit.pop_front(), Some(vec![1]));

        transit.set(vec![vec![9]]);
        assert_eq!(transit.pop_front(), Some(vec![9]));
        assert_eq!(transit.pop_front(), None);
        assert!(transit.is_empty());
    }
}
