use crate::core::{Block, Blockchain, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::hash_from_address;
use data_encoding::HEXLOWER;
use log::info;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Tree;
use std::collections::{HashMap, HashSet};

const UTXO_TREE: &str = "chainstate";

/// One unspent output and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct UTXO {
    txid: Vec<u8>,
    index: usize,
    output: TXOutput,
}

impl UTXO {
    pub fn new(txid: &[u8], index: usize, output: TXOutput) -> UTXO {
        UTXO {
            txid: txid.to_vec(),
            index,
            output,
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

/// Index entry: the still-unspent outputs of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TXOutputs {
    utxos: Vec<UTXO>,
}

impl TXOutputs {
    pub fn push(&mut self, utxo: UTXO) {
        self.utxos.push(utxo);
    }

    pub fn get_utxos(&self) -> &[UTXO] {
        self.utxos.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

/// Cache of spendable outputs derived from the block log, keyed by txid.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn utxo_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    fn entries(&self) -> Result<Vec<TXOutputs>> {
        self.utxo_tree()?
            .iter()
            .map(|item| {
                let (_, v) = item?;
                deserialize::<TXOutputs>(v.as_ref())
            })
            .collect()
    }

    /// Selects outputs locked to `pub_key_hash` until they cover `amount`.
    ///
    /// Outputs of `pending` are tried first, newest first, then the index.
    /// Anything already consumed by a pending input is skipped. Returns the
    /// accumulated value, which may fall short of `amount`, and the chosen
    /// output indices keyed by hex txid.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
        pending: &[Transaction],
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let spent_by_pending: HashSet<(&[u8], i64)> = pending
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.get_vin())
            .map(|vin| (vin.get_txid(), vin.get_vout()))
            .collect();

        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0u64;
        let mut take = |txid: &[u8], idx: usize, out: &TXOutput| -> bool {
            if accumulated >= amount {
                return false;
            }
            if out.is_locked_with_key(pub_key_hash)
                && !spent_by_pending.contains(&(txid, idx as i64))
            {
                accumulated = accumulated.saturating_add(out.get_value());
                unspent_outputs
                    .entry(HEXLOWER.encode(txid))
                    .or_default()
                    .push(idx);
            }
            true
        };

        'pending: for tx in pending.iter().rev() {
            for (idx, out) in tx.get_vout().iter().enumerate() {
                if !take(tx.get_id(), idx, out) {
                    break 'pending;
                }
            }
        }

        'index: for entry in self.entries()? {
            for utxo in entry.get_utxos() {
                if !take(utxo.get_txid(), utxo.get_index(), utxo.get_output()) {
                    break 'index;
                }
            }
        }

        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        Ok(self
            .entries()?
            .iter()
            .flat_map(|entry| entry.get_utxos())
            .filter(|utxo| utxo.get_output().is_locked_with_key(pub_key_hash))
            .map(|utxo| utxo.get_output().clone())
            .collect())
    }

    pub fn get_balance(&self, address: &str) -> Result<u64> {
        let pub_key_hash = hash_from_address(address)?;
        Ok(self
            .find_utxo(&pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    pub fn is_unspent(&self, txid: &[u8], index: usize) -> Result<bool> {
        match self.utxo_tree()?.get(txid)? {
            Some(bytes) => {
                let entry: TXOutputs = deserialize(bytes.as_ref())?;
                Ok(entry.get_utxos().iter().any(|u| u.get_index() == index))
            }
            None => Ok(false),
        }
    }

    /// Number of transactions that still have unspent outputs.
    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Rebuilds the index from a full walk of the chain.
    pub fn reindex(&self) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;
        utxo_tree.clear()?;

        let utxo_map = self.blockchain.find_utxo()?;
        let mut batch = sled::Batch::default();
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            batch.insert(txid, serialize(outs)?);
        }
        utxo_tree.apply_batch(batch)?;
        utxo_tree.flush()?;
        info!("UTXO index rebuilt with {} entries", utxo_map.len());
        Ok(())
    }

    /// Applies a newly appended block to the index in one store transaction:
    /// consumed outputs are removed, emptied entries deleted, and outputs not
    /// spent within the block itself are added.
    pub fn update(&self, block: &Block) -> Result<()> {
        let consumed: HashSet<(&[u8], i64)> = block
            .get_transactions()
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.get_vin())
            .map(|vin| (vin.get_txid(), vin.get_vout()))
            .collect();

        let mut created = Vec::new();
        for tx in block.get_transactions() {
            let mut outs = TXOutputs::default();
            for (idx, out) in tx.get_vout().iter().enumerate() {
                if !consumed.contains(&(tx.get_id(), idx as i64)) {
                    outs.push(UTXO::new(tx.get_id(), idx, out.clone()));
                }
            }
            if !outs.is_empty() {
                created.push((tx.get_id(), serialize(&outs)?));
            }
        }

        let utxo_tree = self.utxo_tree()?;
        utxo_tree.transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
            for (txid, vout) in &consumed {
                let Some(bytes) = tx_db.get(txid)? else {
                    continue;
                };
                let mut outs: TXOutputs =
                    deserialize(bytes.as_ref()).map_err(ConflictableTransactionError::Abort)?;
                outs.utxos.retain(|u| u.get_index() as i64 != *vout);
                if outs.is_empty() {
                    tx_db.remove(*txid)?;
                } else {
                    let bytes = serialize(&outs).map_err(ConflictableTransactionError::Abort)?;
                    tx_db.insert(*txid, bytes)?;
                }
            }
            for (txid, bytes) in &created {
                tx_db.insert(*txid, bytes.as_slice())?;
            }
            Ok(())
        })?;
        utxo_tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::{chain_with_wallet, signed_transfer, TestChain};
    use crate::wallet::Wallet;

    #[test]
    fn test_genesis_balance() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let utxo_set = UTXOSet::new(blockchain);

        assert_eq!(utxo_set.get_balance(&wallet.get_address()).unwrap(), 10);
        assert_eq!(utxo_set.count_transactions().unwrap(), 1);
    }

    #[test]
    fn test_find_spendable_stops_once_covered() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let address = wallet.get_address();
        for _ in 0..2 {
            let block = blockchain
                .mine_block(&[Transaction::new_coinbase_tx(&address).unwrap()])
                .unwrap();
            UTXOSet::new(blockchain.clone()).update(&block).unwrap();
        }
        let utxo_set = UTXOSet::new(blockchain);

        let (accumulated, outputs) = utxo_set
            .find_spendable_outputs(&wallet.get_pub_key_hash(), 15, &[])
            .unwrap();
        assert_eq!(accumulated, 20);
        assert_eq!(outputs.values().map(Vec::len).sum::<usize>(), 2);

        let (accumulated, _) = utxo_set
            .find_spendable_outputs(&wallet.get_pub_key_hash(), 100, &[])
            .unwrap();
        assert_eq!(accumulated, 30);
    }

    #[test]
    fn test_pending_spends_are_excluded() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let bob = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(blockchain);

        let first = signed_transfer(&wallet, &bob.get_address(), 10, &utxo_set, &[]).unwrap();
        let pending = vec![first];

        // the genesis output is already claimed by the pending transfer
        let (accumulated, _) = utxo_set
            .find_spendable_outputs(&wallet.get_pub_key_hash(), 1, &pending)
            .unwrap();
        assert_eq!(accumulated, 0);
        assert!(matches!(
            signed_transfer(&wallet, &bob.get_address(), 10, &utxo_set, &pending),
            Err(BlockchainError::InsufficientFunds { required: 10, available: 0 })
        ));
    }

    #[test]
    fn test_pending_change_is_spendable() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let bob = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(blockchain);

        let first = signed_transfer(&wallet, &bob.get_address(), 4, &utxo_set, &[]).unwrap();
        let pending = vec![first.clone()];
        let second = signed_transfer(&wallet, &bob.get_address(), 5, &utxo_set, &pending).unwrap();

        assert_eq!(second.get_vin()[0].get_txid(), first.get_id());
        assert!(utxo_set
            .get_blockchain()
            .verify_transaction(&second, &pending)
            .unwrap());
    }

    #[test]
    fn test_update_matches_reindex() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let bob = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(blockchain.clone());

        let tx = signed_transfer(&wallet, &bob.get_address(), 4, &utxo_set, &[]).unwrap();
        let coinbase = Transaction::new_coinbase_tx(&bob.get_address()).unwrap();
        let block = blockchain.mine_block(&[tx.clone(), coinbase]).unwrap();
        utxo_set.update(&block).unwrap();

        // the genesis output is consumed and its entry gone
        let genesis_txid = tx.get_vin()[0].get_txid().to_vec();
        assert!(!utxo_set.is_unspent(&genesis_txid, 0).unwrap());
        assert!(utxo_set.is_unspent(tx.get_id(), 0).unwrap());
        assert!(utxo_set.is_unspent(tx.get_id(), 1).unwrap());

        let incremental = utxo_set.entries().unwrap();
        utxo_set.reindex().unwrap();
        let mut rebuilt = utxo_set.entries().unwrap();
        let mut incremental = incremental;
        incremental.sort_by(|a, b| a.utxos[0].txid.cmp(&b.utxos[0].txid));
        rebuilt.sort_by(|a, b| a.utxos[0].txid.cmp(&b.utxos[0].txid));
        assert_eq!(incremental, rebuilt);

        assert_eq!(utxo_set.get_balance(&wallet.get_address()).unwrap(), 6);
        assert_eq!(utxo_set.get_balance(&bob.get_address()).unwrap(), 14);
    }

    #[test]
    fn test_update_handles_spend_within_block() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let bob = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(blockchain.clone());

        let first = signed_transfer(&wallet, &bob.get_address(), 3, &utxo_set, &[]).unwrap();
        let pending = vec![first.clone()];
        let second = signed_transfer(&wallet, &bob.get_address(), 7, &utxo_set, &pending).unwrap();

        // spender listed before the transaction it spends from
        let block = blockchain.mine_block(&[second.clone(), first.clone()]).unwrap();
        utxo_set.update(&block).unwrap();

        assert!(utxo_set.is_unspent(first.get_id(), 0).unwrap());
        assert!(!utxo_set.is_unspent(first.get_id(), 1).unwrap());
        assert_eq!(utxo_set.get_balance(&bob.get_address()).unwrap(), 10);
        assert_eq!(utxo_set.get_balance(&wallet.get_address()).unwrap(), 0);

        utxo_set.reindex().unwrap();
        assert_eq!(utxo_set.get_balance(&bob.get_address()).unwrap(), 10);
        assert_eq!(utxo_set.get_balance(&wallet.get_address()).unwrap(), 0);
    }

    #[test]
    fn test_balance_matches_chain_walk() {
        let TestChain { dir: _dir, blockchain, wallet } = chain_with_wallet();
        let bob = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(blockchain.clone());
        let tx = signed_transfer(&wallet, &bob.get_address(), 2, &utxo_set, &[]).unwrap();
        let block = blockchain.mine_block(&[tx]).unwrap();
        utxo_set.update(&block).unwrap();
        utxo_set.reindex().unwrap();

        for w in [&wallet, &bob] {
            let walked: u64 = blockchain
                .find_utxo()
                .unwrap()
                .values()
                .flat_map(TXOutputs::get_utxos)
                .filter(|u| u.get_output().is_locked_with_key(&w.get_pub_key_hash()))
                .map(|u| u.get_output().get_value())
                .sum();
            assert_eq!(utxo_set.get_balance(&w.get_address()).unwrap(), walked);
        }
    }
}
