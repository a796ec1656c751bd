// Value moves through unspent outputs: a transaction consumes earlier outputs
// through its inputs and locks new outputs to recipients' public-key hashes.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{deserialize, ecdsa_p256_sha256_sign_verify, serialize, sha256_digest};
use crate::wallet::{hash_from_address, hash_pub_key, Wallet, Wallets};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reward carried by every coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Output index used by the single input of a coinbase transaction.
pub const COINBASE_VOUT: i64 = -1;

/// A reference to an earlier output plus the proof that the spender owns it.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl TXInput {
    pub fn new(txid: &[u8], vout: i64) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    /// Whether the key carried by this input hashes to `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        !self.pub_key.is_empty() && hash_pub_key(&self.pub_key) == pub_key_hash
    }

    /// The referenced output index, or `None` for the coinbase sentinel.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Creates an output of `value` locked to `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let mut output = TXOutput {
            value,
            pub_key_hash: vec![],
        };
        output.lock(address)?;
        Ok(output)
    }

    pub fn from_pub_key_hash(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    fn lock(&mut self, address: &str) -> Result<()> {
        self.pub_key_hash = hash_from_address(address)?;
        Ok(())
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

/// One leg of a send: `amount` from the wallet holding `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: u64,
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Mints `SUBSIDY` to `to`. The input carries random bytes in its signature
    /// slot so two coinbases paying the same address get distinct ids.
    pub fn new_coinbase_tx(to: &str) -> Result<Transaction> {
        let txout = TXOutput::new(SUBSIDY, to)?;
        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: Uuid::new_v4().as_bytes().to_vec(),
            pub_key: vec![],
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Builds and signs a transfer of `amount` from `wallet` to `to`.
    ///
    /// Inputs are selected from `pending` first and then from the UTXO index;
    /// any surplus is returned to the sender as a change output.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
        pending: &[Transaction],
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }
        let to_pub_key_hash = hash_from_address(to)?;
        let from_pub_key_hash = wallet.get_pub_key_hash();

        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(&from_pub_key_hash, amount, pending)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                let mut input = TXInput::new(&txid, out as i64);
                input.pub_key = wallet.get_public_key().to_vec();
                inputs.push(input);
            }
        }

        let mut outputs = vec![TXOutput::from_pub_key_hash(amount, &to_pub_key_hash)];
        if accumulated > amount {
            outputs.push(TXOutput::from_pub_key_hash(
                accumulated - amount,
                &from_pub_key_hash,
            ));
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.hash()?;

        let prev_txs = utxo_set
            .get_blockchain()
            .find_referenced_transactions(&tx, pending)?;
        tx.sign(wallet, &prev_txs)?;
        Ok(tx)
    }

    /// Builds `transfers` in order, each one seeing the earlier ones as
    /// pending, so a sender can spend the change of its previous transfer.
    pub fn new_utxo_transactions(
        wallets: &Wallets,
        transfers: &[Transfer],
        utxo_set: &UTXOSet,
    ) -> Result<Vec<Transaction>> {
        let mut built: Vec<Transaction> = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            let wallet = wallets.get_wallet(&transfer.from).ok_or_else(|| {
                BlockchainError::Wallet(format!("No wallet for {} in this node", transfer.from))
            })?;
            let tx = Self::new_utxo_transaction(
                wallet,
                &transfer.to,
                transfer.amount,
                utxo_set,
                &built,
            )?;
            built.push(tx);
        }
        Ok(built)
    }

    /// Copy with every input's signature and public key blanked.
    fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            vin: self
                .vin
                .iter()
                .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
                .collect(),
            vout: self.vout.clone(),
        }
    }

    /// Digest signed for input `idx`: the trimmed copy with only that input's
    /// key slot holding the locking hash of the output it spends.
    fn signing_digest(
        tx_copy: &mut Transaction,
        idx: usize,
        locking_hash: &[u8],
    ) -> Result<Vec<u8>> {
        tx_copy.vin[idx].signature = vec![];
        tx_copy.vin[idx].pub_key = locking_hash.to_vec();
        let digest = tx_copy.hash();
        tx_copy.vin[idx].pub_key = vec![];
        digest
    }

    fn referenced_output<'a>(
        input: &TXInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<Option<&'a TXOutput>> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs
            .get(&txid_hex)
            .ok_or(BlockchainError::UnknownTransaction(txid_hex))?;
        Ok(input
            .output_index()
            .and_then(|index| prev_tx.vout.get(index)))
    }

    /// Signs every input with `wallet`. `prev_txs` maps hex txid to the
    /// transactions this one spends from. Coinbase transactions are left alone.
    pub fn sign(&mut self, wallet: &Wallet, prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();
        for idx in 0..self.vin.len() {
            let locking_hash = Self::referenced_output(&self.vin[idx], prev_txs)?
                .ok_or_else(|| {
                    BlockchainError::Transaction(format!(
                        "Input {idx} references a missing output index {}",
                        self.vin[idx].vout
                    ))
                })?
                .pub_key_hash
                .clone();

            let digest = Self::signing_digest(&mut tx_copy, idx, &locking_hash)?;
            self.vin[idx].signature = wallet.sign(&digest)?;
        }
        Ok(())
    }

    /// Checks ownership and signatures of every input against `prev_txs`.
    ///
    /// `Ok(false)` means the transaction is invalid; an error means a
    /// referenced transaction could not be resolved at all. Beyond the
    /// signature, each input's public key must hash to the locking hash of the
    /// output it spends, and inputs must cover outputs.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if !self.has_valid_id()? {
            log::warn!("Transaction {} does not hash to its id", self.id_hex());
            return Ok(false);
        }
        if self.is_coinbase() {
            return Ok(true);
        }
        if self.vin.is_empty() || self.vout.is_empty() {
            log::warn!("Transaction {} has no inputs or outputs", self.id_hex());
            return Ok(false);
        }

        let mut tx_copy = self.trimmed_copy();
        let mut input_value = 0u64;
        for (idx, vin) in self.vin.iter().enumerate() {
            let Some(prev_out) = Self::referenced_output(vin, prev_txs)? else {
                log::warn!("Input {idx} of {} spends a missing output", self.id_hex());
                return Ok(false);
            };

            if !vin.uses_key(prev_out.get_pub_key_hash()) {
                log::warn!(
                    "Input {idx} of {} carries a key that does not own the output",
                    self.id_hex()
                );
                return Ok(false);
            }

            let digest = Self::signing_digest(&mut tx_copy, idx, prev_out.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(&vin.pub_key, &vin.signature, &digest) {
                log::warn!("Input {idx} of {} has a bad signature", self.id_hex());
                return Ok(false);
            }

            input_value = match input_value.checked_add(prev_out.get_value()) {
                Some(sum) => sum,
                None => return Ok(false),
            };
        }

        match self.get_output_value() {
            Ok(output_value) if output_value <= input_value => Ok(true),
            Ok(output_value) => {
                log::warn!(
                    "Transaction {} spends {output_value} but only consumes {input_value}",
                    self.id_hex()
                );
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// Whether the id is the digest of the content it labels.
    ///
    /// Transfers are hashed before signing, so their signatures are blanked
    /// again here. A coinbase keeps its random bytes in the signature slot.
    pub fn has_valid_id(&self) -> Result<bool> {
        let expected = if self.is_coinbase() {
            self.hash()?
        } else {
            self.hash_without_signatures()?
        };
        Ok(expected == self.id)
    }

    fn hash_without_signatures(&self) -> Result<Vec<u8>> {
        let mut tx_copy = self.clone();
        for input in tx_copy.vin.iter_mut() {
            input.signature.clear();
        }
        tx_copy.hash()
    }

    /// SHA-256 of the serialized transaction with its id blanked.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_output_value(&self) -> Result<u64> {
        self.vout.iter().try_fold(0u64, |total, out| {
            total
                .checked_add(out.get_value())
                .ok_or_else(|| BlockchainError::Transaction("Output value overflow".to_string()))
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn with_id(&self, id: &[u8]) -> Transaction {
        Transaction {
            id: id.to_vec(),
            ..self.clone()
        }
    }
}
