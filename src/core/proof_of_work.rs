use crate::core::Block;
use crate::error::Result;
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::debug;
use num_bigint::{BigInt, Sign};
use once_cell::sync::Lazy;
use std::ops::ShlAssign;

/// Number of leading zero bits a block hash needs. Fixed for the whole network.
pub const TARGET_BITS: u32 = 16;

const MAX_NONCE: i64 = i64::MAX;

static TARGET: Lazy<BigInt> = Lazy::new(|| target_for(TARGET_BITS));

fn target_for(bits: u32) -> BigInt {
    let mut target = BigInt::from(1);
    target.shl_assign(256 - bits);
    target
}

pub struct ProofOfWork {
    // prev_hash || merkle_root || height || timestamp; only the nonce varies per attempt
    header_prefix: Vec<u8>,
    target: BigInt,
}

impl ProofOfWork {
    pub fn new_proof_of_work(block: &Block) -> Result<ProofOfWork> {
        Self::build(block, TARGET.clone())
    }

    /// Same search against a custom target. Lets tests mine with fewer bits.
    pub fn with_difficulty(block: &Block, bits: u32) -> Result<ProofOfWork> {
        Self::build(block, target_for(bits))
    }

    fn build(block: &Block, target: BigInt) -> Result<ProofOfWork> {
        let merkle_root = block.hash_transactions()?;
        let mut header_prefix = Vec::with_capacity(block.get_pre_block_hash().len() + 48);
        header_prefix.extend_from_slice(block.get_pre_block_hash());
        header_prefix.extend(merkle_root);
        header_prefix.extend((block.get_height() as i64).to_be_bytes());
        header_prefix.extend(block.get_timestamp().to_be_bytes());
        Ok(ProofOfWork {
            header_prefix,
            target,
        })
    }

    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.header_prefix.len() + 8);
        data_bytes.extend_from_slice(&self.header_prefix);
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigInt::from_bytes_be(Sign::Plus, hash) < self.target
    }

    /// Searches nonces from zero upwards and returns the first (hash, nonce)
    /// below the target, or `None` once the nonce space is exhausted.
    pub fn run(&self) -> Option<(Vec<u8>, i64)> {
        let mut nonce = 0;
        loop {
            let hash = sha256_digest(&self.prepare_data(nonce));
            if self.meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Some((hash, nonce));
            }
            if nonce == MAX_NONCE {
                return None;
            }
            nonce += 1;
        }
    }

    /// Re-derives the hash of `block` from its contents and nonce; valid when
    /// it equals the stored hash and falls below the target.
    pub fn validate(block: &Block) -> Result<bool> {
        let pow = ProofOfWork::new_proof_of_work(block)?;
        Ok(pow.check(block))
    }

    fn check(&self, block: &Block) -> bool {
        let hash = sha256_digest(&self.prepare_data(block.get_nonce()));
        hash == block.get_hash() && self.meets_target(&hash)
    }
}
