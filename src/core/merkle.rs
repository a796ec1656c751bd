use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;

/// Binary hash tree over a block's serialized transactions.
///
/// Leaves hash the raw transaction bytes; internal nodes hash the
/// concatenation of their children. Whenever a level holds an odd number of
/// nodes the last node is duplicated before pairing, including the leaf level
/// of a single-transaction block. Changing that rule changes every block hash.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: MerkleNode,
}

#[derive(Debug, Clone)]
pub struct MerkleNode {
    left: Option<Box<MerkleNode>>,
    right: Option<Box<MerkleNode>>,
    data: Vec<u8>,
}

impl MerkleNode {
    fn leaf(item: &[u8]) -> MerkleNode {
        MerkleNode {
            left: None,
            right: None,
            data: sha256_digest(item),
        }
    }

    fn internal(left: MerkleNode, right: MerkleNode) -> MerkleNode {
        let mut joined = Vec::with_capacity(left.data.len() + right.data.len());
        joined.extend_from_slice(&left.data);
        joined.extend_from_slice(&right.data);
        MerkleNode {
            data: sha256_digest(&joined),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

impl MerkleTree {
    pub fn new(items: &[Vec<u8>]) -> Result<MerkleTree> {
        if items.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot create Merkle tree from empty transaction list".to_string(),
            ));
        }

        let mut level: Vec<MerkleNode> = items.iter().map(|item| MerkleNode::leaf(item)).collect();
        Self::pad_odd(&mut level);

        loop {
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            let mut nodes = level.into_iter();
            while let (Some(left), Some(right)) = (nodes.next(), nodes.next()) {
                next.push(MerkleNode::internal(left, right));
            }

            if next.len() == 1 {
                let root = next.remove(0);
                return Ok(MerkleTree { root });
            }
            Self::pad_odd(&mut next);
            level = next;
        }
    }

    fn pad_odd(level: &mut Vec<MerkleNode>) {
        if level.len() % 2 != 0 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
    }

    pub fn get_root(&self) -> &MerkleNode {
        &self.root
    }

    pub fn get_root_hash(&self) -> Vec<u8> {
        self.root.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(count: u8) -> Vec<Vec<u8>> {
        (0..count).map(|i| vec![i; 8]).collect()
    }

    fn pair(left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut joined = left.to_vec();
        joined.extend_from_slice(right);
        sha256_digest(&joined)
    }

    #[test]
    fn test_empty_list_is_rejected() {
        assert!(MerkleTree::new(&[]).is_err());
    }

    #[test]
    fn test_single_item_pairs_leaf_with_itself() {
        let data = items(1);
        let leaf = sha256_digest(&data[0]);
        let tree = MerkleTree::new(&data).unwrap();

        assert_eq!(tree.get_root_hash(), pair(&leaf, &leaf));
        assert!(!tree.get_root().is_leaf());
    }

    #[test]
    fn test_three_items_duplicate_last_leaf() {
        let data = items(3);
        let leaves: Vec<Vec<u8>> = data.iter().map(|d| sha256_digest(d)).collect();
        let expected = pair(&pair(&leaves[0], &leaves[1]), &pair(&leaves[2], &leaves[2]));

        assert_eq!(MerkleTree::new(&data).unwrap().get_root_hash(), expected);
    }

    #[test]
    fn test_odd_inner_level_is_duplicated() {
        // 6 leaves -> 3 parents -> padded to 4 -> 2 -> 1
        let data = items(6);
        let l: Vec<Vec<u8>> = data.iter().map(|d| sha256_digest(d)).collect();
        let a = pair(&l[0], &l[1]);
        let b = pair(&l[2], &l[3]);
        let c = pair(&l[4], &l[5]);
        let expected = pair(&pair(&a, &b), &pair(&c, &c));

        assert_eq!(MerkleTree::new(&data).unwrap().get_root_hash(), expected);
    }

    #[test]
    fn test_root_is_deterministic_and_order_sensitive() {
        let data = items(4);
        let mut swapped = data.clone();
        swapped.swap(1, 2);

        let first = MerkleTree::new(&data).unwrap().get_root_hash();
        assert_eq!(first, MerkleTree::new(&data).unwrap().get_root_hash());
        assert_ne!(first, MerkleTree::new(&swapped).unwrap().get_root_hash());
    }
}
