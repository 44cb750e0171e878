//! Fixed-depth, append-only Poseidon Merkle accumulator over the BN254 scalar
//! field, mirroring the flat per-level layout of the indexer this crate was
//! rebuilt from: level 0 holds inserted leaves in insertion order, level `H`
//! holds a single element — the current root.

use ark_bn254::Fr;
use mixer_types::{bytes_to_field_checked, field_to_hex, hex_to_field_checked, Hex};
use std::sync::Mutex;

/// The canonical empty-leaf constant: `keccak256("tornado") mod p`.
pub fn zero_value() -> Fr {
    mixer_crypto::keccak256_mod_field(b"tornado")
}

#[inline]
fn is_left(node_index: usize) -> bool {
    node_index % 2 == 0
}

struct TreeState {
    /// levels[0] = leaves, levels[height] = root (one element once populated).
    levels: Vec<Vec<Fr>>,
    size: u64,
}

/// Fixed-depth incremental Merkle tree. All operations are guarded by a
/// single internal lock; public methods never re-enter it.
pub struct MerkleTree {
    height: usize,
    capacity: u64,
    zero: Fr,
    state: Mutex<TreeState>,
}

impl MerkleTree {
    pub fn new(height: usize) -> Self {
        assert!(height >= 1, "tree height must be at least 1");
        Self {
            height,
            capacity: 1u64 << height,
            zero: zero_value(),
            state: Mutex::new(TreeState {
                levels: vec![Vec::new(); height + 1],
                size: 0,
            }),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of leaves inserted so far.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    /// Current root, or `None` when the tree is empty.
    pub fn root(&self) -> Option<Fr> {
        let state = self.state.lock().unwrap();
        if state.size == 0 {
            None
        } else {
            state.levels[self.height].first().copied()
        }
    }

    pub fn root_hex(&self) -> Option<Hex> {
        self.root().map(|r| field_to_hex(&r))
    }

    /// Leaf at `index`, or `None` when out of range.
    pub fn leaf(&self, index: u64) -> Option<Fr> {
        let state = self.state.lock().unwrap();
        state.levels[0].get(index as usize).copied()
    }

    /// Authentication path for the first leaf equal to `leaf`.
    ///
    /// Returns `H + 1` `(left, right)` pairs, one per level from the leaf up
    /// to the root; the final pair is `(root, None)`. `None` if the tree is
    /// empty or `leaf` is not present.
    pub fn path(&self, leaf: Fr) -> Option<Vec<(Fr, Option<Fr>)>> {
        let state = self.state.lock().unwrap();
        if state.levels[0].is_empty() {
            return None;
        }

        let mut node_index = state.levels[0].iter().position(|&v| v == leaf)?;

        let mut path = Vec::with_capacity(self.height + 1);
        for level in 0..self.height {
            let lvl = &state.levels[level];
            let (left, right) = if is_left(node_index) {
                let left = lvl[node_index];
                let right = lvl.get(node_index + 1).copied().unwrap_or(self.zero);
                (left, right)
            } else {
                (lvl[node_index - 1], lvl[node_index])
            };
            path.push((left, Some(right)));
            node_index /= 2;
        }
        path.push((state.levels[self.height][0], None));

        Some(path)
    }

    /// Append a leaf already known to be a valid field element — used to
    /// replay leaves already validated by the store at decode time.
    pub fn add(&self, leaf: Fr) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.levels[0].len() as u64 >= self.capacity {
            return false;
        }

        state.levels[0].push(leaf);
        let mut node_index = state.levels[0].len() - 1;

        let (mut add_parent, mut node_left, mut node_right) = if is_left(node_index) {
            (true, leaf, self.zero)
        } else {
            (false, state.levels[0][node_index - 1], leaf)
        };
        let mut parent = mixer_crypto::poseidon::hash(node_left, node_right);

        // Ascend, carrying the index-adjustment quirk (`+= 1` on an even
        // index before halving) through every intermediate level. This is
        // preserved exactly as it appears in the system this tree replays
        // state from, rather than replaced by a textbook incremental formula.
        for level in 1..self.height {
            node_index += if node_index % 2 == 0 { 1 } else { 0 };
            node_index /= 2;

            if add_parent {
                state.levels[level].push(parent);
            } else {
                state.levels[level][node_index] = parent;
            }

            if is_left(node_index) {
                add_parent = true;
                node_left = state.levels[level][node_index];
                node_right = self.zero;
            } else {
                add_parent = false;
                node_left = state.levels[level][node_index - 1];
                node_right = state.levels[level][node_index];
            }
            parent = mixer_crypto::poseidon::hash(node_left, node_right);
        }

        // The root level has exactly one slot; push on first arrival,
        // overwrite thereafter, same as every other level.
        if add_parent {
            state.levels[self.height].push(parent);
        } else {
            state.levels[self.height][0] = parent;
        }

        state.size += 1;
        true
    }

    /// Append a leaf given as raw big-endian bytes, rejecting values `>= p`.
    pub fn add_bytes(&self, leaf_be: &[u8; 32]) -> bool {
        match bytes_to_field_checked(leaf_be) {
            Ok(f) => self.add(f),
            Err(_) => false,
        }
    }

    /// Append a leaf given as a 0x-prefixed hex string, rejecting values `>= p`.
    pub fn add_hex(&self, leaf_hex: &str) -> bool {
        match hex_to_field_checked(leaf_hex) {
            Ok(f) => self.add(f),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(a: Fr, b: Fr) -> Fr {
        mixer_crypto::poseidon::hash(a, b)
    }

    #[test]
    fn s1_empty_tree() {
        let tree = MerkleTree::new(20);
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.root(), None);
        assert_eq!(tree.path(Fr::from(1u64)), None);
    }

    #[test]
    fn s2_single_leaf_root_and_path() {
        let tree = MerkleTree::new(2);
        let leaf = Fr::from(1u64);
        assert!(tree.add(leaf));

        let z = zero_value();
        // A single insert never populates a level-1 right sibling, so the
        // absent node at every level above the leaf is the raw ZERO_VALUE
        // constant, not a hash of two zeros.
        let expected_root = h(h(leaf, z), z);

        assert_eq!(tree.size(), 1);
        assert_eq!(tree.root(), Some(expected_root));

        let path = tree.path(leaf).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[0], (leaf, Some(z)));
        assert_eq!(path[1], (h(leaf, z), Some(z)));
        assert_eq!(path[2], (expected_root, None));
    }

    #[test]
    fn s3_out_of_field_leaf_rejected() {
        let tree = MerkleTree::new(10);
        assert!(!tree.add_bytes(&mixer_types::FIELD_MODULUS_BE));
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.root(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let tree = MerkleTree::new(2); // capacity = 4
        for i in 0..4 {
            assert!(tree.add(Fr::from(i as u64 + 1)));
        }
        assert!(!tree.add(Fr::from(99u64)));
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn path_folds_to_root_for_every_inserted_leaf() {
        let tree = MerkleTree::new(4);
        let leaves: Vec<Fr> = (1..=7).map(Fr::from).collect();
        for &leaf in &leaves {
            assert!(tree.add(leaf));
        }
        let root = tree.root().unwrap();

        for &leaf in &leaves {
            let path = tree.path(leaf).unwrap();
            assert_eq!(path.len(), tree.height() + 1);
            assert_eq!(path.last().unwrap(), &(root, None));

            let mut current = leaf;
            for &(left, right) in path.iter().take(tree.height()) {
                let right = right.unwrap();
                assert!(current == left || current == right);
                current = h(left, right);
            }
            assert_eq!(current, root);
        }
    }

    #[test]
    fn leaf_out_of_range_returns_none() {
        let tree = MerkleTree::new(3);
        tree.add(Fr::from(7u64));
        assert_eq!(tree.leaf(0), Some(Fr::from(7u64)));
        assert_eq!(tree.leaf(1), None);
    }
}
