#![forbid(unsafe_code)]

//! Radix-256 authenticated map over 32-byte labels.
//!
//! The tree branches on one label byte per level, so every path is exactly 32
//! levels deep. A leaf hashes to `H(value)`; an interior node hashes to the
//! concatenation of its 256 child hashes, with absent children standing in as
//! `H("")`. Proofs carry the full 256 child hashes of every node along the
//! label path, which keeps verification a straight recomputation with no
//! sibling-index bookkeeping.
//!
//! The tree does no locking of its own; callers serialize access.

use blake3::Hasher;
use thiserror::Error;

/// Length of a label, digest, and child hash in bytes.
pub const HASH_LEN: usize = 32;
/// Fanout of every interior node (one byte of the label).
pub const NUM_CHILDREN: usize = 256;

pub type Hash = [u8; HASH_LEN];

/// blake3 of `data`, truncated to the tree's hash length.
pub fn hash_one(data: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash contributed by an absent child.
pub fn empty_hash() -> Hash {
    hash_one(&[])
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("label must be {HASH_LEN} bytes")]
    BadInput,
    #[error("proof does not bind the label to the digest")]
    InvalidProof,
}

/// All child hashes of each node along a label path, root level first. Every
/// level has exactly [`NUM_CHILDREN`] entries.
pub type ChildHashes = Vec<Vec<Hash>>;

/// Proof that a label maps to a value under a digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembProof {
    pub child_hashes: ChildHashes,
}

/// Proof that a label is absent under a digest. May be shorter than a full
/// path when the walk dies out above the leaf level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonMembProof {
    pub child_hashes: ChildHashes,
}

impl MembProof {
    /// Check that `label` maps to `val` under `digest`.
    pub fn check(&self, label: &[u8], val: &[u8], digest: &Hash) -> Result<(), MerkleError> {
        if label.len() != HASH_LEN || self.child_hashes.len() != HASH_LEN {
            return Err(MerkleError::BadInput);
        }
        check_path(label, &hash_one(val), digest, &self.child_hashes)
    }
}

impl NonMembProof {
    /// Check that `label` is absent under `digest`.
    pub fn check(&self, label: &[u8], digest: &Hash) -> Result<(), MerkleError> {
        if label.len() != HASH_LEN || self.child_hashes.len() > HASH_LEN {
            return Err(MerkleError::BadInput);
        }
        check_path(label, &empty_hash(), digest, &self.child_hashes)
    }
}

// Binds `node_hash` to the label position at the proof's deepest level, then
// rolls each level's hash into its parent and the top level into `digest`.
fn check_path(
    label: &[u8],
    node_hash: &Hash,
    digest: &Hash,
    levels: &ChildHashes,
) -> Result<(), MerkleError> {
    let depth = levels.len();
    if depth == 0 || depth > label.len() {
        return Err(MerkleError::InvalidProof);
    }
    if levels.iter().any(|level| level.len() != NUM_CHILDREN) {
        return Err(MerkleError::InvalidProof);
    }
    let pos_bott = label[depth - 1] as usize;
    if levels[depth - 1][pos_bott] != *node_hash {
        return Err(MerkleError::InvalidProof);
    }
    for d in (1..depth).rev() {
        let pos = label[d - 1] as usize;
        if levels[d - 1][pos] != hash_level(&levels[d]) {
            return Err(MerkleError::InvalidProof);
        }
    }
    if hash_level(&levels[0]) != *digest {
        return Err(MerkleError::InvalidProof);
    }
    Ok(())
}

fn hash_level(level: &[Hash]) -> Hash {
    let mut hasher = Hasher::new();
    for h in level {
        hasher.update(h);
    }
    *hasher.finalize().as_bytes()
}

struct Node {
    val: Option<Vec<u8>>,
    hash: Hash,
    children: Box<[Option<Box<Node>>; NUM_CHILDREN]>,
}

impl Node {
    fn new() -> Self {
        Self {
            val: None,
            hash: empty_hash(),
            children: Box::new(std::array::from_fn(|_| None)),
        }
    }

    fn child_hash(&self, pos: usize) -> Hash {
        match &self.children[pos] {
            Some(child) => child.hash,
            None => empty_hash(),
        }
    }

    // Assumes descendant hashes are already up to date.
    fn update_hash(&mut self) {
        if let Some(val) = &self.val {
            self.hash = hash_one(val);
        } else {
            let mut hasher = Hasher::new();
            for pos in 0..NUM_CHILDREN {
                hasher.update(&self.child_hash(pos));
            }
            self.hash = *hasher.finalize().as_bytes();
        }
    }

    fn level_hashes(&self) -> Vec<Hash> {
        (0..NUM_CHILDREN).map(|pos| self.child_hash(pos)).collect()
    }
}

/// Result of [`Tree::get`]: a value with a membership proof, or a
/// non-membership proof for the label.
pub enum Lookup {
    Member { val: Vec<u8>, proof: MembProof },
    Absent { proof: NonMembProof },
}

/// The authenticated map.
pub struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        // the root is an interior node even when empty, so the empty tree's
        // digest is H of 256 absent-child hashes, not H("").
        let mut root = Node::new();
        root.update_hash();
        Self { root }
    }

    /// Root digest over the current contents.
    pub fn digest(&self) -> Hash {
        self.root.hash
    }

    /// Insert or overwrite the value at `label`, returning the new root
    /// digest and a membership proof for the written leaf.
    pub fn put(&mut self, label: &[u8], val: Vec<u8>) -> Result<(Hash, MembProof), MerkleError> {
        if label.len() != HASH_LEN {
            return Err(MerkleError::BadInput);
        }
        put_at(&mut self.root, label, 0, val);
        let proof = MembProof {
            child_hashes: self.path_levels(label, HASH_LEN),
        };
        Ok((self.root.hash, proof))
    }

    /// Look up `label`, producing a membership or non-membership proof
    /// against the current digest.
    pub fn get(&self, label: &[u8]) -> Result<Lookup, MerkleError> {
        if label.len() != HASH_LEN {
            return Err(MerkleError::BadInput);
        }
        let mut node = &self.root;
        let mut depth = 0;
        while depth < HASH_LEN {
            match &node.children[label[depth] as usize] {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => {
                    let proof = NonMembProof {
                        child_hashes: self.path_levels(label, depth + 1),
                    };
                    return Ok(Lookup::Absent { proof });
                }
            }
        }
        // nodes at the leaf level always carry a value.
        let val = node.val.clone().unwrap_or_default();
        let proof = MembProof {
            child_hashes: self.path_levels(label, HASH_LEN),
        };
        Ok(Lookup::Member { val, proof })
    }

    // Child-hash levels for the first `depth` nodes along the label path.
    fn path_levels(&self, label: &[u8], depth: usize) -> ChildHashes {
        let mut levels = Vec::with_capacity(depth);
        let mut node = &self.root;
        levels.push(node.level_hashes());
        for d in 0..depth.saturating_sub(1) {
            match &node.children[label[d] as usize] {
                Some(child) => {
                    node = child;
                    levels.push(node.level_hashes());
                }
                None => break,
            }
        }
        levels
    }
}

fn put_at(node: &mut Node, label: &[u8], depth: usize, val: Vec<u8>) {
    if depth == HASH_LEN {
        node.val = Some(val);
        node.update_hash();
        return;
    }
    let pos = label[depth] as usize;
    let child = node.children[pos].get_or_insert_with(|| Box::new(Node::new()));
    put_at(child, label, depth + 1, val);
    node.update_hash();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec as prop_vec;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn label(fill: u8) -> Vec<u8> {
        vec![fill; HASH_LEN]
    }

    #[test]
    fn empty_tree_proves_absence() {
        let tree = Tree::new();
        let lookup = tree.get(&label(0xab)).expect("valid label");
        match lookup {
            Lookup::Absent { proof } => {
                proof
                    .check(&label(0xab), &tree.digest())
                    .expect("absence proof should verify");
                assert_eq!(proof.child_hashes.len(), 1, "walk dies at the root");
            }
            Lookup::Member { .. } => panic!("empty tree has no members"),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut tree = Tree::new();
        let (dig, proof) = tree.put(&label(0x01), b"val-1".to_vec()).expect("put");
        proof
            .check(&label(0x01), b"val-1", &dig)
            .expect("put proof should verify");

        match tree.get(&label(0x01)).expect("valid label") {
            Lookup::Member { val, proof } => {
                assert_eq!(val, b"val-1");
                proof.check(&label(0x01), &val, &tree.digest()).expect("get proof");
            }
            Lookup::Absent { .. } => panic!("label was just inserted"),
        }
    }

    #[test]
    fn overwrite_changes_digest_and_reproves() {
        let mut tree = Tree::new();
        let (dig1, _) = tree.put(&label(0x01), b"old".to_vec()).expect("put");
        let (dig2, proof) = tree.put(&label(0x01), b"new".to_vec()).expect("put");
        assert_ne!(dig1, dig2, "new value must move the root");
        proof.check(&label(0x01), b"new", &dig2).expect("fresh proof");
        assert_eq!(
            proof.check(&label(0x01), b"old", &dig2),
            Err(MerkleError::InvalidProof),
            "stale value must not verify"
        );
    }

    #[test]
    fn sibling_labels_coexist() {
        let mut tree = Tree::new();
        // shared 31-byte prefix, differing in the last byte.
        let mut la = label(0x42);
        let mut lb = label(0x42);
        la[31] = 0x00;
        lb[31] = 0xff;
        tree.put(&la, b"a".to_vec()).expect("put a");
        let (dig, proof_b) = tree.put(&lb, b"b".to_vec()).expect("put b");
        proof_b.check(&lb, b"b", &dig).expect("b proof");
        match tree.get(&la).expect("valid label") {
            Lookup::Member { val, proof } => {
                assert_eq!(val, b"a");
                proof.check(&la, b"a", &dig).expect("a proof against shared root");
            }
            Lookup::Absent { .. } => panic!("a is present"),
        }
    }

    #[test]
    fn absence_proof_after_inserts() {
        let mut tree = Tree::new();
        tree.put(&label(0x10), b"x".to_vec()).expect("put");
        tree.put(&label(0x20), b"y".to_vec()).expect("put");
        let absent = label(0x30);
        match tree.get(&absent).expect("valid label") {
            Lookup::Absent { proof } => {
                proof.check(&absent, &tree.digest()).expect("absence proof");
                assert!(proof.child_hashes.len() <= HASH_LEN);
            }
            Lookup::Member { .. } => panic!("label was never inserted"),
        }
    }

    #[test]
    fn membership_proof_rejects_absence_claim() {
        let mut tree = Tree::new();
        let (dig, proof) = tree.put(&label(0x05), b"v".to_vec()).expect("put");
        // reinterpreting the membership levels as a non-membership proof
        // must fail: the leaf slot holds H(v), not H("").
        let non_memb = NonMembProof {
            child_hashes: proof.child_hashes.clone(),
        };
        assert_eq!(non_memb.check(&label(0x05), &dig), Err(MerkleError::InvalidProof));
    }

    #[test]
    fn digest_is_insert_order_independent() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0u8..16)
            .map(|i| (label(i.wrapping_mul(17)), vec![i; 4]))
            .collect();
        let mut fwd = Tree::new();
        for (l, v) in &entries {
            fwd.put(l, v.clone()).expect("put");
        }
        let mut rev = Tree::new();
        for (l, v) in entries.iter().rev() {
            rev.put(l, v.clone()).expect("put");
        }
        assert_eq!(
            hex::encode(fwd.digest()),
            hex::encode(rev.digest()),
            "same contents must hash to the same root"
        );
    }

    #[test]
    fn bad_label_length_is_refused() {
        let mut tree = Tree::new();
        assert_eq!(
            tree.put(&[0u8; 16], b"v".to_vec()).err(),
            Some(MerkleError::BadInput)
        );
        assert!(matches!(tree.get(&[0u8; 33]), Err(MerkleError::BadInput)));
    }

    #[test]
    fn truncated_membership_proof_is_refused() {
        let mut tree = Tree::new();
        let (dig, mut proof) = tree.put(&label(0x05), b"v".to_vec()).expect("put");
        proof.child_hashes.pop();
        assert_eq!(
            proof.check(&label(0x05), b"v", &dig),
            Err(MerkleError::BadInput)
        );
    }

    #[test]
    fn oversized_nonmembership_proof_is_refused() {
        let proof = NonMembProof {
            child_hashes: vec![vec![empty_hash(); NUM_CHILDREN]; HASH_LEN + 1],
        };
        assert_eq!(
            proof.check(&label(0x00), &empty_hash()),
            Err(MerkleError::BadInput)
        );
    }

    #[test]
    fn empty_proof_is_refused() {
        let proof = NonMembProof {
            child_hashes: Vec::new(),
        };
        assert_eq!(
            proof.check(&label(0x00), &empty_hash()),
            Err(MerkleError::InvalidProof)
        );
    }

    // values are non-empty: an empty leaf value hashes like an absent child,
    // and the map layer above never stores empty values.
    fn arb_entries() -> impl Strategy<Value = Vec<([u8; 32], Vec<u8>)>> {
        prop_vec(
            (any::<[u8; 32]>(), prop_vec(any::<u8>(), 1..48)),
            1..24,
        )
        .prop_map(|mut entries| {
            let mut seen = HashSet::new();
            entries.retain(|(l, _)| seen.insert(*l));
            entries
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_membership_round_trip(entries in arb_entries()) {
            let mut tree = Tree::new();
            for (l, v) in &entries {
                tree.put(l, v.clone()).expect("put");
            }
            let dig = tree.digest();
            for (l, v) in &entries {
                match tree.get(l).expect("valid label") {
                    Lookup::Member { val, proof } => {
                        prop_assert_eq!(&val, v);
                        prop_assert!(proof.check(l, v, &dig).is_ok());
                    }
                    Lookup::Absent { .. } => prop_assert!(false, "inserted label absent"),
                }
            }
        }

        #[test]
        fn prop_non_membership(entries in arb_entries(), probe in any::<[u8; 32]>()) {
            let mut tree = Tree::new();
            let mut present = false;
            for (l, v) in &entries {
                present |= *l == probe;
                tree.put(l, v.clone()).expect("put");
            }
            prop_assume!(!present);
            match tree.get(&probe).expect("valid label") {
                Lookup::Absent { proof } => {
                    prop_assert!(proof.check(&probe, &tree.digest()).is_ok());
                }
                Lookup::Member { .. } => prop_assert!(false, "uninserted label present"),
            }
        }

        #[test]
        fn prop_tampering_breaks_proof(
            entries in arb_entries(),
            pick in any::<prop::sample::Index>(),
            level_pick in any::<prop::sample::Index>(),
            slot_pick in any::<prop::sample::Index>(),
            byte_pick in any::<prop::sample::Index>(),
        ) {
            let mut tree = Tree::new();
            let mut dig = empty_hash();
            let mut proofs: Vec<([u8; 32], Vec<u8>, MembProof)> = Vec::new();
            for (l, v) in &entries {
                let (d, p) = tree.put(&l[..], v.clone()).expect("put");
                dig = d;
                proofs.push((*l, v.clone(), p));
            }
            // re-prove everything against the final root.
            for (l, v, p) in &mut proofs {
                match tree.get(&l[..]).expect("valid label") {
                    Lookup::Member { proof, .. } => *p = proof,
                    Lookup::Absent { .. } => prop_assert!(false, "inserted label absent"),
                }
                prop_assert!(p.check(&l[..], v, &dig).is_ok());
            }

            let (l, v, proof) = proofs[pick.index(proofs.len())].clone();
            let mut bad = proof.clone();
            let level = level_pick.index(bad.child_hashes.len());
            let slot = slot_pick.index(NUM_CHILDREN);
            let byte = byte_pick.index(HASH_LEN);
            bad.child_hashes[level][slot][byte] ^= 0x01;
            prop_assert_eq!(
                bad.check(&l, &v, &dig),
                Err(MerkleError::InvalidProof),
                "a flipped proof byte must not verify"
            );

            let mut bad_dig = dig;
            bad_dig[byte] ^= 0x01;
            prop_assert_eq!(proof.check(&l, &v, &bad_dig), Err(MerkleError::InvalidProof));

            let mut bad_label = l;
            bad_label[byte] ^= 0x01;
            prop_assert_eq!(
                proof.check(&bad_label, &v, &dig),
                Err(MerkleError::InvalidProof)
            );

            let mut bad_val = v.clone();
            bad_val.push(0xff);
            prop_assert_eq!(
                proof.check(&l, &bad_val, &dig),
                Err(MerkleError::InvalidProof)
            );
        }
    }
}
