//! Wire and proof types shared by the server, client verifier, and auditor.
//!
//! The preimage types (`MapLabelPre`, `MapValPre`, `CommitOpen`, `PreSigDig`)
//! are security-critical: both sides of every check re-encode them byte for
//! byte before hashing, VRF-evaluating, or signature-checking.

use std::collections::HashMap;

use ed25519_dalek::{Signature, VerifyingKey};
use ktd_merkle::{ChildHashes, Hash, MembProof, NonMembProof, HASH_LEN, NUM_CHILDREN};
use thiserror::Error;

use crate::codec::{self, CodecError};

/// A map label: the VRF output binding one `(uid, ver)` pair.
pub type Label = Hash;

/// Commitment randomness length. 64 bytes of randomness gives statistical
/// hiding for a 256-bit commitment digest (Boneh-Shoup v0.6, 8.12).
pub const COMMIT_RAND_LEN: usize = 64;
/// Server and auditor signature length.
pub const SIG_LEN: usize = 64;

/// A signed digest failed verification.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("signature does not verify")]
pub struct SigRejected;

/// VRF preimage for a map label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapLabelPre {
    pub uid: u64,
    pub ver: u64,
}

impl MapLabelPre {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        codec::put_u64(&mut buf, self.uid);
        codec::put_u64(&mut buf, self.ver);
        buf
    }
}

/// Commitment opening: a public key and 64 bytes of randomness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitOpen {
    pub pk: Vec<u8>,
    pub rand: Vec<u8>,
}

impl CommitOpen {
    pub fn write(&self, buf: &mut Vec<u8>) {
        codec::put_bytes(buf, &self.pk);
        codec::put_bytes(buf, &self.rand);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.pk.len() + self.rand.len());
        self.write(&mut buf);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let pk = codec::read_bytes(b)?;
        let rand = codec::read_bytes(b)?;
        if rand.len() != COMMIT_RAND_LEN {
            return Err(CodecError::Invalid("commitment randomness"));
        }
        Ok(Self { pk, rand })
    }

    /// Hiding commitment to `pk`.
    pub fn commitment(&self) -> Hash {
        *blake3::hash(&self.encode()).as_bytes()
    }
}

/// Decoded form of a stored map value: the epoch the entry was added and the
/// commitment to the public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapValPre {
    pub epoch: u64,
    pub pk_commit: Hash,
}

impl MapValPre {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + HASH_LEN);
        codec::put_u64(&mut buf, self.epoch);
        codec::put_bytes(&mut buf, &self.pk_commit);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let epoch = codec::read_u64(b)?;
        let pk_commit = codec::read_fixed::<HASH_LEN>(b)?;
        Ok(Self { epoch, pk_commit })
    }
}

/// The map value stored at a label.
pub fn map_val(epoch: u64, open: &CommitOpen) -> Vec<u8> {
    MapValPre {
        epoch,
        pk_commit: open.commitment(),
    }
    .encode()
}

/// Signature preimage for an epoch digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreSigDig {
    pub epoch: u64,
    pub dig: Hash,
}

impl PreSigDig {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + HASH_LEN);
        codec::put_u64(&mut buf, self.epoch);
        codec::put_bytes(&mut buf, &self.dig);
        buf
    }
}

/// A server-signed epoch digest, the artifact clients retain per epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigDig {
    pub epoch: u64,
    pub dig: Hash,
    pub sig: Vec<u8>,
}

impl SigDig {
    /// Check the signature over the `PreSigDig` encoding.
    pub fn verify(&self, pk: &VerifyingKey) -> Result<(), SigRejected> {
        let sig = Signature::from_slice(&self.sig).map_err(|_| SigRejected)?;
        let pre = PreSigDig {
            epoch: self.epoch,
            dig: self.dig,
        }
        .encode();
        pk.verify_strict(&pre, &sig).map_err(|_| SigRejected)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        codec::put_u64(buf, self.epoch);
        codec::put_bytes(buf, &self.dig);
        codec::put_bytes(buf, &self.sig);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let epoch = codec::read_u64(b)?;
        let dig = codec::read_fixed::<HASH_LEN>(b)?;
        let sig = codec::read_bytes(b)?;
        if sig.len() != SIG_LEN {
            return Err(CodecError::Invalid("signature"));
        }
        Ok(Self { epoch, dig, sig })
    }
}

/// Clear membership proof for a registered version, with the commitment
/// opening disclosed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Memb {
    pub label_proof: Vec<u8>,
    pub epoch_added: u64,
    pub comm_open: CommitOpen,
    pub merk_proof: MembProof,
}

impl Memb {
    pub fn write(&self, buf: &mut Vec<u8>) {
        codec::put_bytes(buf, &self.label_proof);
        codec::put_u64(buf, self.epoch_added);
        self.comm_open.write(buf);
        put_child_hashes(buf, &self.merk_proof.child_hashes);
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let label_proof = codec::read_bytes(b)?;
        let epoch_added = codec::read_u64(b)?;
        let comm_open = CommitOpen::decode(b)?;
        let merk_proof = MembProof {
            child_hashes: read_child_hashes(b)?,
        };
        Ok(Self {
            label_proof,
            epoch_added,
            comm_open,
            merk_proof,
        })
    }
}

/// Hiding membership proof: carries the raw map value, leaving the public
/// key behind its commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembHide {
    pub label_proof: Vec<u8>,
    pub map_val: Vec<u8>,
    pub merk_proof: MembProof,
}

impl MembHide {
    pub fn write(&self, buf: &mut Vec<u8>) {
        codec::put_bytes(buf, &self.label_proof);
        codec::put_bytes(buf, &self.map_val);
        put_child_hashes(buf, &self.merk_proof.child_hashes);
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let label_proof = codec::read_bytes(b)?;
        let map_val = codec::read_bytes(b)?;
        let merk_proof = MembProof {
            child_hashes: read_child_hashes(b)?,
        };
        Ok(Self {
            label_proof,
            map_val,
            merk_proof,
        })
    }
}

/// Non-membership proof for a version's label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonMemb {
    pub label_proof: Vec<u8>,
    pub merk_proof: NonMembProof,
}

impl NonMemb {
    pub fn write(&self, buf: &mut Vec<u8>) {
        codec::put_bytes(buf, &self.label_proof);
        put_child_hashes(buf, &self.merk_proof.child_hashes);
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let label_proof = codec::read_bytes(b)?;
        let merk_proof = NonMembProof {
            child_hashes: read_child_hashes(b)?,
        };
        Ok(Self {
            label_proof,
            merk_proof,
        })
    }
}

/// One epoch's published updates plus the server's signature over the
/// resulting digest. Entries travel in map-iteration order; replayed roots
/// do not depend on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateProof {
    pub updates: HashMap<Label, Vec<u8>>,
    pub sig: Vec<u8>,
}

impl UpdateProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u64(&mut buf, self.updates.len() as u64);
        for (label, val) in &self.updates {
            codec::put_bytes(&mut buf, label);
            codec::put_bytes(&mut buf, val);
        }
        codec::put_bytes(&mut buf, &self.sig);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let count = codec::read_u64(b)?;
        let mut updates = HashMap::new();
        for _ in 0..count {
            let label = codec::read_fixed::<HASH_LEN>(b)?;
            let val = codec::read_bytes(b)?;
            if updates.insert(label, val).is_some() {
                return Err(CodecError::Invalid("duplicate update label"));
            }
        }
        let sig = codec::read_bytes(b)?;
        if sig.len() != SIG_LEN {
            return Err(CodecError::Invalid("signature"));
        }
        Ok(Self { updates, sig })
    }
}

fn put_child_hashes(buf: &mut Vec<u8>, levels: &ChildHashes) {
    codec::put_u64(buf, levels.len() as u64);
    for level in levels {
        codec::put_u64(buf, level.len() as u64);
        for h in level {
            codec::put_bytes(buf, h);
        }
    }
}

fn read_child_hashes(b: &mut &[u8]) -> Result<ChildHashes, CodecError> {
    let depth = codec::read_u64(b)?;
    if depth > HASH_LEN as u64 {
        return Err(CodecError::Invalid("proof depth"));
    }
    let mut levels = Vec::with_capacity(depth as usize);
    for _ in 0..depth {
        let width = codec::read_u64(b)?;
        if width != NUM_CHILDREN as u64 {
            return Err(CodecError::Invalid("proof level width"));
        }
        let mut level = Vec::with_capacity(NUM_CHILDREN);
        for _ in 0..NUM_CHILDREN {
            level.push(codec::read_fixed::<HASH_LEN>(b)?);
        }
        levels.push(level);
    }
    Ok(levels)
}
