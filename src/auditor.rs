//! Auditor: an independent replica of the epoch chain.
//!
//! The auditor never trusts a digest it did not compute. It replays each
//! epoch's published updates onto its own copy of the map, checks the
//! server's signature over the digest that replay produced, and co-signs.
//! Clients then compare the co-signed record for an epoch against their own.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ktd_merkle::{Hash, Tree};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::server::{Server, ServerError};
use crate::types::{PreSigDig, SigDig, UpdateProof, SIG_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditorError {
    #[error("epoch not yet audited")]
    NotFound,
    #[error("server signature over the replayed digest rejected")]
    BadSignature,
    #[error("update batch malformed")]
    BadUpdate,
    #[error("replica diverged on an earlier bad update")]
    Poisoned,
}

/// An auditor's record of one epoch: the replayed digest, the server's
/// signature over it, and the auditor's co-signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdtrEpochInfo {
    pub dig: Hash,
    pub serv_sig: Vec<u8>,
    pub adtr_sig: Vec<u8>,
}

impl AdtrEpochInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_bytes(&mut buf, &self.dig);
        codec::put_bytes(&mut buf, &self.serv_sig);
        codec::put_bytes(&mut buf, &self.adtr_sig);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let dig = codec::read_fixed(b)?;
        let serv_sig = codec::read_bytes(b)?;
        let adtr_sig = codec::read_bytes(b)?;
        if serv_sig.len() != SIG_LEN || adtr_sig.len() != SIG_LEN {
            return Err(CodecError::Invalid("signature"));
        }
        Ok(Self {
            dig,
            serv_sig,
            adtr_sig,
        })
    }
}

struct AuditorState {
    key_map: Tree,
    hist: Vec<AdtrEpochInfo>,
    // set once an update failed; the replica's tree no longer matches its
    // verified history and cannot follow the chain further.
    poisoned: bool,
}

pub struct Auditor {
    sig_sk: SigningKey,
    serv_sig_pk: VerifyingKey,
    state: Mutex<AuditorState>,
}

impl Auditor {
    /// Create an auditor with a fresh co-signing key.
    pub fn new(serv_sig_pk: VerifyingKey) -> (Self, VerifyingKey) {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed, serv_sig_pk)
    }

    pub fn from_seed(seed: &[u8; 32], serv_sig_pk: VerifyingKey) -> (Self, VerifyingKey) {
        let sig_sk = SigningKey::from_bytes(seed);
        let sig_pk = sig_sk.verifying_key();
        (
            Self {
                sig_sk,
                serv_sig_pk,
                state: Mutex::new(AuditorState {
                    key_map: Tree::new(),
                    hist: Vec::new(),
                    poisoned: false,
                }),
            },
            sig_pk,
        )
    }

    /// Number of epochs this auditor has verified; also the next epoch it
    /// expects.
    pub fn num_epochs(&self) -> u64 {
        self.state.lock().hist.len() as u64
    }

    /// Replay one epoch of updates and co-sign the digest they produce.
    /// Updates must arrive in epoch order; anything else fails the server
    /// signature check and poisons the replica.
    pub fn update(&self, proof: &UpdateProof) -> Result<(), AuditorError> {
        let state = &mut *self.state.lock();
        if state.poisoned {
            return Err(AuditorError::Poisoned);
        }
        let epoch = state.hist.len() as u64;
        for (label, val) in &proof.updates {
            if val.is_empty() || state.key_map.put(label, val.clone()).is_err() {
                state.poisoned = true;
                return Err(AuditorError::BadUpdate);
            }
        }
        let dig = state.key_map.digest();
        let pre = PreSigDig { epoch, dig }.encode();
        let serv_dig = SigDig {
            epoch,
            dig,
            sig: proof.sig.clone(),
        };
        if serv_dig.verify(&self.serv_sig_pk).is_err() {
            state.poisoned = true;
            return Err(AuditorError::BadSignature);
        }
        let adtr_sig = self.sig_sk.sign(&pre).to_bytes().to_vec();
        state.hist.push(AdtrEpochInfo {
            dig,
            serv_sig: proof.sig.clone(),
            adtr_sig,
        });
        Ok(())
    }

    /// Serve this auditor's record of `epoch`.
    pub fn get(&self, epoch: u64) -> Result<AdtrEpochInfo, AuditorError> {
        let state = self.state.lock();
        let idx = usize::try_from(epoch).map_err(|_| AuditorError::NotFound)?;
        state.hist.get(idx).cloned().ok_or(AuditorError::NotFound)
    }
}

/// Feed `adtr` every epoch the server has published past the auditor's head.
/// Returns the number of epochs applied.
pub fn sync_auditor(server: &Server, adtr: &Auditor) -> Result<u64, AuditorError> {
    let mut applied = 0;
    loop {
        let epoch = adtr.num_epochs();
        match server.audit(epoch) {
            Ok(proof) => {
                adtr.update(&proof)?;
                applied += 1;
            }
            Err(ServerError::NotFound) => return Ok(applied),
            Err(_) => return Ok(applied),
        }
    }
}
