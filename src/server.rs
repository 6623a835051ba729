//! Server core: the authenticated map, the signed epoch chain, and the
//! per-uid VRF label cache, all behind one exclusive lock.
//!
//! For a uid with `n` registered versions the cache holds `n + 1` entries:
//! labels for versions `0..n` plus the precomputed label for version `n`,
//! which backs the non-membership bound proof until the next registration.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ktd_merkle::{Lookup, MerkleError, Tree};
use ktd_vrf::{VrfPrivateKey, VrfPublicKey};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::types::{
    map_val, CommitOpen, Label, MapLabelPre, MapValPre, Memb, MembHide, NonMemb, PreSigDig,
    SigDig, UpdateProof, COMMIT_RAND_LEN,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerError {
    #[error("epoch not yet published")]
    NotFound,
    #[error("a put for this uid is already queued in the current batch")]
    PendingUid,
    #[error("version or epoch counter exhausted")]
    Overflow,
    #[error("server state corrupt")]
    Corrupt,
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// A queued registration request.
#[derive(Clone, Debug)]
pub struct PutReq {
    pub uid: u64,
    pub pk: Vec<u8>,
}

/// Reply to a successful put: the new signed digest, a membership proof for
/// the registered version, and a non-membership proof for the next one.
pub type PutReply = (SigDig, Memb, NonMemb);

/// Reply to a get: the latest signed digest, hiding proofs for all but the
/// newest registered version, the newest version in the clear (`None` when
/// the uid is unregistered), and the bound non-membership proof.
#[derive(Clone, Debug)]
pub struct GetReply {
    pub dig: SigDig,
    pub hist: Vec<MembHide>,
    pub latest: Option<Memb>,
    pub bound: NonMemb,
}

impl GetReply {
    /// Wire form: digest, counted history, registered flag, latest proof
    /// when registered, bound proof.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.dig.write(&mut buf);
        codec::put_u64(&mut buf, self.hist.len() as u64);
        for hide in &self.hist {
            hide.write(&mut buf);
        }
        match &self.latest {
            Some(latest) => {
                codec::put_bool(&mut buf, true);
                latest.write(&mut buf);
            }
            None => codec::put_bool(&mut buf, false),
        }
        self.bound.write(&mut buf);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let dig = SigDig::decode(b)?;
        let count = codec::read_u64(b)?;
        let mut hist = Vec::new();
        for _ in 0..count {
            hist.push(MembHide::decode(b)?);
        }
        let latest = if codec::read_bool(b)? {
            Some(Memb::decode(b)?)
        } else {
            None
        };
        let bound = NonMemb::decode(b)?;
        Ok(Self {
            dig,
            hist,
            latest,
            bound,
        })
    }
}

struct VrfCache {
    label: Label,
    proof: Vec<u8>,
}

struct EpochInfo {
    updates: HashMap<Label, Vec<u8>>,
    dig: ktd_merkle::Hash,
    sig: Vec<u8>,
}

struct ServerState {
    key_map: Tree,
    epoch_hist: Vec<EpochInfo>,
    // commitment openings per map label, kept to answer future gets.
    pk_comm_opens: HashMap<Label, CommitOpen>,
    uid_ver_cache: HashMap<u64, Vec<VrfCache>>,
}

/// The key-transparency server. Shareable across threads; every operation
/// serializes on the internal lock.
pub struct Server {
    sig_sk: SigningKey,
    vrf_sk: VrfPrivateKey,
    state: Mutex<ServerState>,
}

impl Server {
    /// Create a server with fresh random keys, returning the public halves.
    pub fn new() -> (Self, VerifyingKey, VrfPublicKey) {
        let mut sig_seed = [0u8; 32];
        let mut vrf_seed = [0u8; 32];
        OsRng.fill_bytes(&mut sig_seed);
        OsRng.fill_bytes(&mut vrf_seed);
        Self::from_seeds(&sig_seed, &vrf_seed)
    }

    /// Create a server from fixed key seeds. Two servers built from the same
    /// seeds share a signing identity but not state.
    pub fn from_seeds(
        sig_seed: &[u8; 32],
        vrf_seed: &[u8; 32],
    ) -> (Self, VerifyingKey, VrfPublicKey) {
        let sig_sk = SigningKey::from_bytes(sig_seed);
        let vrf_sk = VrfPrivateKey::from_seed(vrf_seed);
        let sig_pk = sig_sk.verifying_key();
        let vrf_pk = vrf_sk.public_key();

        let mut state = ServerState {
            key_map: Tree::new(),
            epoch_hist: Vec::new(),
            pk_comm_opens: HashMap::new(),
            uid_ver_cache: HashMap::new(),
        };
        // commit the empty tree as epoch 0.
        let dig = state.key_map.digest();
        push_epoch(&mut state.epoch_hist, &sig_sk, HashMap::new(), dig);

        (
            Self {
                sig_sk,
                vrf_sk,
                state: Mutex::new(state),
            },
            sig_pk,
            vrf_pk,
        )
    }

    /// Register `pk` as the next version for `uid`, publishing one epoch.
    pub fn put(&self, uid: u64, pk: Vec<u8>) -> Result<PutReply, ServerError> {
        let mut replies = self.put_batch(vec![PutReq { uid, pk }]);
        replies.pop().unwrap_or(Err(ServerError::Corrupt))
    }

    /// Apply a batch of registrations as a single epoch. Replies are
    /// positional. A uid may appear at most once per batch; later duplicates
    /// fail with [`ServerError::PendingUid`] and the caller retries.
    pub fn put_batch(&self, reqs: Vec<PutReq>) -> Vec<Result<PutReply, ServerError>> {
        if reqs.is_empty() {
            return Vec::new();
        }
        let state = &mut *self.state.lock();

        let Ok(next_epoch) = u64::try_from(state.epoch_hist.len()) else {
            return reqs.iter().map(|_| Err(ServerError::Overflow)).collect();
        };

        struct Accepted {
            latest_label: Label,
            latest_proof: Vec<u8>,
            bound_label: Label,
            bound_proof: Vec<u8>,
            open: CommitOpen,
        }

        let mut results: Vec<Result<PutReply, ServerError>> = Vec::with_capacity(reqs.len());
        let mut accepted: Vec<Option<Accepted>> = Vec::with_capacity(reqs.len());
        let mut batch_uids = HashSet::new();
        let mut updates: HashMap<Label, Vec<u8>> = HashMap::new();

        for req in &reqs {
            results.push(Err(ServerError::Corrupt));
            accepted.push(None);
            let slot = results.len() - 1;

            if !batch_uids.insert(req.uid) {
                results[slot] = Err(ServerError::PendingUid);
                continue;
            }
            let labels = labels_for(&mut state.uid_ver_cache, req.uid, &self.vrf_sk);
            let Ok(bound_ver) = u64::try_from(labels.len()) else {
                results[slot] = Err(ServerError::Overflow);
                continue;
            };
            let Some(latest) = labels.last() else {
                results[slot] = Err(ServerError::Corrupt);
                continue;
            };
            let latest_label = latest.label;
            let latest_proof = latest.proof.clone();

            let open = gen_commit_open(&req.pk);
            let val = map_val(next_epoch, &open);
            if let Err(err) = state.key_map.put(&latest_label, val.clone()) {
                results[slot] = Err(err.into());
                continue;
            }

            let (bound_label, bound_proof) = comp_map_label(req.uid, bound_ver, &self.vrf_sk);
            labels.push(VrfCache {
                label: bound_label,
                proof: bound_proof.clone(),
            });
            state.pk_comm_opens.insert(latest_label, open.clone());
            updates.insert(latest_label, val);
            accepted[slot] = Some(Accepted {
                latest_label,
                latest_proof,
                bound_label,
                bound_proof,
                open,
            });
        }

        let dig = state.key_map.digest();
        let sig_dig = push_epoch(&mut state.epoch_hist, &self.sig_sk, updates, dig);

        // proofs are produced after every insert so each one binds to the
        // digest actually signed for this epoch.
        for (slot, acc) in accepted.into_iter().enumerate() {
            let Some(acc) = acc else { continue };
            let latest = match state.key_map.get(&acc.latest_label) {
                Ok(Lookup::Member { proof, .. }) => Memb {
                    label_proof: acc.latest_proof,
                    epoch_added: next_epoch,
                    comm_open: acc.open,
                    merk_proof: proof,
                },
                _ => {
                    results[slot] = Err(ServerError::Corrupt);
                    continue;
                }
            };
            let bound = match state.key_map.get(&acc.bound_label) {
                Ok(Lookup::Absent { proof }) => NonMemb {
                    label_proof: acc.bound_proof,
                    merk_proof: proof,
                },
                _ => {
                    results[slot] = Err(ServerError::Corrupt);
                    continue;
                }
            };
            results[slot] = Ok((sig_dig.clone(), latest, bound));
        }
        results
    }

    /// Full history proof for `uid` against the latest signed digest.
    pub fn get(&self, uid: u64) -> Result<GetReply, ServerError> {
        let state = &mut *self.state.lock();
        let dig = latest_dig(&state.epoch_hist)?;
        let labels = labels_for(&mut state.uid_ver_cache, uid, &self.vrf_sk);
        let num_reg = labels.len() - 1;

        // hiding proofs for every registered version below the newest.
        let mut hist = Vec::with_capacity(num_reg.saturating_sub(1));
        for entry in &labels[..num_reg.saturating_sub(1)] {
            match state.key_map.get(&entry.label) {
                Ok(Lookup::Member { val, proof }) => hist.push(MembHide {
                    label_proof: entry.proof.clone(),
                    map_val: val,
                    merk_proof: proof,
                }),
                _ => return Err(ServerError::Corrupt),
            }
        }

        let latest = if num_reg == 0 {
            None
        } else {
            let entry = &labels[num_reg - 1];
            let (val, proof) = match state.key_map.get(&entry.label) {
                Ok(Lookup::Member { val, proof }) => (val, proof),
                _ => return Err(ServerError::Corrupt),
            };
            let pre = MapValPre::decode(&mut val.as_slice()).map_err(|_| ServerError::Corrupt)?;
            let open = state
                .pk_comm_opens
                .get(&entry.label)
                .cloned()
                .ok_or(ServerError::Corrupt)?;
            Some(Memb {
                label_proof: entry.proof.clone(),
                epoch_added: pre.epoch,
                comm_open: open,
                merk_proof: proof,
            })
        };

        let bound = bound_proof(&state.key_map, labels)?;
        Ok(GetReply {
            dig,
            hist,
            latest,
            bound,
        })
    }

    /// Latest signed digest plus a non-membership proof for the uid's bound
    /// version. Lets a client assert nothing was registered behind its back.
    pub fn self_mon(&self, uid: u64) -> Result<(SigDig, NonMemb), ServerError> {
        let state = &mut *self.state.lock();
        let dig = latest_dig(&state.epoch_hist)?;
        let labels = labels_for(&mut state.uid_ver_cache, uid, &self.vrf_sk);
        let bound = bound_proof(&state.key_map, labels)?;
        Ok((dig, bound))
    }

    /// The updates and signature published at `epoch`, for auditors.
    pub fn audit(&self, epoch: u64) -> Result<UpdateProof, ServerError> {
        let state = self.state.lock();
        let idx = usize::try_from(epoch).map_err(|_| ServerError::NotFound)?;
        let info = state.epoch_hist.get(idx).ok_or(ServerError::NotFound)?;
        Ok(UpdateProof {
            updates: info.updates.clone(),
            sig: info.sig.clone(),
        })
    }
}

fn comp_map_label(uid: u64, ver: u64, sk: &VrfPrivateKey) -> (Label, Vec<u8>) {
    sk.hash(&MapLabelPre { uid, ver }.encode())
}

fn gen_commit_open(pk: &[u8]) -> CommitOpen {
    let mut rand = vec![0u8; COMMIT_RAND_LEN];
    OsRng.fill_bytes(&mut rand);
    CommitOpen {
        pk: pk.to_vec(),
        rand,
    }
}

// Sign `(epoch, dig)` and append the epoch entry, returning the signed digest.
fn push_epoch(
    hist: &mut Vec<EpochInfo>,
    sk: &SigningKey,
    updates: HashMap<Label, Vec<u8>>,
    dig: ktd_merkle::Hash,
) -> SigDig {
    let epoch = hist.len() as u64;
    let sig = sk
        .sign(&PreSigDig { epoch, dig }.encode())
        .to_bytes()
        .to_vec();
    hist.push(EpochInfo {
        updates,
        dig,
        sig: sig.clone(),
    });
    SigDig { epoch, dig, sig }
}

fn latest_dig(hist: &[EpochInfo]) -> Result<SigDig, ServerError> {
    // epoch 0 is committed at construction, so the chain is never empty.
    let info = hist.last().ok_or(ServerError::Corrupt)?;
    Ok(SigDig {
        epoch: hist.len() as u64 - 1,
        dig: info.dig,
        sig: info.sig.clone(),
    })
}

// Labels for all registered versions of `uid` plus its bound version,
// computing and caching the version-0 entry for unseen uids.
fn labels_for<'a>(
    cache: &'a mut HashMap<u64, Vec<VrfCache>>,
    uid: u64,
    sk: &VrfPrivateKey,
) -> &'a mut Vec<VrfCache> {
    cache.entry(uid).or_insert_with(|| {
        let (label, proof) = comp_map_label(uid, 0, sk);
        vec![VrfCache { label, proof }]
    })
}

fn bound_proof(key_map: &Tree, labels: &[VrfCache]) -> Result<NonMemb, ServerError> {
    let entry = labels.last().ok_or(ServerError::Corrupt)?;
    match key_map.get(&entry.label) {
        Ok(Lookup::Absent { proof }) => Ok(NonMemb {
            label_proof: entry.proof.clone(),
            merk_proof: proof,
        }),
        _ => Err(ServerError::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec as prop_vec;
    use proptest::prelude::*;

    fn test_server() -> (Server, VerifyingKey, VrfPublicKey) {
        Server::from_seeds(&[1u8; 32], &[2u8; 32])
    }

    #[test]
    fn epoch_zero_is_the_empty_tree() {
        let (server, sig_pk, _) = test_server();
        let (dig, _) = server.self_mon(0).expect("self_mon");
        assert_eq!(dig.epoch, 0);
        assert_eq!(dig.dig, Tree::new().digest());
        dig.verify(&sig_pk).expect("epoch 0 signature");
    }

    #[test]
    fn puts_advance_epochs_contiguously() {
        let (server, _, _) = test_server();
        for want in 1..=5u64 {
            let (dig, _, _) = server.put(7, vec![want as u8]).expect("put");
            assert_eq!(dig.epoch, want, "one epoch per put, no gaps");
        }
    }

    #[test]
    fn put_returns_proofs_bound_to_the_new_digest() {
        let (server, sig_pk, vrf_pk) = test_server();
        let (dig, latest, bound) = server.put(42, vec![0x02; 32]).expect("put");
        dig.verify(&sig_pk).expect("digest signature");
        assert_eq!(latest.epoch_added, dig.epoch);
        assert_eq!(latest.comm_open.pk, vec![0x02; 32]);

        let label = vrf_pk
            .verify(&MapLabelPre { uid: 42, ver: 0 }.encode(), &latest.label_proof)
            .expect("label proof");
        latest
            .merk_proof
            .check(&label, &map_val(dig.epoch, &latest.comm_open), &dig.dig)
            .expect("membership proof");

        let bound_label = vrf_pk
            .verify(&MapLabelPre { uid: 42, ver: 1 }.encode(), &bound.label_proof)
            .expect("bound label proof");
        bound
            .merk_proof
            .check(&bound_label, &dig.dig)
            .expect("bound non-membership proof");
    }

    #[test]
    fn get_on_unregistered_uid_has_no_latest() {
        let (server, _, vrf_pk) = test_server();
        let reply = server.get(99).expect("get");
        assert!(reply.hist.is_empty());
        assert!(reply.latest.is_none());
        let label = vrf_pk
            .verify(&MapLabelPre { uid: 99, ver: 0 }.encode(), &reply.bound.label_proof)
            .expect("bound label proof");
        reply
            .bound
            .merk_proof
            .check(&label, &reply.dig.dig)
            .expect("version 0 absent");
    }

    #[test]
    fn history_grows_one_hiding_proof_per_superseded_version() {
        let (server, _, _) = test_server();
        for i in 0..3u8 {
            server.put(7, vec![i; 32]).expect("put");
        }
        let reply = server.get(7).expect("get");
        assert_eq!(reply.hist.len(), 2);
        let latest = reply.latest.expect("registered");
        assert_eq!(latest.comm_open.pk, vec![2u8; 32]);
        for (ver, hide) in reply.hist.iter().enumerate() {
            let pre = MapValPre::decode(&mut hide.map_val.as_slice()).expect("map val");
            assert_eq!(pre.epoch, ver as u64 + 1, "version registered at epoch ver+1");
        }
    }

    #[test]
    fn commitment_randomness_is_never_reused() {
        let (server, _, _) = test_server();
        let (_, m1, _) = server.put(1, vec![0xaa; 32]).expect("put");
        let (_, m2, _) = server.put(1, vec![0xaa; 32]).expect("put");
        let (_, m3, _) = server.put(2, vec![0xaa; 32]).expect("put");
        assert_ne!(m1.comm_open.rand, m2.comm_open.rand);
        assert_ne!(m1.comm_open.rand, m3.comm_open.rand);
    }

    #[test]
    fn audit_past_head_is_not_found() {
        let (server, _, _) = test_server();
        server.put(1, vec![1]).expect("put");
        assert!(server.audit(1).is_ok());
        assert_eq!(server.audit(2).err(), Some(ServerError::NotFound));
    }

    #[test]
    fn batch_is_one_epoch_with_positional_replies() {
        let (server, _, _) = test_server();
        let replies = server.put_batch(vec![
            PutReq { uid: 1, pk: vec![0x11] },
            PutReq { uid: 2, pk: vec![0x22] },
            PutReq { uid: 3, pk: vec![0x33] },
        ]);
        assert_eq!(replies.len(), 3);
        let digs: Vec<_> = replies
            .into_iter()
            .map(|r| r.expect("batch put"))
            .map(|(dig, latest, _)| {
                assert_eq!(latest.epoch_added, 1);
                dig
            })
            .collect();
        assert!(digs.windows(2).all(|w| w[0] == w[1]), "one digest per batch");
        assert_eq!(digs[0].epoch, 1);
    }

    #[test]
    fn duplicate_uid_in_batch_is_refused() {
        let (server, _, _) = test_server();
        let replies = server.put_batch(vec![
            PutReq { uid: 5, pk: vec![0x01] },
            PutReq { uid: 5, pk: vec![0x02] },
        ]);
        assert!(replies[0].is_ok());
        assert_eq!(replies[1].as_ref().err(), Some(&ServerError::PendingUid));
        // the accepted request registered version 0 only.
        let reply = server.get(5).expect("get");
        assert!(reply.hist.is_empty());
        assert_eq!(reply.latest.expect("registered").comm_open.pk, vec![0x01]);
    }

    #[test]
    fn empty_batch_publishes_nothing() {
        let (server, _, _) = test_server();
        assert!(server.put_batch(Vec::new()).is_empty());
        let (dig, _) = server.self_mon(0).expect("self_mon");
        assert_eq!(dig.epoch, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // epochs stay contiguous and every uid's history length matches its
        // number of accepted puts, under any interleaving of uids.
        #[test]
        fn prop_epochs_contiguous_and_histories_consistent(
            uids in prop_vec(0u64..6, 1..20),
        ) {
            let (server, _, _) = test_server();
            let mut counts: HashMap<u64, u64> = HashMap::new();
            for (i, uid) in uids.iter().enumerate() {
                let (dig, _, _) = server.put(*uid, vec![i as u8]).expect("put");
                prop_assert_eq!(dig.epoch, i as u64 + 1);
                *counts.entry(*uid).or_default() += 1;
            }
            for (uid, count) in counts {
                let reply = server.get(uid).expect("get");
                prop_assert_eq!(reply.hist.len() as u64 + 1, count);
            }
        }
    }
}
