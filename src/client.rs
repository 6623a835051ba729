//! Client verifier.
//!
//! Checks every proof the server returns and records each signed digest by
//! epoch. A digest that conflicts with one already recorded, or an auditor
//! record that conflicts with the client's own view, yields [`Evid`] rather
//! than a bare error: the caller holds a transferable indictment.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use ktd_merkle::Hash;
use ktd_vrf::VrfPublicKey;
use thiserror::Error;

use crate::auditor::Auditor;
use crate::evidence::Evid;
use crate::server::{Server, ServerError};
use crate::types::{map_val, MapLabelPre, Memb, MembHide, NonMemb, SigDig};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server proof rejected")]
    ProofInvalid,
    #[error("digest for epoch {epoch} is older than the client's view")]
    Stale { epoch: u64 },
    #[error("server equivocated: {0}")]
    Equivocation(Box<Evid>),
    #[error("epoch or version counter would overflow")]
    Overflow,
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// A single client's view of one uid's key directory.
pub struct Client {
    uid: u64,
    next_ver: u64,
    server: Arc<Server>,
    serv_sig_pk: VerifyingKey,
    serv_vrf_pk: VrfPublicKey,
    // signed digests per epoch, as far as this client has seen.
    seen_digs: HashMap<u64, SigDig>,
    // least epoch not yet seen; upper bound on seen_digs keys.
    next_epoch: u64,
}

impl Client {
    pub fn new(
        uid: u64,
        server: Arc<Server>,
        serv_sig_pk: VerifyingKey,
        serv_vrf_pk: VrfPublicKey,
    ) -> Self {
        Self {
            uid,
            next_ver: 0,
            server,
            serv_sig_pk,
            serv_vrf_pk,
            seen_digs: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Number of versions this client has successfully registered.
    pub fn next_ver(&self) -> u64 {
        self.next_ver
    }

    /// The digest this client recorded for `epoch`, if any.
    pub fn seen_dig(&self, epoch: u64) -> Option<&SigDig> {
        self.seen_digs.get(&epoch)
    }

    /// Ingest a signed digest, checking signature, freshness, and agreement
    /// with anything previously recorded for the same epoch. Digests may
    /// come from the server or from another client exchanging views.
    pub fn check_dig(&mut self, dig: &SigDig) -> Result<(), ClientError> {
        dig.verify(&self.serv_sig_pk)
            .map_err(|_| ClientError::ProofInvalid)?;
        if let Some(seen) = self.seen_digs.get(&dig.epoch) {
            if seen.dig != dig.dig {
                return Err(ClientError::Equivocation(Box::new(Evid {
                    sig_dig0: dig.clone(),
                    sig_dig1: seen.clone(),
                })));
            }
            return Ok(());
        }
        // tolerate exactly one step back, for reads racing an epoch bump.
        if self.next_epoch != 0 && dig.epoch < self.next_epoch - 1 {
            return Err(ClientError::Stale { epoch: dig.epoch });
        }
        let next = dig.epoch.checked_add(1).ok_or(ClientError::Overflow)?;
        self.seen_digs.insert(dig.epoch, dig.clone());
        self.next_epoch = next;
        Ok(())
    }

    /// Register `pk` as this uid's next version. Returns the publication
    /// epoch.
    pub fn put(&mut self, pk: &[u8]) -> Result<u64, ClientError> {
        let (dig, latest, bound) = self.server.put(self.uid, pk.to_vec())?;
        self.check_dig(&dig)?;
        check_memb(&self.serv_vrf_pk, self.uid, self.next_ver, &dig.dig, &latest)?;
        if latest.epoch_added != dig.epoch || latest.comm_open.pk != pk {
            return Err(ClientError::ProofInvalid);
        }
        let bound_ver = self.next_ver.checked_add(1).ok_or(ClientError::Overflow)?;
        check_non_memb(&self.serv_vrf_pk, self.uid, bound_ver, &dig.dig, &bound)?;
        self.next_ver = bound_ver;
        Ok(dig.epoch)
    }

    /// Fetch and verify the key history for `uid`. Returns the latest key
    /// (`None` when unregistered) and the epoch of the served digest.
    pub fn get(&mut self, uid: u64) -> Result<(Option<Vec<u8>>, u64), ClientError> {
        let reply = self.server.get(uid)?;
        self.check_dig(&reply.dig)?;
        check_hist(&self.serv_vrf_pk, uid, &reply.dig.dig, &reply.hist)?;
        let num_hist = reply.hist.len() as u64;
        // a server disclaiming a uid that has history is hiding a key.
        if num_hist > 0 && reply.latest.is_none() {
            return Err(ClientError::ProofInvalid);
        }
        let mut bound_ver = 0;
        let mut pk = None;
        if let Some(latest) = &reply.latest {
            check_memb(&self.serv_vrf_pk, uid, num_hist, &reply.dig.dig, latest)?;
            bound_ver = num_hist.checked_add(1).ok_or(ClientError::Overflow)?;
            pk = Some(latest.comm_open.pk.clone());
        }
        check_non_memb(&self.serv_vrf_pk, uid, bound_ver, &reply.dig.dig, &reply.bound)?;
        Ok((pk, reply.dig.epoch))
    }

    /// Assert the server has registered nothing for this uid beyond the
    /// versions this client itself put. Returns the epoch the assertion
    /// covers.
    pub fn self_mon(&mut self) -> Result<u64, ClientError> {
        let (dig, bound) = self.server.self_mon(self.uid)?;
        self.check_dig(&dig)?;
        check_non_memb(&self.serv_vrf_pk, self.uid, self.next_ver, &dig.dig, &bound)?;
        Ok(dig.epoch)
    }

    /// Cross-check every recorded digest against an auditor's records.
    pub fn audit(&self, adtr: &Auditor, adtr_pk: &VerifyingKey) -> Result<(), ClientError> {
        for dig in self.seen_digs.values() {
            audit_epoch(dig, &self.serv_sig_pk, adtr, adtr_pk)?;
        }
        Ok(())
    }
}

fn audit_epoch(
    seen: &SigDig,
    serv_pk: &VerifyingKey,
    adtr: &Auditor,
    adtr_pk: &VerifyingKey,
) -> Result<(), ClientError> {
    let info = adtr.get(seen.epoch).map_err(|_| ClientError::ProofInvalid)?;
    let serv_dig = SigDig {
        epoch: seen.epoch,
        dig: info.dig,
        sig: info.serv_sig,
    };
    let adtr_dig = SigDig {
        epoch: seen.epoch,
        dig: info.dig,
        sig: info.adtr_sig,
    };
    serv_dig
        .verify(serv_pk)
        .map_err(|_| ClientError::ProofInvalid)?;
    adtr_dig
        .verify(adtr_pk)
        .map_err(|_| ClientError::ProofInvalid)?;
    if serv_dig.dig != seen.dig {
        return Err(ClientError::Equivocation(Box::new(Evid {
            sig_dig0: serv_dig,
            sig_dig1: seen.clone(),
        })));
    }
    Ok(())
}

/// Verify a VRF label proof for `(uid, ver)`, returning the label it binds.
pub fn check_label(
    pk: &VrfPublicKey,
    uid: u64,
    ver: u64,
    proof: &[u8],
) -> Result<Hash, ClientError> {
    pk.verify(&MapLabelPre { uid, ver }.encode(), proof)
        .map_err(|_| ClientError::ProofInvalid)
}

/// Verify a clear membership proof for `(uid, ver)` against `dig`.
pub fn check_memb(
    pk: &VrfPublicKey,
    uid: u64,
    ver: u64,
    dig: &Hash,
    memb: &Memb,
) -> Result<(), ClientError> {
    let label = check_label(pk, uid, ver, &memb.label_proof)?;
    let val = map_val(memb.epoch_added, &memb.comm_open);
    memb.merk_proof
        .check(&label, &val, dig)
        .map_err(|_| ClientError::ProofInvalid)
}

/// Verify a hiding membership proof for `(uid, ver)` against `dig`.
pub fn check_memb_hide(
    pk: &VrfPublicKey,
    uid: u64,
    ver: u64,
    dig: &Hash,
    memb: &MembHide,
) -> Result<(), ClientError> {
    let label = check_label(pk, uid, ver, &memb.label_proof)?;
    memb.merk_proof
        .check(&label, &memb.map_val, dig)
        .map_err(|_| ClientError::ProofInvalid)
}

/// Verify hiding proofs for versions `0..hist.len()`, in order, no gaps.
pub fn check_hist(
    pk: &VrfPublicKey,
    uid: u64,
    dig: &Hash,
    hist: &[MembHide],
) -> Result<(), ClientError> {
    for (ver, memb) in hist.iter().enumerate() {
        check_memb_hide(pk, uid, ver as u64, dig, memb)?;
    }
    Ok(())
}

/// Verify a non-membership proof for `(uid, ver)` against `dig`.
pub fn check_non_memb(
    pk: &VrfPublicKey,
    uid: u64,
    ver: u64,
    dig: &Hash,
    non_memb: &NonMemb,
) -> Result<(), ClientError> {
    let label = check_label(pk, uid, ver, &non_memb.label_proof)?;
    non_memb
        .merk_proof
        .check(&label, dig)
        .map_err(|_| ClientError::ProofInvalid)
}

/// One entry of a client-kept registration history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistEntry {
    pub epoch: u64,
    pub pk: Vec<u8>,
}

/// Resolve which key was live at `epoch` from a registration history,
/// mirroring what a verified get served at that epoch would return.
pub fn get_hist(hist: &[HistEntry], epoch: u64) -> Option<&[u8]> {
    hist.iter()
        .rev()
        .find(|entry| entry.epoch <= epoch)
        .map(|entry| entry.pk.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_hist_returns_the_newest_entry_at_or_before_the_epoch() {
        let hist = vec![
            HistEntry { epoch: 2, pk: b"a".to_vec() },
            HistEntry { epoch: 5, pk: b"b".to_vec() },
            HistEntry { epoch: 9, pk: b"c".to_vec() },
        ];
        assert_eq!(get_hist(&hist, 1), None);
        assert_eq!(get_hist(&hist, 2), Some(&b"a"[..]));
        assert_eq!(get_hist(&hist, 7), Some(&b"b"[..]));
        assert_eq!(get_hist(&hist, 9), Some(&b"c"[..]));
        assert_eq!(get_hist(&hist, 100), Some(&b"c"[..]));
    }
}
