//! Irrefutable evidence of server equivocation.

use core::fmt;

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::codec::CodecError;
use crate::types::SigDig;

/// Two server-signed digests for the same epoch with different roots.
/// Anyone holding the server's public key can check it; a verifying `Evid`
/// is a permanent indictment, not a recoverable error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evid {
    pub sig_dig0: SigDig,
    pub sig_dig1: SigDig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvidError {
    #[error("a signature does not verify under the server key")]
    BadSignature,
    #[error("digests are for different epochs")]
    EpochMismatch,
    #[error("digests agree; nothing to indict")]
    DigsEqual,
}

impl Evid {
    /// Check that this is valid evidence against `serv_sig_pk`.
    pub fn verify(&self, serv_sig_pk: &VerifyingKey) -> Result<(), EvidError> {
        self.sig_dig0
            .verify(serv_sig_pk)
            .map_err(|_| EvidError::BadSignature)?;
        self.sig_dig1
            .verify(serv_sig_pk)
            .map_err(|_| EvidError::BadSignature)?;
        if self.sig_dig0.epoch != self.sig_dig1.epoch {
            return Err(EvidError::EpochMismatch);
        }
        if self.sig_dig0.dig == self.sig_dig1.dig {
            return Err(EvidError::DigsEqual);
        }
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.sig_dig0.epoch
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.sig_dig0.write(&mut buf);
        self.sig_dig1.write(&mut buf);
        buf
    }

    pub fn decode(b: &mut &[u8]) -> Result<Self, CodecError> {
        let sig_dig0 = SigDig::decode(b)?;
        let sig_dig1 = SigDig::decode(b)?;
        Ok(Self { sig_dig0, sig_dig1 })
    }
}

impl fmt::Display for Evid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {} signed as {} and {}",
            self.epoch(),
            hex::encode(&self.sig_dig0.dig[..8]),
            hex::encode(&self.sig_dig1.dig[..8]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PreSigDig;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_dig(sk: &SigningKey, epoch: u64, dig: [u8; 32]) -> SigDig {
        let sig = sk.sign(&PreSigDig { epoch, dig }.encode());
        SigDig {
            epoch,
            dig,
            sig: sig.to_bytes().to_vec(),
        }
    }

    #[test]
    fn conflicting_digests_verify_as_evidence() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let evid = Evid {
            sig_dig0: signed_dig(&sk, 4, [0x01; 32]),
            sig_dig1: signed_dig(&sk, 4, [0x02; 32]),
        };
        evid.verify(&sk.verifying_key()).expect("valid evidence");
    }

    #[test]
    fn agreeing_digests_are_not_evidence() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let evid = Evid {
            sig_dig0: signed_dig(&sk, 4, [0x01; 32]),
            sig_dig1: signed_dig(&sk, 4, [0x01; 32]),
        };
        assert_eq!(evid.verify(&sk.verifying_key()), Err(EvidError::DigsEqual));
    }

    #[test]
    fn cross_epoch_digests_are_not_evidence() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let evid = Evid {
            sig_dig0: signed_dig(&sk, 4, [0x01; 32]),
            sig_dig1: signed_dig(&sk, 5, [0x02; 32]),
        };
        assert_eq!(
            evid.verify(&sk.verifying_key()),
            Err(EvidError::EpochMismatch)
        );
    }

    #[test]
    fn forged_signature_is_rejected() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let other = SigningKey::from_bytes(&[4u8; 32]);
        let evid = Evid {
            sig_dig0: signed_dig(&other, 4, [0x01; 32]),
            sig_dig1: signed_dig(&sk, 4, [0x02; 32]),
        };
        assert_eq!(
            evid.verify(&sk.verifying_key()),
            Err(EvidError::BadSignature)
        );
    }

    #[test]
    fn evidence_round_trips_on_the_wire() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let evid = Evid {
            sig_dig0: signed_dig(&sk, 4, [0x01; 32]),
            sig_dig1: signed_dig(&sk, 4, [0x02; 32]),
        };
        let enc = evid.encode();
        let mut cur = enc.as_slice();
        assert_eq!(Evid::decode(&mut cur), Ok(evid));
        assert!(cur.is_empty());
    }
}
