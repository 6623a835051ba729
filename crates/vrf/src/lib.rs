//! VRF engine for authenticated-map labels.
//!
//! The construction leans on RFC 8032's deterministic signing: the label
//! preimage is signed under a domain-separated Ed25519 key, and the signature
//! is compressed with SHA-512 and then BLAKE3-256 into the 32-byte output.
//! The signature itself is the proof. Verifiers recompute the output from the
//! strictly-verified signature, so outputs are deterministic and a proof
//! cannot be mauled into a second accepting form.

use core::fmt;

use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use thiserror::Error;

const VRF_DOMAIN: &[u8] = b"ktd:vrf:map-label";

/// Length of a VRF output in bytes.
pub const OUTPUT_LEN: usize = 32;
/// Length of a VRF proof (an Ed25519 signature) in bytes.
pub const PROOF_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VrfError {
    #[error("proof must be {PROOF_LEN} bytes, got {0}")]
    ProofLength(usize),
    #[error("public key bytes do not form a valid verifying key")]
    BadPublicKey,
    #[error("proof does not verify for this input")]
    InvalidProof,
}

/// Private half of a VRF keypair.
#[derive(Clone)]
pub struct VrfPrivateKey {
    signing_key: SigningKey,
}

/// Public half of a VRF keypair.
#[derive(Clone, PartialEq, Eq)]
pub struct VrfPublicKey {
    verifying_key: VerifyingKey,
}

impl VrfPrivateKey {
    /// Derive a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> VrfPublicKey {
        VrfPublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Evaluate the VRF on `input`, returning the output and a proof.
    pub fn hash(&self, input: &[u8]) -> ([u8; OUTPUT_LEN], Vec<u8>) {
        let sig = self.signing_key.sign(&domain_message(input));
        (output_from_signature(&sig), sig.to_bytes().to_vec())
    }
}

impl VrfPublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, VrfError> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|_| VrfError::BadPublicKey)?;
        Ok(Self { verifying_key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Verify `proof` for `input`, returning the output it binds.
    pub fn verify(&self, input: &[u8], proof: &[u8]) -> Result<[u8; OUTPUT_LEN], VrfError> {
        let sig =
            Signature::from_slice(proof).map_err(|_| VrfError::ProofLength(proof.len()))?;
        self.verifying_key
            .verify_strict(&domain_message(input), &sig)
            .map_err(|_| VrfError::InvalidProof)?;
        Ok(output_from_signature(&sig))
    }
}

impl fmt::Debug for VrfPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

fn domain_message(input: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(VRF_DOMAIN.len() + input.len());
    msg.extend_from_slice(VRF_DOMAIN);
    msg.extend_from_slice(input);
    msg
}

fn output_from_signature(sig: &Signature) -> [u8; OUTPUT_LEN] {
    let sig_hash = Sha512::digest(sig.to_bytes());
    let mut hasher = Hasher::new();
    hasher.update(&sig_hash);
    *hasher.finalize().as_bytes()
}
