#![forbid(unsafe_code)]

//! Key-transparency directory core.
//!
//! Binds uids to versioned public keys inside a VRF-labeled authenticated
//! map, publishes signed epoch digests over it, and gives clients and
//! third-party auditors the proofs needed to hold the server accountable:
//! membership and non-membership proofs per version, hiding history proofs
//! per uid, and irrefutable [`Evid`] whenever two signed digests for one
//! epoch disagree.
//!
//! The map and VRF engines live in their own crates (`ktd-merkle`,
//! `ktd-vrf`); this crate holds the wire codec, the server core, the client
//! verifier, the auditor replica, and the batching work queue.

pub mod auditor;
pub mod client;
pub mod codec;
pub mod evidence;
pub mod server;
pub mod types;
pub mod workq;

pub use auditor::{sync_auditor, AdtrEpochInfo, Auditor, AuditorError};
pub use client::{get_hist, Client, ClientError, HistEntry};
pub use evidence::{Evid, EvidError};
pub use server::{GetReply, PutReq, Server, ServerError};
pub use types::{CommitOpen, Memb, MembHide, NonMemb, SigDig, UpdateProof};
pub use workq::{run_batcher, serve_one_batch, WorkQ};
