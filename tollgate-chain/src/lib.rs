//! # Tollgate Chain
//!
//! The tamper-evident audit trail: every accepted toll event is sequenced
//! into an iterated-SHA256 VDF chain, and contiguous link ranges are
//! batch-anchored to an external ledger under a Merkle root with
//! retry/backoff.

pub mod anchor;
pub mod chain;
pub mod vdf;

pub use anchor::{
    ledger_from_policy, Anchor, AnchorQueue, AnchorStatus, HttpLedger, LedgerClient, MockLedger,
    NullLedger,
};
pub use chain::{ChainVerdict, TamperClass, VdfAppender, VdfChain, VdfLink};
pub use vdf::{compute, verify, VdfProof};
