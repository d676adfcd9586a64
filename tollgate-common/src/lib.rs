//! # Tollgate Common
//!
//! Common utilities, traits, and standardized patterns for the Tollgate
//! toll-processing backend. This crate is the single source of truth for
//! shared functionality across the workspace, preventing code duplication
//! and circular dependencies.
//!
//! ## Modules
//!
//! - **crypto**: SHA-256 / HMAC-SHA256 primitives, nonces, Merkle trees
//! - **database**: RocksDB wrapper with prefix-keyed typed operations
//! - **error**: Standardized error types and ingest rejection codes
//! - **serialization**: Encoding/decoding patterns for stored records
//! - **types**: Common type definitions and constants
//! - **validation**: Input validation for wire-facing fields

pub mod crypto;
pub mod database;
pub mod error;
pub mod serialization;
pub mod types;
pub mod validation;

/// Re-export commonly used types and traits
pub mod prelude {
    pub use crate::crypto::{CryptoUtils, MerkleTree, HASH_SIZE, SECRET_SIZE};
    pub use crate::database::{StoreOps, TollDatabase};
    pub use crate::error::{RejectCode, TollError, TollResult};
    pub use crate::serialization::{EncodingType, TollSerialize};
    pub use crate::types::{EventId, Hash, HashExt, ReaderId, Seq, TagHash, Timestamp};
    pub use crate::validation::ValidationUtils;

    // Re-export essential external crates
    pub use anyhow::Result;
    pub use serde::{Deserialize, Serialize};
}

/// Tollgate Common crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version for reader firmware compatibility
pub const PROTOCOL_VERSION: u32 = 1;
