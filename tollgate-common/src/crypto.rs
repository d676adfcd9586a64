//! Cryptographic utilities and hash operations

use crate::{
    error::{TollError, TollResult},
    types::{sizes, Hash, HashExt, Seq},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hash size in bytes (SHA-256)
pub const HASH_SIZE: usize = sizes::HASH_SIZE;
/// Per-reader secret size in bytes
pub const SECRET_SIZE: usize = sizes::SECRET_SIZE;

/// Central cryptographic utilities
pub struct CryptoUtils;

impl CryptoUtils {
    /// Compute SHA-256 hash of data
    pub fn hash(data: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        result.into()
    }

    /// Compute hash of multiple data chunks
    pub fn hash_multiple(chunks: &[&[u8]]) -> Hash {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let result = hasher.finalize();
        result.into()
    }

    /// Compute HMAC-SHA256 over a message with a reader secret
    pub fn hmac_sign(secret: &[u8], message: &[u8]) -> Hash {
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(message);
        let out = mac.finalize().into_bytes();
        out.into()
    }

    /// Verify an HMAC-SHA256 signature in constant time
    pub fn hmac_verify(secret: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(message);
        mac.verify_slice(signature).is_ok()
    }

    /// Constant-time equality over byte strings of possibly differing length.
    ///
    /// Both sides are hashed first so the comparison length is fixed and the
    /// running time does not depend on where the inputs diverge.
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        let ha = Self::hash(a);
        let hb = Self::hash(b);
        let mut diff = 0u8;
        for (x, y) in ha.iter().zip(hb.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }

    /// Generate a random reader nonce (hex string)
    pub fn generate_nonce() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; sizes::NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Generate a random event id (hex string)
    pub fn generate_event_id() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; sizes::EVENT_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Generate a fresh per-reader secret
    pub fn generate_secret() -> Vec<u8> {
        use rand::RngCore;
        let mut bytes = vec![0u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// Convert hex string to hash
    pub fn hex_to_hash(hex_str: &str) -> TollResult<Hash> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(TollError::validation(format!(
                "Invalid hash length: expected {}, got {}",
                HASH_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| TollError::validation(format!("Invalid hex: {}", e)))?;

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    }

    /// Convert hash to hex string
    pub fn hash_to_hex(hash: &Hash) -> String {
        hex::encode(hash)
    }
}

/// Merkle tree over `(seq, vdf_output)` pairs, used for anchor roots
pub struct MerkleTree {
    leaves: Vec<Hash>,
    nodes: Vec<Hash>,
}

impl MerkleTree {
    /// Hash one `(seq, output)` pair into a leaf
    pub fn leaf(seq: Seq, output: &Hash) -> Hash {
        CryptoUtils::hash_multiple(&[&seq.to_be_bytes(), output])
    }

    /// Build merkle tree from leaf hashes
    pub fn new(leaves: Vec<Hash>) -> Self {
        if leaves.is_empty() {
            return Self {
                leaves: vec![HashExt::zero()],
                nodes: vec![HashExt::zero()],
            };
        }

        let mut nodes = leaves.clone();
        let mut current_level = leaves.len();

        // Build tree bottom-up
        while current_level > 1 {
            let mut next_level = Vec::new();

            for i in (0..current_level).step_by(2) {
                let start = nodes.len() - current_level;
                let left = nodes[start + i];
                let right = if i + 1 < current_level {
                    nodes[start + i + 1]
                } else {
                    left // Duplicate if odd number
                };

                let parent = CryptoUtils::hash_multiple(&[&left, &right]);
                next_level.push(parent);
            }

            current_level = next_level.len();
            nodes.extend_from_slice(&next_level);
        }

        Self { leaves, nodes }
    }

    /// Build directly from `(seq, vdf_output)` pairs
    pub fn from_links(pairs: &[(Seq, Hash)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(seq, out)| Self::leaf(*seq, out))
                .collect(),
        )
    }

    /// Get root hash
    pub fn root(&self) -> Hash {
        self.nodes.last().copied().unwrap_or_else(HashExt::zero)
    }

    /// Generate merkle proof for leaf at index
    pub fn proof(&self, index: usize) -> Option<Vec<Hash>> {
        if index >= self.leaves.len() {
            return None;
        }

        let mut proof = Vec::new();
        let mut current_index = index;
        let mut level_size = self.leaves.len();
        let mut level_start = 0;

        while level_size > 1 {
            let sibling_index = if current_index % 2 == 0 {
                current_index + 1
            } else {
                current_index - 1
            };

            if sibling_index < level_size {
                proof.push(self.nodes[level_start + sibling_index]);
            } else {
                // Odd leaf duplicated; sibling is the leaf itself
                proof.push(self.nodes[level_start + current_index]);
            }

            level_start += level_size;
            current_index /= 2;
            level_size = (level_size + 1) / 2;
        }

        Some(proof)
    }

    /// Verify merkle proof
    pub fn verify_proof(leaf: &Hash, proof: &[Hash], root: &Hash, index: usize) -> bool {
        let mut current_hash = *leaf;
        let mut current_index = index;

        for sibling in proof {
            current_hash = if current_index % 2 == 0 {
                CryptoUtils::hash_multiple(&[&current_hash, sibling])
            } else {
                CryptoUtils::hash_multiple(&[sibling, &current_hash])
            };
            current_index /= 2;
        }

        current_hash == *root
    }
}
