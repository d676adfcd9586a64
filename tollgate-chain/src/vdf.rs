//! Iterated-hash verifiable delay function.
//!
//! `VDF(x, d) = SHA256^d(x)`. Computation is strictly sequential; the
//! proof stores intermediate checkpoints sampled every `d / granularity`
//! iterations so a verifier can recompute fixed-size segments
//! independently of chain length.

use sha2::{Digest, Sha256};
use tollgate_common::types::Hash;

/// Output plus proof checkpoints for one VDF evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct VdfProof {
    pub output: Hash,
    pub checkpoints: Vec<Hash>,
}

fn step(current: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(current);
    hasher.finalize().into()
}

/// Segment length for a given difficulty and checkpoint granularity.
fn segment_len(difficulty: u64, granularity: u64) -> u64 {
    (difficulty / granularity.max(1)).max(1)
}

/// Evaluate the VDF sequentially, emitting a checkpoint at the end of
/// each segment. The final checkpoint equals the output.
pub fn compute(input: &Hash, difficulty: u64, granularity: u64) -> VdfProof {
    let segment = segment_len(difficulty, granularity);
    let mut current = *input;
    let mut checkpoints = Vec::new();
    let mut done = 0u64;

    while done < difficulty {
        let steps = segment.min(difficulty - done);
        for _ in 0..steps {
            current = step(&current);
        }
        done += steps;
        checkpoints.push(current);
    }

    VdfProof {
        output: current,
        checkpoints,
    }
}

/// Verify an output against its checkpoints.
///
/// Each checkpoint-to-checkpoint segment has a fixed iteration count
/// derived from `(difficulty, granularity)`, so every segment is checked
/// from its predecessor and the last checkpoint must equal the output.
pub fn verify(
    input: &Hash,
    difficulty: u64,
    granularity: u64,
    output: &Hash,
    checkpoints: &[Hash],
) -> bool {
    let segment = segment_len(difficulty, granularity);

    // Expected segment layout must match exactly
    let full_segments = difficulty / segment;
    let remainder = difficulty % segment;
    let expected_count = (full_segments + if remainder > 0 { 1 } else { 0 }) as usize;
    if checkpoints.len() != expected_count {
        return false;
    }

    let mut prev = *input;
    let mut done = 0u64;
    for checkpoint in checkpoints {
        let steps = segment.min(difficulty - done);
        let mut current = prev;
        for _ in 0..steps {
            current = step(&current);
        }
        if current != *checkpoint {
            return false;
        }
        done += steps;
        prev = *checkpoint;
    }

    done == difficulty && checkpoints.last() == Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_common::crypto::CryptoUtils;

    #[test]
    fn test_compute_verify_roundtrip() {
        let input = CryptoUtils::hash(b"vdf input");
        let proof = compute(&input, 1000, 10);

        assert_eq!(proof.checkpoints.len(), 10);
        assert!(verify(&input, 1000, 10, &proof.output, &proof.checkpoints));
    }

    #[test]
    fn test_tampered_checkpoint_fails() {
        let input = CryptoUtils::hash(b"vdf input");
        let proof = compute(&input, 1000, 10);

        let mut tampered = proof.checkpoints.clone();
        tampered[3][0] ^= 0x01;
        assert!(!verify(&input, 1000, 10, &proof.output, &tampered));
    }

    #[test]
    fn test_tampered_output_fails() {
        let input = CryptoUtils::hash(b"vdf input");
        let proof = compute(&input, 1000, 10);

        let mut bad_output = proof.output;
        bad_output[0] ^= 0x01;
        assert!(!verify(&input, 1000, 10, &bad_output, &proof.checkpoints));
    }

    #[test]
    fn test_difficulty_one_is_single_hash() {
        let input = CryptoUtils::hash(b"x");
        let proof = compute(&input, 1, 10);

        assert_eq!(proof.output, CryptoUtils::hash(&input));
        assert_eq!(proof.checkpoints, vec![proof.output]);
        assert!(verify(&input, 1, 10, &proof.output, &proof.checkpoints));
    }

    #[test]
    fn test_uneven_segments() {
        // 103 iterations at granularity 10: ten segments of 10 + one of 3
        let input = CryptoUtils::hash(b"uneven");
        let proof = compute(&input, 103, 10);
        assert_eq!(proof.checkpoints.len(), 11);
        assert!(verify(&input, 103, 10, &proof.output, &proof.checkpoints));
    }

    #[test]
    fn test_wrong_checkpoint_count_fails() {
        let input = CryptoUtils::hash(b"count");
        let proof = compute(&input, 100, 10);

        let mut truncated = proof.checkpoints.clone();
        truncated.pop();
        assert!(!verify(&input, 100, 10, &proof.output, &truncated));
    }

    #[test]
    fn test_computation_is_deterministic() {
        let input = CryptoUtils::hash(b"det");
        assert_eq!(compute(&input, 500, 10), compute(&input, 500, 10));
    }
}
