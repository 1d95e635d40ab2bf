//! Deterministic text embedder for knowledge retrieval.
//!
//! Feature hashing: each normalized word token is hashed (SHA-256) into one
//! of 256 buckets with a signed contribution, and the resulting vector is
//! L2-normalized. The embedding is stable across processes and platforms,
//! which keeps retrieval reproducible in tests; externally-computed vectors
//! of the same dimension can replace it without schema changes.

use sha2::{Digest, Sha256};

/// Dimension of every embedding produced by [`embed_text`].
pub const EMBEDDING_DIM: usize = 256;

/// Embed a text into a unit-length `EMBEDDING_DIM` vector.
///
/// Returns the zero vector for text with no word tokens; callers treat a
/// zero vector as "no signal" (cosine against it is undefined and the
/// retrieval query skips it).
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];

    for token in tokens(text) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = usize::from(digest[0]) % EMBEDDING_DIM;
        // Second digest byte decides the sign so collisions partially cancel
        // instead of compounding.
        let sign = if digest[1] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Lowercased alphanumeric word tokens, two characters or longer.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_lowercase)
}
