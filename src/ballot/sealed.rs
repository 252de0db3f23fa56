use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::digest::Output;
use sha2::Sha256;

/// Bytes in an XChaCha20-Poly1305 nonce.
pub const NONCE_LENGTH: usize = 24;

/// Algorithm tag recorded on every sealed ballot, so stored ciphertext
/// remains interpretable if the algorithm ever changes.
pub const ALGORITHM: &str = "xchacha20-poly1305";

/// An encrypted, integrity-protected ballot as handed to the durable
/// sink. The ciphertext carries the AEAD authentication tag; the
/// integrity hash is a separate SHA-256 over the plaintext for tally-
/// time tamper checks that do not need decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBallot {
    pub ballot_id: String,
    pub identity: String,
    pub election_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LENGTH],
    pub integrity_hash: Output<Sha256>,
    pub algorithm: String,
    pub cast_at: DateTime<Utc>,
}
