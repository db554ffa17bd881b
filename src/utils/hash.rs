// src/utils/hash.rs

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

/// SHA-256 checksum of an encoded envelope, base64-encoded.
pub fn checksum(data: &str) -> String {
    STANDARD.encode(Sha256::digest(data.as_bytes()))
}

/// Compares an envelope against the checksum sent alongside it.
pub fn verify_checksum(data: &str, expected: &str) -> bool {
    checksum(data) == expected
}
