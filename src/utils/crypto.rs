// src/utils/crypto.rs

//! Submission encryption: PBKDF2-SHA256 key derivation and AES-256-GCM.
//!
//! Envelope layout: `base64(salt[16] ‖ nonce[12] ‖ ciphertext+tag)`.
//! The reference server opens envelopes with the same routines.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use serde::{Serialize, de::DeserializeOwned};
use sha2::Sha256;

use crate::{
    config::ENCRYPTION_ITERATIONS,
    error::AppError,
    models::submission::{
        PAYLOAD_VERSION, SubmissionEnvelope, SubmissionPayload, SubmittedAnswer,
    },
    utils::hash::{checksum, verify_checksum},
};

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 12;
pub const SALT_LENGTH: usize = 16;
const TAG_LENGTH: usize = 16;

/// Composite secret: candidate identity, exam identity and submission time.
pub fn derive_encryption_password(username: &str, exam_id: i64, timestamp: &str) -> String {
    format!("{}:{}:{}", username, exam_id, timestamp)
}

/// Fresh per-attempt salt, base64-encoded. Issued by the server at attempt start.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    STANDARD.encode(salt)
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionCrypto {
    iterations: u32,
}

impl Default for SubmissionCrypto {
    fn default() -> Self {
        Self::new(ENCRYPTION_ITERATIONS)
    }
}

impl SubmissionCrypto {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn derive_key(&self, password: &str, salt: &[u8]) -> [u8; KEY_LENGTH] {
        let mut key = [0u8; KEY_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key);
        key
    }

    /// Serializes `data` to JSON and seals it under a key derived from
    /// `password` and the base64 `salt`.
    pub fn encrypt_data<T: Serialize>(
        &self,
        data: &T,
        password: &str,
        salt: &str,
    ) -> Result<String, AppError> {
        let plaintext = serde_json::to_vec(data)
            .map_err(|e| AppError::Encryption(format!("payload serialization: {}", e)))?;

        let salt = STANDARD
            .decode(salt)
            .map_err(|e| AppError::Encryption(format!("invalid salt: {}", e)))?;
        if salt.len() != SALT_LENGTH {
            return Err(AppError::Encryption(format!(
                "salt must be {} bytes, got {}",
                SALT_LENGTH,
                salt.len()
            )));
        }

        let key = self.derive_key(password, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| AppError::Encryption("Failed to encrypt data".to_string()))?;

        let mut combined = Vec::with_capacity(SALT_LENGTH + IV_LENGTH + ciphertext.len());
        combined.extend_from_slice(&salt);
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(combined))
    }

    /// Opens an envelope. Any corruption surfaces as `AppError::Decryption`;
    /// no partial plaintext is ever returned.
    pub fn decrypt_data<T: DeserializeOwned>(
        &self,
        encrypted: &str,
        password: &str,
    ) -> Result<T, AppError> {
        let combined = STANDARD
            .decode(encrypted)
            .map_err(|e| AppError::Decryption(format!("invalid base64: {}", e)))?;

        if combined.len() < SALT_LENGTH + IV_LENGTH + TAG_LENGTH {
            return Err(AppError::Decryption("envelope too short".to_string()));
        }

        let (salt, rest) = combined.split_at(SALT_LENGTH);
        let (nonce, ciphertext) = rest.split_at(IV_LENGTH);

        let key = self.derive_key(password, salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                AppError::Decryption("authentication tag verification failed".to_string())
            })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Decryption(format!("payload is not valid JSON: {}", e)))
    }

    /// Builds the submission envelope for a finished attempt.
    pub fn seal_answers(
        &self,
        answers: Vec<SubmittedAnswer>,
        username: &str,
        exam_id: i64,
        salt: &str,
    ) -> Result<SubmissionEnvelope, AppError> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let password = derive_encryption_password(username, exam_id, &timestamp);

        let payload = SubmissionPayload {
            answers,
            username: username.to_string(),
            exam_id,
            timestamp: timestamp.clone(),
            version: PAYLOAD_VERSION.to_string(),
        };

        let encrypted_answers = self.encrypt_data(&payload, &password, salt)?;
        let encryption_checksum = checksum(&encrypted_answers);

        Ok(SubmissionEnvelope {
            encrypted_answers,
            encryption_timestamp: timestamp,
            encryption_checksum,
        })
    }

    /// Verifies and opens a submission envelope, checking that the sealed
    /// metadata matches the expected candidate and exam.
    pub fn open_answers(
        &self,
        envelope: &SubmissionEnvelope,
        username: &str,
        exam_id: i64,
    ) -> Result<Vec<SubmittedAnswer>, AppError> {
        if !verify_checksum(&envelope.encrypted_answers, &envelope.encryption_checksum) {
            return Err(AppError::Decryption("checksum mismatch".to_string()));
        }

        let password =
            derive_encryption_password(username, exam_id, &envelope.encryption_timestamp);
        let payload: SubmissionPayload =
            self.decrypt_data(&envelope.encrypted_answers, &password)?;

        if payload.username != username
            || payload.exam_id != exam_id
            || payload.timestamp != envelope.encryption_timestamp
        {
            return Err(AppError::Decryption(
                "Decrypted data does not match expected metadata".to_string(),
            ));
        }

        Ok(payload.answers)
    }

    /// `seal_answers` on the blocking pool; key derivation is CPU-bound.
    pub async fn seal_answers_async(
        self,
        answers: Vec<SubmittedAnswer>,
        username: String,
        exam_id: i64,
        salt: String,
    ) -> Result<SubmissionEnvelope, AppError> {
        tokio::task::spawn_blocking(move || self.seal_answers(answers, &username, exam_id, &salt))
            .await
            .map_err(|e| AppError::Encryption(format!("encryption task failed: {}", e)))?
    }

    pub async fn open_answers_async(
        self,
        envelope: SubmissionEnvelope,
        username: String,
        exam_id: i64,
    ) -> Result<Vec<SubmittedAnswer>, AppError> {
        tokio::task::spawn_blocking(move || self.open_answers(&envelope, &username, exam_id))
            .await
            .map_err(|e| AppError::Decryption(format!("decryption task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::answer::AnswerPayload;

    const FAST: u32 = 1_000;

    fn answers() -> Vec<SubmittedAnswer> {
        vec![SubmittedAnswer {
            question_id: 7,
            answer: Some(AnswerPayload::choice("D")),
            is_flagged: false,
            time_spent_seconds: 45,
            sequence: 2,
        }]
    }

    #[test]
    fn test_password_composition() {
        assert_eq!(
            derive_encryption_password("alice", 12, "2026-01-05T10:00:00.000Z"),
            "alice:12:2026-01-05T10:00:00.000Z"
        );
    }

    #[test]
    fn test_salt_is_sixteen_random_bytes() {
        let salt = generate_salt();
        assert_eq!(STANDARD.decode(&salt).unwrap().len(), SALT_LENGTH);
        assert_ne!(salt, generate_salt());
    }

    #[test]
    fn test_seal_and_open() {
        let crypto = SubmissionCrypto::new(FAST);
        let salt = generate_salt();
        let envelope = crypto.seal_answers(answers(), "alice", 12, &salt).unwrap();

        let raw = STANDARD.decode(&envelope.encrypted_answers).unwrap();
        assert_eq!(&raw[..SALT_LENGTH], STANDARD.decode(&salt).unwrap().as_slice());
        assert_eq!(envelope.encryption_checksum.len(), 44);

        let opened = crypto.open_answers(&envelope, "alice", 12).unwrap();
        assert_eq!(opened, answers());
    }

    #[test]
    fn test_same_input_encrypts_differently() {
        let crypto = SubmissionCrypto::new(FAST);
        let salt = generate_salt();
        let a = crypto.encrypt_data(&answers(), "pw", &salt).unwrap();
        let b = crypto.encrypt_data(&answers(), "pw", &salt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_envelope_is_rejected() {
        let crypto = SubmissionCrypto::new(FAST);
        let envelope = crypto
            .seal_answers(answers(), "alice", 12, &generate_salt())
            .unwrap();

        let mut raw = STANDARD.decode(&envelope.encrypted_answers).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = STANDARD.encode(raw);

        // Checksum catches it first.
        let bad_checksum = SubmissionEnvelope {
            encrypted_answers: tampered.clone(),
            ..envelope.clone()
        };
        assert!(matches!(
            crypto.open_answers(&bad_checksum, "alice", 12),
            Err(AppError::Decryption(_))
        ));

        // With a matching checksum the authentication tag still fails.
        let password =
            derive_encryption_password("alice", 12, &envelope.encryption_timestamp);
        assert!(matches!(
            crypto.decrypt_data::<SubmissionPayload>(&tampered, &password),
            Err(AppError::Decryption(_))
        ));
    }

    #[test]
    fn test_wrong_identity_cannot_open() {
        let crypto = SubmissionCrypto::new(FAST);
        let envelope = crypto
            .seal_answers(answers(), "alice", 12, &generate_salt())
            .unwrap();

        assert!(crypto.open_answers(&envelope, "mallory", 12).is_err());
        assert!(crypto.open_answers(&envelope, "alice", 13).is_err());
    }

    #[test]
    fn test_short_or_garbage_input() {
        let crypto = SubmissionCrypto::new(FAST);
        assert!(matches!(
            crypto.decrypt_data::<SubmissionPayload>("AAAA", "pw"),
            Err(AppError::Decryption(_))
        ));
        assert!(matches!(
            crypto.decrypt_data::<SubmissionPayload>("not base64!", "pw"),
            Err(AppError::Decryption(_))
        ));
        assert!(matches!(
            crypto.encrypt_data(&answers(), "pw", "c2hvcnQ="),
            Err(AppError::Encryption(_))
        ));
    }
}
