//! Crypto primitives for the relay path and the password gate.
//!
//! Relay-mode chunks are sealed with XChaCha20-Poly1305 under a per-peer key
//! agreed via X25519. The nonce is deterministic: `transfer-id || seq`
//! zero-padded to the 24-byte XNonce width, so both sides derive it from the
//! frame header without extra wire bytes.

#![allow(dead_code)]

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type SymmetricKey = [u8; 32];

pub const NONCE_SIZE: usize = 24;

/// PBKDF2 rounds for the room password hash
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KDF_CONTEXT_PEER_KEY: &[u8] = b"roomdrop peer relay key v1";

/// Crypto failures; deliberately opaque about the cause
#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    EncryptionFailed,
    DecryptionFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::EncryptionFailed => write!(f, "Encryption failed"),
            CryptoError::DecryptionFailed => write!(f, "Decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Nonce for one relay chunk: transfer id (16) || seq BE (4) || zeros (4).
pub fn transfer_nonce(transfer_id: &Uuid, seq: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..16].copy_from_slice(transfer_id.as_bytes());
    nonce[16..20].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// Seal a relay payload under the per-peer key.
pub fn seal(key: &SymmetricKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Open a relay payload. Fails on wrong key, wrong nonce, or tampering.
pub fn open(key: &SymmetricKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Derive the symmetric relay key from an X25519 shared secret,
/// with domain separation so the raw DH output never keys the cipher.
pub fn derive_peer_key(shared_secret: &[u8]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(KDF_CONTEXT_PEER_KEY);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Client-side room password hash: PBKDF2-HMAC-SHA-256 over the password,
/// salted by the normalized room code, hex-encoded. The server treats the
/// result as opaque.
pub fn derive_password_hash(password: &str, room_code: &str) -> String {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        room_code.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    );
    hex::encode(out)
}

/// Constant-time string equality for the admission gate.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    let a = a.as_bytes();
    let b = b.as_bytes();
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

/// SHA-256 digest of a full buffer.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Device fingerprint keying the trust store: hex SHA-256 over the metadata
/// triple. Identifies a device for the accept-prompt shortcut only; it is
/// not a cryptographic identity.
pub fn device_fingerprint(name: &str, device_type: &str, browser_info: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(device_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(browser_info.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> SymmetricKey {
        [byte; 32]
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key(7);
        let id = Uuid::new_v4();
        let nonce = transfer_nonce(&id, 3);

        let sealed = seal(&key, &nonce, b"chunk payload").unwrap();
        let opened = open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"chunk payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let id = Uuid::new_v4();
        let nonce = transfer_nonce(&id, 0);
        let sealed = seal(&test_key(1), &nonce, b"secret").unwrap();
        assert_eq!(open(&test_key(2), &nonce, &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_seq_fails() {
        let key = test_key(9);
        let id = Uuid::new_v4();
        let sealed = seal(&key, &transfer_nonce(&id, 5), b"data").unwrap();
        assert!(open(&key, &transfer_nonce(&id, 6), &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key(3);
        let id = Uuid::new_v4();
        let nonce = transfer_nonce(&id, 1);
        let mut sealed = seal(&key, &nonce, b"important").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_nonce_layout() {
        let id = Uuid::from_bytes([0xAB; 16]);
        let nonce = transfer_nonce(&id, 0x01020304);
        assert_eq!(&nonce[..16], &[0xAB; 16]);
        assert_eq!(&nonce[16..20], &[1, 2, 3, 4]);
        assert_eq!(&nonce[20..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_peer_key_derivation_deterministic() {
        let secret = b"dh-shared-secret";
        assert_eq!(derive_peer_key(secret), derive_peer_key(secret));
        assert_ne!(derive_peer_key(secret), derive_peer_key(b"other"));
    }

    #[test]
    fn test_password_hash_salted_by_room() {
        let a = derive_password_hash("hunter2", "ABCD");
        let b = derive_password_hash("hunter2", "EFGH");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, derive_password_hash("hunter2", "ABCD"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_known_sha256() {
        // "hello world"
        assert_eq!(
            hex::encode(sha256(b"hello world")),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_fingerprint_fields_not_ambiguous() {
        // separator keeps ("ab","c") distinct from ("a","bc")
        let a = device_fingerprint("ab", "c", "");
        let b = device_fingerprint("a", "bc", "");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
