//! Stateless authenticated session/download tokens (spec.md §4.6).
//!
//! A token carries its subject in cleartext ahead of the sealed payload so
//! a request can be routed to the right per-user key before anything is
//! decrypted, without leaking anything beyond which account it names.

use crate::error::{VaultError, VaultResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha1::{Digest, Sha1};

const SUBJECT_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Token {
    pub subject: i64,
    pub scope: String,
    pub issued_at: i64,
    pub expiration: i64,
    pub file: Option<String>,
    pub set: Option<i64>,
    pub thumb: Option<bool>,
}

impl Token {
    pub fn new(subject: i64, scope: impl Into<String>) -> Self {
        Token {
            subject,
            scope: scope.into(),
            issued_at: 0,
            expiration: 0,
            file: None,
            set: None,
            thumb: None,
        }
    }
}

pub struct TokenMint;

impl TokenMint {
    /// Seals `token` for `ttl_ms` starting at `now_ms`, returning the wire
    /// encoding: `subject(BE64) || nonce(12) || sealed_json || tag(16)`.
    pub fn mint(key: &[u8; 32], mut token: Token, now_ms: i64, ttl_ms: i64) -> VaultResult<Vec<u8>> {
        token.issued_at = now_ms;
        token.expiration = now_ms + ttl_ms;
        let plaintext = serde_json::to_vec(&token)?;

        let subject_bytes = token.subject.to_be_bytes();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &subject_bytes,
                },
            )
            .map_err(|_| VaultError::EncryptFailed("token seal failed".into()))?;

        let mut out = Vec::with_capacity(SUBJECT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&subject_bytes);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Recovers the subject from the wire encoding's cleartext prefix
    /// without touching the key, so callers can route to a per-user key.
    pub fn subject(wire: &[u8]) -> VaultResult<i64> {
        if wire.len() < SUBJECT_LEN {
            return Err(VaultError::ValidationFailed);
        }
        Ok(i64::from_be_bytes(wire[0..SUBJECT_LEN].try_into().unwrap()))
    }

    /// Opens and validates a token: AEAD integrity, subject match, and the
    /// issued/expiry window against `now_ms`.
    pub fn decrypt(key: &[u8; 32], wire: &[u8], now_ms: i64) -> VaultResult<Token> {
        if wire.len() < SUBJECT_LEN + NONCE_LEN + TAG_LEN {
            return Err(VaultError::ValidationFailed);
        }
        let subject_bytes = &wire[0..SUBJECT_LEN];
        let nonce_bytes = &wire[SUBJECT_LEN..SUBJECT_LEN + NONCE_LEN];
        let sealed = &wire[SUBJECT_LEN + NONCE_LEN..];

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: sealed,
                    aad: subject_bytes,
                },
            )
            .map_err(|_| VaultError::ValidationFailed)?;

        let token: Token = serde_json::from_slice(&plaintext).map_err(|_| VaultError::ValidationFailed)?;
        let subject = i64::from_be_bytes(subject_bytes.try_into().unwrap());
        if token.subject != subject {
            return Err(VaultError::ValidationFailed);
        }
        if now_ms < token.issued_at || now_ms > token.expiration {
            return Err(VaultError::ValidationFailed);
        }
        Ok(token)
    }

    /// `base64(SHA1(token))[0..27]` — used to populate `User.valid_tokens`
    /// so raw bearer tokens are never retained at rest.
    pub fn hash(wire: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(wire);
        let digest = hasher.finalize();
        let encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.chars().take(27).collect()
    }

    /// Deserializes the `file`/`set`/`thumb` scope fields generically for
    /// callers that model their own scope payload instead of reusing
    /// [`Token`]'s fixed fields.
    pub fn decrypt_as<T: DeserializeOwned>(key: &[u8; 32], wire: &[u8], now_ms: i64) -> VaultResult<T> {
        let token = Self::decrypt(key, wire, now_ms)?;
        Ok(serde_json::from_value(serde_json::to_value(token)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_decrypt_roundtrip() {
        let key = [5u8; 32];
        let token = Token::new(42, "session");
        let wire = TokenMint::mint(&key, token, 1_000, 60_000).unwrap();
        assert_eq!(TokenMint::subject(&wire).unwrap(), 42);
        let opened = TokenMint::decrypt(&key, &wire, 1_500).unwrap();
        assert_eq!(opened.subject, 42);
        assert_eq!(opened.scope, "session");
    }

    #[test]
    fn expired_token_fails() {
        let key = [5u8; 32];
        let token = Token::new(1, "download");
        let wire = TokenMint::mint(&key, token, 0, 1_000).unwrap();
        assert!(matches!(
            TokenMint::decrypt(&key, &wire, 5_000),
            Err(VaultError::ValidationFailed)
        ));
    }

    #[test]
    fn not_yet_valid_token_fails() {
        let key = [5u8; 32];
        let token = Token::new(1, "download");
        let wire = TokenMint::mint(&key, token, 10_000, 1_000).unwrap();
        assert!(matches!(
            TokenMint::decrypt(&key, &wire, 500),
            Err(VaultError::ValidationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let key = [5u8; 32];
        let other = [9u8; 32];
        let token = Token::new(1, "download");
        let wire = TokenMint::mint(&key, token, 0, 60_000).unwrap();
        assert!(matches!(
            TokenMint::decrypt(&other, &wire, 10),
            Err(VaultError::ValidationFailed)
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let key = [5u8; 32];
        let token = Token::new(1, "download");
        let mut wire = TokenMint::mint(&key, token, 0, 60_000).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(
            TokenMint::decrypt(&key, &wire, 10),
            Err(VaultError::ValidationFailed)
        ));
    }

    #[test]
    fn hash_is_stable_and_short() {
        let wire = b"some-token-bytes".to_vec();
        let a = TokenMint::hash(&wire);
        let b = TokenMint::hash(&wire);
        assert_eq!(a, b);
        assert_eq!(a.len(), 27);
    }
}
