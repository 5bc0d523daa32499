//! Master-key-derived encryption hierarchy: creation, passphrase-wrapped
//! persistence, per-object subkey derivation, authenticated key wrapping,
//! and in-memory key masking (spec.md §4.1).

use crate::error::{VaultError, VaultResult};
use crate::stream::{StreamReader, StreamWriter};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key as AesKey, Nonce as AesNonce,
};
use hmac::{Hmac, Mac};
use log::warn;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zeroize::Zeroize;

pub const MASTER_KEY_LEN: usize = 64;
pub const SUBKEY_LEN: usize = 64;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// 1-byte version + 12-byte nonce + 64-byte sealed subkey + 16-byte tag.
pub const WRAPPED_KEY_LEN: usize = 1 + NONCE_LEN + SUBKEY_LEN + TAG_LEN;

const ENVELOPE_VERSION: u8 = 1;
const MASTER_FILE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const PBKDF2_ITERS_DEFAULT: u32 = 200_000;
const PBKDF2_ITERS_EMPTY: u32 = 10;

/// A 64-byte key material split into an AEAD half and an HMAC half, the
/// same layout used for the master key and for every per-object SubKey.
fn split(key: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut aead = [0u8; 32];
    let mut mac = [0u8; 32];
    aead.copy_from_slice(&key[0..32]);
    mac.copy_from_slice(&key[32..64]);
    (aead, mac)
}

fn aes_gcm_seal(key: &[u8; 32], plaintext: &[u8]) -> VaultResult<(Vec<u8>, [u8; NONCE_LEN])> {
    aes_gcm_seal_aad(key, plaintext, &[])
}

fn aes_gcm_seal_aad(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> VaultResult<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = AesNonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::EncryptFailed("aes-gcm seal failed".into()))?;
    Ok((sealed, nonce_bytes))
}

fn aes_gcm_open(key: &[u8; 32], nonce_bytes: &[u8], ct_and_tag: &[u8]) -> VaultResult<Vec<u8>> {
    aes_gcm_open_aad(key, nonce_bytes, ct_and_tag, &[])
}

fn aes_gcm_open_aad(
    key: &[u8; 32],
    nonce_bytes: &[u8],
    ct_and_tag: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    if nonce_bytes.len() != NONCE_LEN {
        return Err(VaultError::DecryptFailed);
    }
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = AesNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ct_and_tag,
                aad,
            },
        )
        .map_err(|_| VaultError::DecryptFailed)
}

/// A 64-byte secret derived per object (blob, token namespace, session).
/// Held unmasked in memory for the lifetime of the struct — callers that
/// need long-lived storage should mask it the same way `MasterKey` does.
#[derive(Clone)]
pub struct SubKey {
    bytes: [u8; SUBKEY_LEN],
}

impl SubKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SUBKEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SubKey { bytes }
    }

    pub fn from_bytes(bytes: [u8; SUBKEY_LEN]) -> Self {
        SubKey { bytes }
    }

    pub fn aead_key(&self) -> [u8; 32] {
        split(&self.bytes).0
    }

    pub fn hmac_key(&self) -> [u8; 32] {
        split(&self.bytes).1
    }

    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for SubKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// 93-byte authenticated envelope over a [`SubKey`]. Tamper in any byte
/// makes unwrapping fail with `DecryptFailed`; never partially trusted.
#[derive(Clone)]
pub struct WrappedKey {
    bytes: [u8; WRAPPED_KEY_LEN],
}

impl WrappedKey {
    pub fn from_bytes(bytes: [u8; WRAPPED_KEY_LEN]) -> Self {
        WrappedKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; WRAPPED_KEY_LEN] {
        &self.bytes
    }
}

/// Master key: 64 random bytes, held on the heap only in masked form.
/// The plaintext key exists on the stack solely for the duration of a
/// `use_key` closure and is zeroed the instant the closure returns.
pub struct MasterKey {
    masked: [u8; MASTER_KEY_LEN],
    mask: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut real = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut real);
        Self::from_plaintext(real)
    }

    fn from_plaintext(mut real: [u8; MASTER_KEY_LEN]) -> Self {
        let mut mask = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut mask);
        let mut masked = [0u8; MASTER_KEY_LEN];
        for i in 0..MASTER_KEY_LEN {
            masked[i] = real[i] ^ mask[i];
        }
        real.zeroize();
        MasterKey { masked, mask }
    }

    /// Runs `f` with the unmasked key on the stack; the stack copy is
    /// zeroed before this returns regardless of how `f` exits.
    pub fn use_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; MASTER_KEY_LEN]) -> R,
    {
        let mut real = [0u8; MASTER_KEY_LEN];
        for i in 0..MASTER_KEY_LEN {
            real[i] = self.masked[i] ^ self.mask[i];
        }
        let out = f(&real);
        real.zeroize();
        out
    }

    fn halves(&self) -> ([u8; 32], [u8; 32]) {
        self.use_key(|k| split(k))
    }

    pub fn wipe(&mut self) {
        self.masked.zeroize();
        self.mask.zeroize();
    }

    /// `HMAC-SHA256(HMAC_KEY, b)` — used to deterministically hash
    /// logical paths for on-disk storage (spec.md §4.3).
    pub fn hash(&self, b: &[u8]) -> [u8; 32] {
        let (_, hmac_key) = self.halves();
        let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key).expect("hmac key length valid");
        mac.update(b);
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }

    /// `ver(1) || nonce(12) || ct || tag(16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let (aead_key, _) = self.halves();
        let (sealed, nonce) = aes_gcm_seal(&aead_key, plaintext)?;
        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, framed: &[u8]) -> VaultResult<Vec<u8>> {
        self.decrypt_aad(framed, &[])
    }

    /// Like [`encrypt`](Self::encrypt) but binds `aad` into the tag —
    /// used to tie a stored logical file's ciphertext to its path so it
    /// cannot be silently swapped with another file's ciphertext.
    pub fn encrypt_aad(&self, plaintext: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
        let (aead_key, _) = self.halves();
        let (sealed, nonce) = aes_gcm_seal_aad(&aead_key, plaintext, aad)?;
        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt_aad(&self, framed: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
        if framed.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptFailed);
        }
        if framed[0] != ENVELOPE_VERSION {
            return Err(VaultError::DecryptFailed);
        }
        let nonce = &framed[1..1 + NONCE_LEN];
        let ct_and_tag = &framed[1 + NONCE_LEN..];
        let (aead_key, _) = self.halves();
        aes_gcm_open_aad(&aead_key, nonce, ct_and_tag, aad)
    }

    /// Generates a fresh [`SubKey`] and its [`WrappedKey`] (an `encrypt`
    /// of the 64 raw bytes — the envelope format and the wrapped-key
    /// format coincide bit-for-bit for a 64-byte plaintext).
    pub fn new_key(&self) -> VaultResult<(SubKey, WrappedKey)> {
        let sub = SubKey::generate();
        let wrapped = self.wrap(&sub)?;
        Ok((sub, wrapped))
    }

    pub fn wrap(&self, sub: &SubKey) -> VaultResult<WrappedKey> {
        let framed = self.encrypt(&sub.bytes)?;
        let mut bytes = [0u8; WRAPPED_KEY_LEN];
        if framed.len() != WRAPPED_KEY_LEN {
            return Err(VaultError::Internal("wrapped key size mismatch".into()));
        }
        bytes.copy_from_slice(&framed);
        Ok(WrappedKey { bytes })
    }

    pub fn unwrap(&self, wrapped: &WrappedKey) -> VaultResult<SubKey> {
        let plaintext = self.decrypt(&wrapped.bytes)?;
        if plaintext.len() != SUBKEY_LEN {
            return Err(VaultError::DecryptFailed);
        }
        let mut bytes = [0u8; SUBKEY_LEN];
        bytes.copy_from_slice(&plaintext);
        Ok(SubKey::from_bytes(bytes))
    }

    /// Reads exactly [`WRAPPED_KEY_LEN`] bytes at the reader's current
    /// position, validates, and returns the unwrapped SubKey.
    pub fn read_encrypted_key<R: Read>(&self, r: &mut R) -> VaultResult<SubKey> {
        let mut buf = [0u8; WRAPPED_KEY_LEN];
        r.read_exact(&mut buf)?;
        self.unwrap(&WrappedKey::from_bytes(buf))
    }

    pub fn write_encrypted_key<W: Write>(&self, w: &mut W, sub: &SubKey) -> VaultResult<()> {
        let wrapped = self.wrap(sub)?;
        w.write_all(wrapped.as_bytes())?;
        Ok(())
    }

    /// Returns a stream reader keyed on `sub`'s AEAD half, with `context`
    /// mixed into every chunk's AAD (spec.md §4.2). Callers pass
    /// `SHA1(logical_path)` as context for blob files.
    pub fn start_reader<R: Read + Seek>(
        sub: &SubKey,
        context: Vec<u8>,
        r: R,
        chunk_size: usize,
    ) -> StreamReader<R> {
        StreamReader::new(r, sub.aead_key(), context, chunk_size)
    }

    pub fn start_writer<W: Write>(sub: &SubKey, context: Vec<u8>, w: W, chunk_size: usize) -> StreamWriter<W> {
        StreamWriter::new(w, sub.aead_key(), context, chunk_size)
    }

    /// Persists the master key, encrypted with a PBKDF2-derived KEK.
    /// On-disk layout: `ver(1) || salt(16) || iter(BE32) || nonce(12) ||
    /// ct || tag(16)`.
    pub fn save(&self, passphrase: &str, path: &Path) -> VaultResult<()> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let iterations = if passphrase.is_empty() {
            warn!("saving master key with an empty passphrase; this is only safe for test fixtures");
            PBKDF2_ITERS_EMPTY
        } else {
            PBKDF2_ITERS_DEFAULT
        };

        let mut kek = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, iterations, &mut kek);

        let (sealed, nonce) = self.use_key(|real| aes_gcm_seal(&kek, real))?;
        kek.zeroize();

        let mut out = Vec::with_capacity(1 + SALT_LEN + 4 + NONCE_LEN + sealed.len());
        out.push(MASTER_FILE_VERSION);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iterations.to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);

        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&out)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads and decrypts a master key saved with [`MasterKey::save`].
    pub fn load(passphrase: &str, path: &Path) -> VaultResult<Self> {
        let data = fs::read(path)?;
        let min_len = 1 + SALT_LEN + 4 + NONCE_LEN + TAG_LEN;
        if data.len() < min_len {
            return Err(VaultError::DecryptFailed);
        }
        if data[0] != MASTER_FILE_VERSION {
            return Err(VaultError::DecryptFailed);
        }
        let mut pos = 1;
        let salt = &data[pos..pos + SALT_LEN];
        pos += SALT_LEN;
        let iterations = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let nonce = &data[pos..pos + NONCE_LEN];
        pos += NONCE_LEN;
        let ct_and_tag = &data[pos..];

        let mut kek = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut kek);

        let plaintext = aes_gcm_open(&kek, nonce, ct_and_tag);
        kek.zeroize();
        let mut plaintext = plaintext?;
        if plaintext.len() != MASTER_KEY_LEN {
            plaintext.zeroize();
            return Err(VaultError::DecryptFailed);
        }
        let mut real = [0u8; MASTER_KEY_LEN];
        real.copy_from_slice(&plaintext);
        plaintext.zeroize();
        Ok(MasterKey::from_plaintext(real))
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Seals bytes to a recipient's X25519 public key using an anonymous
/// sender box (crypto_box's sealed-box construction), as used for the
/// per-blob Header sealed to an album's public key (spec.md §4.2).
pub mod sealed_box {
    use super::*;
    use crypto_box::aead::{AeadCore, OsRng as CbOsRng};
    use crypto_box::{PublicKey, SalsaBox, SecretKey};

    pub fn generate_keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::generate(&mut CbOsRng);
        let public = secret.public_key();
        (secret, public)
    }

    /// Encrypts `plaintext` to `recipient` using a fresh ephemeral keypair
    /// whose public half is prepended to the ciphertext, so the recipient
    /// needs no prior knowledge of the sender (an anonymous sender box).
    pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let (eph_secret, eph_public) = generate_keypair();
        let cipher = SalsaBox::new(recipient, &eph_secret);
        let nonce = SalsaBox::generate_nonce(&mut CbOsRng);
        let payload = Payload {
            msg: plaintext,
            aad: &[],
        };
        let ct = cipher
            .encrypt(&nonce, payload)
            .map_err(|_| VaultError::EncryptFailed("sealed box encrypt failed".into()))?;
        let mut out = Vec::with_capacity(32 + 24 + ct.len());
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn open(secret: &SecretKey, sealed: &[u8]) -> VaultResult<Vec<u8>> {
        if sealed.len() < 32 + 24 + 16 {
            return Err(VaultError::DecryptFailed);
        }
        let eph_public_bytes: [u8; 32] = sealed[0..32].try_into().unwrap();
        let eph_public = PublicKey::from(eph_public_bytes);
        let nonce = crypto_box::Nonce::from_slice(&sealed[32..56]);
        let ct = &sealed[56..];
        let cipher = SalsaBox::new(&eph_public, secret);
        let payload = Payload { msg: ct, aad: &[] };
        cipher
            .decrypt(nonce, payload)
            .map_err(|_| VaultError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_roundtrip_encrypt() {
        let mk = MasterKey::generate();
        let ct = mk.encrypt(b"hello world").unwrap();
        let pt = mk.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn master_key_tamper_fails() {
        let mk = MasterKey::generate();
        let mut ct = mk.encrypt(b"hello world").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(mk.decrypt(&ct), Err(VaultError::DecryptFailed)));
    }

    #[test]
    fn hash_is_deterministic() {
        let mk = MasterKey::generate();
        let a = mk.hash(b"home/1/user.dat");
        let b = mk.hash(b"home/1/user.dat");
        assert_eq!(a, b);
    }

    #[test]
    fn wrapped_key_roundtrip() {
        let mk = MasterKey::generate();
        let (sub, wrapped) = mk.new_key().unwrap();
        let unwrapped = mk.unwrap(&wrapped).unwrap();
        assert_eq!(sub.aead_key(), unwrapped.aead_key());
        assert_eq!(sub.hmac_key(), unwrapped.hmac_key());
        assert_eq!(wrapped.as_bytes().len(), WRAPPED_KEY_LEN);
    }

    #[test]
    fn wrapped_key_tamper_fails() {
        let mk = MasterKey::generate();
        let (_, wrapped) = mk.new_key().unwrap();
        let mut bytes = *wrapped.as_bytes();
        bytes[50] ^= 0xFF;
        let tampered = WrappedKey::from_bytes(bytes);
        assert!(matches!(mk.unwrap(&tampered), Err(VaultError::DecryptFailed)));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let mk = MasterKey::generate();
        let expected = mk.use_key(|k| *k);
        mk.save("correct horse battery staple", &path).unwrap();

        let loaded = MasterKey::load("correct horse battery staple", &path).unwrap();
        let actual = loaded.use_key(|k| *k);
        assert_eq!(expected, actual);
    }

    #[test]
    fn load_with_wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let mk = MasterKey::generate();
        mk.save("right passphrase", &path).unwrap();
        let result = MasterKey::load("wrong passphrase", &path);
        assert!(matches!(result, Err(VaultError::DecryptFailed)));
    }

    #[test]
    fn sealed_box_roundtrip() {
        let (secret, public) = sealed_box::generate_keypair();
        let sealed = sealed_box::seal(&public, b"per-file symmetric key material").unwrap();
        let opened = sealed_box::open(&secret, &sealed).unwrap();
        assert_eq!(opened, b"per-file symmetric key material");
    }
}
