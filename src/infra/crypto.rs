//! Usage: Authenticated encryption for the vault (AES-256-GCM, SHA-256 instance key, PBKDF2 password key).
//!
//! Layouts:
//! - instance:  `nonce(12) || ciphertext+tag`
//! - password:  `salt(32) || nonce(12) || ciphertext+tag`

use crate::shared::error::{AppError, CODE_DECRYPTION, CODE_INVALID_INPUT, CODE_PERSISTENCE};
use crate::shared::security::constant_time_eq;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Stored hashes asking for more work than this are rejected unverified.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;
const PASSWORD_HASH_SALT_LEN: usize = 16;
const PASSWORD_HASH_SCHEME: &str = "pbkdf2-sha256";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),
    #[error("ciphertext is too short ({len} bytes, need at least {min})")]
    Truncated { len: usize, min: usize },
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong key/password or corrupted data")]
    Decrypt,
}

impl From<CryptoError> for AppError {
    fn from(value: CryptoError) -> Self {
        let code = match &value {
            CryptoError::EmptyInput(_) => CODE_INVALID_INPUT,
            CryptoError::Truncated { .. } | CryptoError::Decrypt => CODE_DECRYPTION,
            CryptoError::Encrypt => CODE_PERSISTENCE,
        };
        AppError::new(code, value.to_string())
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Device-local cipher keyed by SHA-256 of the master key string.
pub struct CryptoService {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoService").finish_non_exhaustive()
    }
}

impl CryptoService {
    pub fn new(master_key: &str) -> CryptoResult<Self> {
        if master_key.is_empty() {
            return Err(CryptoError::EmptyInput("master key"));
        }
        let digest = Sha256::digest(master_key.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyInput("plaintext"));
        }
        seal(&self.key, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.is_empty() {
            return Err(CryptoError::EmptyInput("ciphertext"));
        }
        open(&self.key, ciphertext)
    }

    pub fn encrypt_with_password(&self, data: &[u8], password: &str) -> CryptoResult<Vec<u8>> {
        encrypt_with_password(data, password)
    }

    pub fn decrypt_with_password(&self, data: &[u8], password: &str) -> CryptoResult<Vec<u8>> {
        decrypt_with_password(data, password)
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let nonce_bytes = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], data: &[u8]) -> CryptoResult<Vec<u8>> {
    let min = NONCE_LEN + 1;
    if data.len() < min {
        return Err(CryptoError::Truncated {
            len: data.len(),
            min,
        });
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

fn derive_password_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

pub fn encrypt_with_password(data: &[u8], password: &str) -> CryptoResult<Vec<u8>> {
    if data.is_empty() {
        return Err(CryptoError::EmptyInput("data"));
    }
    if password.is_empty() {
        return Err(CryptoError::EmptyInput("password"));
    }

    let salt = random_bytes::<SALT_LEN>();
    let key = derive_password_key(password, &salt);
    let sealed = seal(&key, data)?;

    let mut out = Vec::with_capacity(SALT_LEN + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt_with_password(data: &[u8], password: &str) -> CryptoResult<Vec<u8>> {
    if data.is_empty() {
        return Err(CryptoError::EmptyInput("data"));
    }
    if password.is_empty() {
        return Err(CryptoError::EmptyInput("password"));
    }
    let min = SALT_LEN + NONCE_LEN + 1;
    if data.len() < min {
        return Err(CryptoError::Truncated {
            len: data.len(),
            min,
        });
    }

    let (salt, sealed) = data.split_at(SALT_LEN);
    let key = derive_password_key(password, salt);
    open(&key, sealed)
}

/// Salted PBKDF2 hash encoded as `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>`.
pub fn hash_password(password: &str) -> CryptoResult<String> {
    if password.is_empty() {
        return Err(CryptoError::EmptyInput("password"));
    }
    let salt = random_bytes::<PASSWORD_HASH_SALT_LEN>();
    let hash = derive_password_key(password, &salt);
    Ok(format!(
        "{PASSWORD_HASH_SCHEME}${PBKDF2_ITERATIONS}${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(&hash[..])
    ))
}

pub fn verify_password(password: &str, encoded: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_HASH_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (STANDARD.decode(salt), STANDARD.decode(expected)) else {
        return false;
    };
    if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS || expected.len() != KEY_LEN {
        return false;
    }

    let mut actual = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual[..]);
    constant_time_eq(&actual[..], &expected)
}

/// Overwrites the buffer with zeros. Non-elision by the optimizer is best effort only.
pub fn secure_wipe(buffer: &mut [u8]) {
    buffer.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::new("unit-test-master-key").expect("crypto")
    }

    #[test]
    fn encrypt_is_randomized_and_decrypt_roundtrips() {
        let crypto = service();
        let a = crypto.encrypt(b"hello vault").expect("encrypt a");
        let b = crypto.encrypt(b"hello vault").expect("encrypt b");
        assert_ne!(a, b);
        assert_eq!(crypto.decrypt(&a).expect("decrypt a"), b"hello vault");
        assert_eq!(crypto.decrypt(&b).expect("decrypt b"), b"hello vault");
    }

    #[test]
    fn decrypt_with_other_key_fails() {
        let sealed = service().encrypt(b"payload").expect("encrypt");
        let other = CryptoService::new("another-master-key").expect("crypto");
        let err = other.decrypt(&sealed).expect_err("wrong key");
        assert!(matches!(err, CryptoError::Decrypt));
        assert_eq!(AppError::from(err).code(), CODE_DECRYPTION);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypto = service();
        let mut sealed = crypto.encrypt(b"payload").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(crypto.decrypt(&sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let crypto = service();
        assert!(matches!(crypto.encrypt(b""), Err(CryptoError::EmptyInput(_))));
        assert!(matches!(crypto.decrypt(b""), Err(CryptoError::EmptyInput(_))));
        assert!(matches!(
            encrypt_with_password(b"data", ""),
            Err(CryptoError::EmptyInput("password"))
        ));
        assert!(CryptoService::new("").is_err());
    }

    #[test]
    fn truncated_input_is_a_decryption_error() {
        let crypto = service();
        assert!(matches!(
            crypto.decrypt(&[0u8; NONCE_LEN]),
            Err(CryptoError::Truncated { .. })
        ));
        assert!(matches!(
            decrypt_with_password(&[0u8; SALT_LEN + NONCE_LEN], "pw"),
            Err(CryptoError::Truncated { .. })
        ));
    }

    #[test]
    fn password_roundtrip_and_wrong_password() {
        let sealed = encrypt_with_password(b"export body", "correct horse").expect("seal");
        assert!(sealed.len() > SALT_LEN + NONCE_LEN);
        assert_eq!(
            decrypt_with_password(&sealed, "correct horse").expect("open"),
            b"export body"
        );
        assert!(matches!(
            decrypt_with_password(&sealed, "battery staple"),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let encoded = hash_password("s3cret").expect("hash");
        assert!(encoded.starts_with("pbkdf2-sha256$100000$"));
        assert!(verify_password("s3cret", &encoded));
        assert!(!verify_password("s3cret!", &encoded));
        assert!(!verify_password("s3cret", "not-a-hash"));
        assert_ne!(encoded, hash_password("s3cret").expect("hash again"));
    }

    #[test]
    fn password_hash_with_excessive_iterations_is_rejected() {
        let encoded = hash_password("s3cret").expect("hash");
        let rest = encoded
            .strip_prefix("pbkdf2-sha256$100000$")
            .expect("known prefix");
        let crafted = format!("pbkdf2-sha256${}${rest}", u32::MAX);
        assert!(!verify_password("s3cret", &crafted));
        let zero = format!("pbkdf2-sha256$0${rest}");
        assert!(!verify_password("s3cret", &zero));
    }

    #[test]
    fn secure_wipe_zeroes_buffer() {
        let mut buf = *b"sensitive";
        secure_wipe(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }
}
