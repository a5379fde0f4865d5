//! Bundle encryption (AES-256-GCM).
//!
//! Payload format: `base64(nonce[12] || ciphertext || tag[16])`, no associated
//! data. Keys are 32 random bytes, base64-encoded.
//!
//! The encrypted artifact is a small script that refuses to run without the
//! key the runtime injects (`run --decrypt-key`), then evaluates the
//! decrypted bundle in its own scope.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Global holding the decryption key, defined by the runtime.
pub const DECRYPT_KEY_GLOBAL: &str = "__SWRT_DECRYPT_KEY__";

/// Native decryption function, defined by the runtime.
pub const DECRYPT_FN_GLOBAL: &str = "__swrtDecrypt";

/// Generate a fresh base64-encoded 256-bit key.
pub fn generate_key() -> String {
    STANDARD.encode(Aes256Gcm::generate_key(OsRng))
}

fn cipher_for(key: &str) -> Result<Aes256Gcm> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|_| Error::Encryption("invalid key format: expected base64".into()))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::Encryption(format!(
            "invalid key length: expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Aes256Gcm::new_from_slice(&bytes).map_err(|_| Error::Encryption("invalid key".into()))
}

/// Check that `key` is usable before doing any expensive work.
pub fn validate_key(key: &str) -> Result<()> {
    cipher_for(key).map(|_| ())
}

/// Encrypt `code` with a fresh random nonce.
pub fn encrypt_code(code: &str, key: &str) -> Result<String> {
    let cipher = cipher_for(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, code.as_bytes())
        .map_err(|_| Error::Encryption("encryption failed".into()))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

/// Decrypt a payload produced by [`encrypt_code`].
pub fn decrypt_code(payload: &str, key: &str) -> Result<String> {
    let cipher = cipher_for(key)?;
    let data = STANDARD
        .decode(payload.trim())
        .map_err(|_| Error::Encryption("invalid payload: expected base64".into()))?;
    if data.len() < NONCE_LEN {
        return Err(Error::Encryption("invalid payload: too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Encryption("decryption failed: wrong key or corrupted bundle".into()))?;
    String::from_utf8(plaintext)
        .map_err(|_| Error::Encryption("decrypted bundle is not valid UTF-8".into()))
}

/// Wrap an encrypted payload in the self-decrypting bootstrap.
pub fn wrap_encrypted_code(payload: &str) -> String {
    format!(
        r#"// SW Runtime encrypted bundle (AES-256-GCM)
// This file requires a decryption key to run.
// Usage: swrt run --decrypt-key=<key> <file>

const ENCRYPTED_CODE = "{payload}";

if (typeof {DECRYPT_KEY_GLOBAL} === 'undefined' || typeof {DECRYPT_FN_GLOBAL} !== 'function') {{
    console.error('❌ 这是一个加密的 bundle 文件，需要解密密钥运行。');
    console.error('使用方法: swrt run --decrypt-key=<key> <file>');
    throw new Error('missing decryption key');
}}

eval({DECRYPT_FN_GLOBAL}(ENCRYPTED_CODE, {DECRYPT_KEY_GLOBAL}));
"#
    )
}
