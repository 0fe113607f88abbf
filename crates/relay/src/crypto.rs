// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-at-rest encryption and request-token hashing.
//!
//! The at-rest format is `hex(iv) ":" hex(ciphertext)` with AES-256-CBC and a
//! scrypt-derived key; it must stay byte-compatible with rows written by
//! earlier deployments, so the parameters here are fixed.

use std::collections::HashMap;
use std::sync::Mutex;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Salt used for token-at-rest rows. Fixed by the deployed store format.
pub const TOKEN_SALT: &str = "salt";

/// scrypt cost parameters: N=32768 (log2 = 15), r=8, p=1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// AES-256-CBC cipher over a shared secret, with the derived key memoized
/// per salt (scrypt at N=32768 is far too slow to re-run per request).
pub struct Cipher {
    secret: String,
    keys: Mutex<HashMap<String, [u8; KEY_LEN]>>,
}

impl Cipher {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into(), keys: Mutex::new(HashMap::new()) }
    }

    fn key_for(&self, salt: &str) -> anyhow::Result<[u8; KEY_LEN]> {
        if let Ok(keys) = self.keys.lock() {
            if let Some(key) = keys.get(salt) {
                return Ok(*key);
            }
        }
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| anyhow::anyhow!("invalid scrypt params: {e}"))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(self.secret.as_bytes(), salt.as_bytes(), &params, &mut key)
            .map_err(|e| anyhow::anyhow!("key derivation failed: {e}"))?;
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(salt.to_owned(), key);
        }
        Ok(key)
    }

    /// Encrypt `plaintext`, emitting `hex(iv) ":" hex(ciphertext)`.
    pub fn encrypt(&self, plaintext: &str, salt: &str) -> anyhow::Result<String> {
        let key = self.key_for(salt)?;
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a value produced by [`Cipher::encrypt`].
    ///
    /// Fails on a missing separator, wrong IV length, ciphertext not aligned
    /// to the AES block size, or invalid PKCS#7 padding.
    pub fn decrypt(&self, stored: &str, salt: &str) -> anyhow::Result<String> {
        let (iv_hex, ct_hex) = stored
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed ciphertext: missing separator"))?;

        let iv = hex::decode(iv_hex)?;
        if iv.len() != IV_LEN {
            anyhow::bail!("malformed ciphertext: IV must be {IV_LEN} bytes, got {}", iv.len());
        }
        let ciphertext = hex::decode(ct_hex)?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            anyhow::bail!("malformed ciphertext: length {} not block-aligned", ciphertext.len());
        }

        let key = self.key_for(salt)?;
        let iv_arr: [u8; IV_LEN] = iv.as_slice().try_into()?;
        let plaintext = Aes256CbcDec::new(&key.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed: invalid padding"))?;

        Ok(String::from_utf8(plaintext)?)
    }
}

/// SHA-256 of a request token, hex-encoded. Used for user-token lookup.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;
