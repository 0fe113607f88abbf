// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn test_cipher() -> Cipher {
    Cipher::new("test-encryption-key")
}

#[test]
fn round_trip_preserves_plaintext() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let stored = cipher.encrypt("sk-ant-oat01-abcdef", "salt")?;
    assert_eq!(cipher.decrypt(&stored, "salt")?, "sk-ant-oat01-abcdef");
    Ok(())
}

#[test]
fn output_format_is_hex_iv_colon_hex_ciphertext() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let stored = cipher.encrypt("token", "salt")?;
    let (iv_hex, ct_hex) = stored.split_once(':').ok_or_else(|| anyhow::anyhow!("no separator"))?;
    assert_eq!(iv_hex.len(), 32);
    assert!(iv_hex.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(ct_hex.len() % 32, 0);
    assert!(ct_hex.chars().all(|c| c.is_ascii_hexdigit()));
    Ok(())
}

#[test]
fn encrypt_is_randomized_but_decrypts_identically() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let a = cipher.encrypt("same input", "salt")?;
    let b = cipher.encrypt("same input", "salt")?;
    assert_ne!(a, b, "IV must differ between encryptions");
    assert_eq!(cipher.decrypt(&a, "salt")?, cipher.decrypt(&b, "salt")?);
    Ok(())
}

#[test]
fn decrypt_rejects_missing_separator() {
    let cipher = test_cipher();
    assert!(cipher.decrypt("deadbeef", "salt").is_err());
}

#[test]
fn decrypt_rejects_short_iv() {
    let cipher = test_cipher();
    assert!(cipher.decrypt("deadbeef:00112233445566778899aabbccddeeff", "salt").is_err());
}

#[test]
fn decrypt_rejects_unaligned_ciphertext() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let stored = cipher.encrypt("token", "salt")?;
    let truncated = &stored[..stored.len() - 2];
    assert!(cipher.decrypt(truncated, "salt").is_err());
    Ok(())
}

#[test]
fn decrypt_rejects_wrong_key() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let stored = cipher.encrypt("token", "salt")?;
    let other = Cipher::new("a-different-key");
    assert!(other.decrypt(&stored, "salt").is_err());
    Ok(())
}

#[test]
fn salts_produce_independent_keys() -> anyhow::Result<()> {
    let cipher = test_cipher();
    let stored = cipher.encrypt("token", "salt")?;
    assert!(cipher.decrypt(&stored, "other-salt").is_err());
    Ok(())
}

#[test]
fn sha256_hex_matches_known_vector() {
    assert_eq!(
        sha256_hex("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // scrypt keys are memoized, so the derivation cost is paid once.
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn decrypt_inverts_encrypt(plaintext in ".{1,200}", salt in "[a-z]{1,8}") {
            let cipher = Cipher::new("prop-key");
            let stored = cipher.encrypt(&plaintext, &salt).unwrap();
            prop_assert_eq!(cipher.decrypt(&stored, &salt).unwrap(), plaintext);
        }
    }
}
