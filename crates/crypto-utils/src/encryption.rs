use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{self, DEFAULT_KDF_ROUNDS, DEFAULT_KEY_LENGTH};
use crate::random;

type Aes256CfbEnc = Encryptor<Aes256>;
type Aes256CfbDec = Decryptor<Aes256>;

/// AES block size; the IV prepended to every ciphertext is one block.
const IV_LEN: usize = 16;

/// An encrypted master key together with the KDF parameters needed to
/// decrypt it again. This is exactly what gets persisted alongside the
/// coin record.
#[derive(Debug, Clone)]
pub struct CipherText {
    /// base64(IV ‖ ciphertext).
    pub cipher_b64: String,
    /// PBKDF2 salt.
    pub salt: [u8; 32],
    /// PBKDF2 round count.
    pub rounds: u32,
    /// Derived key length in bytes.
    pub key_len: u32,
}

/// Encrypts `plain` under `passphrase` using AES-256-CFB.
///
/// A fresh 32-byte salt and 16-byte IV are generated; the key is stretched
/// with PBKDF2-HMAC-SHA512 at the default round count. The IV needs to be
/// unique, but not secret, so it is prepended to the ciphertext.
pub fn encrypt(plain: &[u8], passphrase: &[u8]) -> Result<CipherText, CryptoError> {
    let salt = random::generate_salt();
    encrypt_with_params(plain, passphrase, salt, DEFAULT_KDF_ROUNDS, DEFAULT_KEY_LENGTH)
}

fn encrypt_with_params(
    plain: &[u8],
    passphrase: &[u8],
    salt: [u8; 32],
    rounds: u32,
    key_len: u32,
) -> Result<CipherText, CryptoError> {
    let key = kdf::derive_key(passphrase, &salt, rounds, key_len);
    let iv = random::generate_iv();

    let enc = Aes256CfbEnc::new_from_slices(&key, &iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

    let mut buf = plain.to_vec();
    enc.encrypt(&mut buf);

    let mut out = Vec::with_capacity(IV_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);

    Ok(CipherText {
        cipher_b64: BASE64.encode(out),
        salt,
        rounds,
        key_len,
    })
}

/// Decrypts a ciphertext previously produced by [`encrypt`].
///
/// CFB mode is unauthenticated: a wrong passphrase does not fail here, it
/// yields garbage bytes. The caller is responsible for validating that the
/// plaintext parses as an extended key and reporting an invalid passphrase.
pub fn decrypt(
    cipher_b64: &str,
    passphrase: &[u8],
    salt: &[u8],
    rounds: u32,
    key_len: u32,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let raw = BASE64
        .decode(cipher_b64)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if raw.len() < IV_LEN {
        return Err(CryptoError::CiphertextTooShort(raw.len()));
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);

    let key = kdf::derive_key(passphrase, salt, rounds, key_len);
    let dec = Aes256CfbDec::new_from_slices(&key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

    let mut buf = Zeroizing::new(ciphertext.to_vec());
    dec.decrypt(&mut buf);
    Ok(buf)
}

/// Decrypts with the old passphrase and re-encrypts with the new one under a
/// fresh salt and IV.
pub fn rekey(
    cipher: &CipherText,
    old_passphrase: &[u8],
    new_passphrase: &[u8],
) -> Result<CipherText, CryptoError> {
    let plain = decrypt(
        &cipher.cipher_b64,
        old_passphrase,
        &cipher.salt,
        cipher.rounds,
        cipher.key_len,
    )?;
    encrypt(&plain, new_passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let plain = b"xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
        let ct = encrypt(plain, b"passphrase").unwrap();
        let back = decrypt(&ct.cipher_b64, b"passphrase", &ct.salt, ct.rounds, ct.key_len).unwrap();
        assert_eq!(&*back, plain.as_slice());
    }

    #[test]
    fn encrypt_uses_default_params() {
        let ct = encrypt(b"secret", b"pw").unwrap();
        assert_eq!(ct.rounds, DEFAULT_KDF_ROUNDS);
        assert_eq!(ct.key_len, DEFAULT_KEY_LENGTH);
        assert_eq!(ct.salt.len(), 32);
    }

    #[test]
    fn ciphertext_layout_is_iv_then_data() {
        let ct = encrypt(b"abc", b"pw").unwrap();
        let raw = BASE64.decode(&ct.cipher_b64).unwrap();
        // 16-byte IV followed by ciphertext of the same length as the plaintext.
        assert_eq!(raw.len(), IV_LEN + 3);
    }

    #[test]
    fn encrypt_is_randomized() {
        let c1 = encrypt(b"same plaintext", b"pw").unwrap();
        let c2 = encrypt(b"same plaintext", b"pw").unwrap();
        // Fresh salt and IV every time.
        assert_ne!(c1.cipher_b64, c2.cipher_b64);
        assert_ne!(c1.salt, c2.salt);
    }

    #[test]
    fn wrong_passphrase_yields_garbage_not_error() {
        let plain = b"extended key material";
        let ct = encrypt(plain, b"correct").unwrap();
        let back = decrypt(&ct.cipher_b64, b"wrong", &ct.salt, ct.rounds, ct.key_len).unwrap();
        assert_ne!(&*back, plain.as_slice());
    }

    #[test]
    fn decrypt_rejects_truncated_ciphertext() {
        let short = BASE64.encode([0u8; 8]);
        let err = decrypt(&short, b"pw", &[0u8; 32], 16, 32).unwrap_err();
        assert!(matches!(err, CryptoError::CiphertextTooShort(8)));
    }

    #[test]
    fn decrypt_rejects_bad_base64() {
        let err = decrypt("not-base64!!!", b"pw", &[0u8; 32], 16, 32).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidEncoding(_)));
    }

    #[test]
    fn rekey_roundtrip() {
        let plain = b"master private key";
        let ct = encrypt(plain, b"old-pw").unwrap();
        let ct2 = rekey(&ct, b"old-pw", b"new-pw").unwrap();

        assert_ne!(ct.cipher_b64, ct2.cipher_b64);
        assert_ne!(ct.salt, ct2.salt);

        let back = decrypt(&ct2.cipher_b64, b"new-pw", &ct2.salt, ct2.rounds, ct2.key_len).unwrap();
        assert_eq!(&*back, plain.as_slice());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let ct = encrypt(b"", b"pw").unwrap();
        let back = decrypt(&ct.cipher_b64, b"pw", &ct.salt, ct.rounds, ct.key_len).unwrap();
        assert!(back.is_empty());
    }
}
