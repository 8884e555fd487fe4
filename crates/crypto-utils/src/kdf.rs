use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use zeroize::Zeroizing;

/// Default number of PBKDF2 rounds. The greater this number is, the harder
/// it is to brute force the encryption key.
pub const DEFAULT_KDF_ROUNDS: u32 = 8192;

/// Default derived key length in bytes (AES-256).
pub const DEFAULT_KEY_LENGTH: u32 = 32;

/// Derives a `key_len`-byte key from `passphrase` and `salt` using
/// PBKDF2-HMAC-SHA512.
///
/// The output is wrapped in [`Zeroizing`] so the stretched key is wiped when
/// it goes out of scope.
pub fn derive_key(passphrase: &[u8], salt: &[u8], rounds: u32, key_len: u32) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; key_len as usize]);
    pbkdf2_hmac::<Sha512>(passphrase, salt, rounds, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_produces_requested_length() {
        let key = derive_key(b"passphrase", &[0u8; 32], 16, DEFAULT_KEY_LENGTH);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn derive_key_deterministic() {
        let salt = [0xABu8; 32];
        let k1 = derive_key(b"my-passphrase", &salt, DEFAULT_KDF_ROUNDS, 32);
        let k2 = derive_key(b"my-passphrase", &salt, DEFAULT_KDF_ROUNDS, 32);
        assert_eq!(*k1, *k2, "same passphrase + salt must produce same key");
    }

    #[test]
    fn derive_key_different_passphrases_differ() {
        let salt = [0x01u8; 32];
        let k1 = derive_key(b"passphrase-a", &salt, 16, 32);
        let k2 = derive_key(b"passphrase-b", &salt, 16, 32);
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn derive_key_different_salts_differ() {
        let k1 = derive_key(b"same", &[0x01u8; 32], 16, 32);
        let k2 = derive_key(b"same", &[0x02u8; 32], 16, 32);
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn derive_key_different_rounds_differ() {
        let salt = [0x03u8; 32];
        let k1 = derive_key(b"same", &salt, 16, 32);
        let k2 = derive_key(b"same", &salt, 32, 32);
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn derive_key_known_vector() {
        // PBKDF2-HMAC-SHA512, P="password", S="salt", c=1, dkLen=32.
        let key = derive_key(b"password", b"salt", 1, 32);
        assert_eq!(
            hex::encode(&*key),
            "867f70cf1ade02cff3752599a3a53dc4af34c7a669815ae5d513554e1c8cf252"
        );
    }

    #[test]
    fn derive_key_empty_passphrase() {
        let key = derive_key(b"", &[0xCCu8; 32], 16, 32);
        assert_eq!(key.len(), 32);
    }
}
