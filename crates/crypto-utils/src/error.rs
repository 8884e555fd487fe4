use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The derived key length is not usable by the cipher.
    #[error("invalid key length: {0} (AES-256 requires 32 bytes)")]
    InvalidKeyLength(usize),

    /// The stored ciphertext is shorter than the prepended IV.
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// The stored ciphertext is not valid base64.
    #[error("invalid ciphertext encoding: {0}")]
    InvalidEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_key_length() {
        let err = CryptoError::InvalidKeyLength(16);
        assert_eq!(
            err.to_string(),
            "invalid key length: 16 (AES-256 requires 32 bytes)"
        );
    }

    #[test]
    fn display_ciphertext_too_short() {
        let err = CryptoError::CiphertextTooShort(5);
        assert_eq!(err.to_string(), "ciphertext too short: 5 bytes");
    }

    #[test]
    fn display_invalid_encoding() {
        let err = CryptoError::InvalidEncoding("bad padding".into());
        assert_eq!(err.to_string(), "invalid ciphertext encoding: bad padding");
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: Box<dyn std::error::Error> = Box::new(CryptoError::CiphertextTooShort(0));
        assert!(err.to_string().contains("too short"));
    }
}
