use thiserror::Error;

/// Errors surfaced by wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The wallet's UTXOs cannot cover the requested amount plus fee.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Total spendable value in base units.
        have: u64,
        /// Required value in base units.
        need: u64,
    },

    /// The requested output is below the coin's dust threshold.
    #[error("dust output amount: {0}")]
    DustOutput(u64),

    /// The address string does not parse for this coin and network.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Decryption produced bytes that do not parse as an extended key.
    #[error("invalid passphrase")]
    InvalidPassphrase,

    /// A private key is required but the keychain is encrypted and locked.
    #[error("keychain is encrypted")]
    EncryptedKeychain,

    /// The operation is invalid for the wallet's current lock or
    /// configuration state.
    #[error("wallet state: {0}")]
    WalletLocked(String),

    /// More signatures were required than public keys supplied.
    #[error("unable to generate multisig script with {threshold} required signatures when there are only {keys} public keys available")]
    ThresholdExceedsKeys {
        /// Requested signature threshold.
        threshold: usize,
        /// Number of public keys supplied.
        keys: usize,
    },

    /// The escrow's relative timeout has not elapsed yet.
    #[error("escrow timeout has not expired")]
    TimeoutNotExpired,

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted record failed to parse back into its in-memory form.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Underlying database failure.
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    /// The chain client rejected or failed to relay the transaction.
    #[error("broadcast failed: {0}")]
    Broadcast(String),

    /// Producing a signature or assembling a spending script failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// BIP32 derivation failure at a level where skipping is not an option.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// Failure in the key-crypter layer.
    #[error(transparent)]
    Crypto(#[from] crypto_utils::CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = WalletError::InsufficientFunds {
            have: 100,
            need: 250,
        };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 250");
    }

    #[test]
    fn display_threshold_exceeds_keys() {
        let e = WalletError::ThresholdExceedsKeys {
            threshold: 3,
            keys: 2,
        };
        assert!(e.to_string().contains("3 required signatures"));
        assert!(e.to_string().contains("only 2 public keys"));
    }

    #[test]
    fn display_encrypted_keychain() {
        assert_eq!(
            WalletError::EncryptedKeychain.to_string(),
            "keychain is encrypted"
        );
    }

    #[test]
    fn from_crypto_error() {
        let e: WalletError = crypto_utils::CryptoError::CiphertextTooShort(4).into();
        assert!(matches!(e, WalletError::Crypto(_)));
    }

    #[test]
    fn from_rusqlite_error() {
        let e: WalletError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(e, WalletError::Database(_)));
    }
}
