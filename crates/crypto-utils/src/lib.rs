//! # crypto-utils
//!
//! Key derivation and master-key encryption for the wallet: PBKDF2-HMAC-SHA512
//! passphrase stretching, AES-256-CFB encryption of serialized extended keys,
//! and secure random generation.

pub mod encryption;
pub mod error;
pub mod kdf;
pub mod random;

pub use encryption::CipherText;
pub use error::CryptoError;
