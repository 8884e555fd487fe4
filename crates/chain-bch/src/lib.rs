//! # chain-bch
//!
//! Bitcoin Cash plug-in for the wallet core: legacy P2PKH receive and
//! spend, the post-fork BIP143 sighash with `SIGHASH_FORKID`, and P2SH
//! escrow addresses with scriptSig-assembled threshold spends.
//!
//! Addresses use the legacy base58 serialization.

mod adapter;
mod sighash;

pub use adapter::BchAdapter;
pub use sighash::{signature_hash_forkid, SIGHASH_ALL_FORKID};
