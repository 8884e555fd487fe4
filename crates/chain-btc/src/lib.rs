//! # chain-btc
//!
//! Bitcoin plug-in for the wallet core: native SegWit (P2WPKH) receive and
//! spend, BIP143 sighashes via the `bitcoin` crate's sighash cache, and
//! P2WSH escrow addresses with witness-assembled threshold spends.

mod adapter;

pub use adapter::BtcAdapter;
