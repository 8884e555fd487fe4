//! # wallet-core
//!
//! Multi-coin HD wallet core for the marketplace daemon: BIP44 keychain
//! with a look-ahead window, transactional UTXO store, fee-sized
//! transaction authoring with BIP69 ordering, and m-of-n escrow with an
//! optional timeout recovery path.
//!
//! Per-coin behavior (address codec, dust policy, fee schedule, sighash)
//! plugs in through [`adapter::CoinAdapter`]; see the `chain-btc` and
//! `chain-bch` crates.

pub mod adapter;
pub mod builder;
pub mod chain_client;
pub mod coin_selection;
pub mod database;
pub mod error;
pub mod escrow;
pub mod keychain;
pub mod types;
pub mod wallet;

pub use adapter::{CoinAdapter, EscrowSpendPath};
pub use chain_client::{ChainClient, ChainEvent};
pub use database::{Database, Tx};
pub use error::WalletError;
pub use keychain::{Keychain, KeychainConfig};
pub use types::{BlockInfo, EscrowSignature, FeeLevel, SpendInfo, WalletTransaction};
pub use wallet::{Wallet, WalletConfig};
