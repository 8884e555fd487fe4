//! The seam between the shared wallet core and a concrete coin.
//!
//! Everything chain-specific (address encoding, dust policy, fee schedule,
//! sighash algorithm, spending-script assembly) lives behind
//! [`CoinAdapter`]. The keychain, builder, and escrow layers are written
//! against this trait only.

use bitcoin::bip32::Xpub;
use bitcoin::{Network, PrivateKey, Script, ScriptBuf, Transaction};

use crate::error::WalletError;
use crate::types::FeeLevel;

/// Which branch of an escrow redeem script a spend takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowSpendPath {
    /// The m-of-n threshold branch. `with_selector` is true when the redeem
    /// script has a timeout arm, so the unlocking data must select the IF
    /// branch explicitly.
    Threshold { with_selector: bool },
    /// The timeout-recovery branch (single signature from the timeout key).
    Timeout,
}

/// Per-coin behavior plugged into the shared wallet core.
pub trait CoinAdapter: Send + Sync {
    /// Currency code used to key persisted records, e.g. "BTC".
    fn currency_code(&self) -> &'static str;

    /// Network parameters for address serialization.
    fn network(&self) -> Network;

    /// Derives the coin's address string from a chain-level child public
    /// key. This is the keychain's `AddressFunc`.
    fn address_from_key(&self, key: &Xpub) -> Result<String, WalletError>;

    /// Checks that `addr` parses for this coin and network.
    fn validate_address(&self, addr: &str) -> Result<(), WalletError> {
        self.script_pubkey(addr).map(|_| ())
    }

    /// Converts an address string into its locking script.
    fn script_pubkey(&self, addr: &str) -> Result<ScriptBuf, WalletError>;

    /// Whether `amount` paid to `script` is below the network's economic
    /// relay threshold.
    fn is_dust(&self, amount: u64, script: &Script) -> bool {
        amount < script.minimal_non_dust().to_sat()
    }

    /// Fee-per-byte for a fee level.
    fn fee_per_byte(&self, level: FeeLevel) -> u64;

    /// Estimated virtual size of one spend input, signature included.
    fn input_vbytes(&self) -> u64;

    /// Estimated virtual size of one output.
    fn output_vbytes(&self) -> u64;

    /// Fixed virtual size of an empty transaction.
    fn tx_overhead_vbytes(&self) -> u64 {
        11
    }

    /// Estimated virtual size of one escrow input spending the threshold
    /// branch of an m-of-n redeem script.
    fn escrow_input_vbytes(&self, threshold: usize, key_count: usize) -> u64;

    /// A syntactically valid, deliberately long address used when sizing a
    /// transaction for fee estimation so the size is never under-estimated.
    fn placeholder_address(&self) -> &'static str;

    /// Signs input `index` of `tx`, which spends an output paying
    /// `prev_script` with `value` base units, and installs the unlocking
    /// script or witness.
    fn sign_input(
        &self,
        tx: &mut Transaction,
        index: usize,
        prev_script: &Script,
        value: u64,
        key: &PrivateKey,
    ) -> Result<(), WalletError>;

    /// Computes the digest an escrow participant signs for input `index`,
    /// where the input spends a script-hash output of `redeem` holding
    /// `value` base units.
    fn escrow_sighash(
        &self,
        tx: &Transaction,
        index: usize,
        redeem: &Script,
        value: u64,
    ) -> Result<[u8; 32], WalletError>;

    /// The sighash-type byte appended to DER escrow signatures.
    fn sighash_suffix(&self) -> u8;

    /// The script-hash address of an escrow redeem script.
    fn script_hash_address(&self, redeem: &Script) -> Result<String, WalletError>;

    /// Installs the aggregated escrow signatures for input `index`. `sigs`
    /// are DER signatures (suffix byte included) already ordered to match
    /// the redeem script's key order.
    fn apply_escrow_signatures(
        &self,
        tx: &mut Transaction,
        index: usize,
        sigs: &[Vec<u8>],
        redeem: &Script,
        path: EscrowSpendPath,
    ) -> Result<(), WalletError>;

    /// Expected seconds between blocks; used to convert a BIP68 time lock
    /// into an expected confirmation-depth.
    fn target_spacing_secs(&self) -> u64;
}
