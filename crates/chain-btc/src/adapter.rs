use bitcoin::bip32::Xpub;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, PrivateKey, Script, ScriptBuf, Transaction,
    Witness,
};
use bitcoin::hashes::Hash;

use wallet_core::adapter::{CoinAdapter, EscrowSpendPath};
use wallet_core::escrow::ESCROW_SIGNATURE_VBYTES;
use wallet_core::types::FeeLevel;
use wallet_core::WalletError;

/// Estimated virtual size of a P2WPKH input: 41 non-witness bytes plus
/// ~107 witness bytes discounted by 4.
const P2WPKH_INPUT_VBYTES: u64 = 68;

/// Estimated virtual size of a P2WPKH output.
const P2WPKH_OUTPUT_VBYTES: u64 = 31;

/// BIP173 P2WSH addresses; long on purpose so fee estimation never sizes a
/// transaction smaller than reality.
const PLACEHOLDER_MAINNET: &str =
    "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3";
const PLACEHOLDER_TESTNET: &str =
    "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7";

/// Bitcoin behavior behind the wallet core's coin seam.
pub struct BtcAdapter {
    network: Network,
}

impl BtcAdapter {
    pub fn new(testnet: bool) -> Self {
        Self {
            network: if testnet {
                Network::Testnet
            } else {
                Network::Bitcoin
            },
        }
    }

    fn parse_address(&self, addr: &str) -> Result<Address, WalletError> {
        addr.parse::<Address<bitcoin::address::NetworkUnchecked>>()
            .map_err(|e| WalletError::InvalidAddress(format!("{addr}: {e}")))?
            .require_network(self.network)
            .map_err(|e| WalletError::InvalidAddress(format!("{addr}: {e}")))
    }
}

impl CoinAdapter for BtcAdapter {
    fn currency_code(&self) -> &'static str {
        match self.network {
            Network::Bitcoin => "BTC",
            _ => "TBTC",
        }
    }

    fn network(&self) -> Network {
        self.network
    }

    fn address_from_key(&self, key: &Xpub) -> Result<String, WalletError> {
        Ok(Address::p2wpkh(&key.to_pub(), self.network).to_string())
    }

    fn script_pubkey(&self, addr: &str) -> Result<ScriptBuf, WalletError> {
        Ok(self.parse_address(addr)?.script_pubkey())
    }

    fn fee_per_byte(&self, level: FeeLevel) -> u64 {
        match level {
            FeeLevel::Economic => 1,
            FeeLevel::Normal => 5,
            FeeLevel::Priority => 10,
        }
    }

    fn input_vbytes(&self) -> u64 {
        P2WPKH_INPUT_VBYTES
    }

    fn output_vbytes(&self) -> u64 {
        P2WPKH_OUTPUT_VBYTES
    }

    fn escrow_input_vbytes(&self, threshold: usize, key_count: usize) -> u64 {
        // Witness: dummy + threshold signatures + branch selector + the
        // redeem script itself, all weight-discounted.
        let script_len = 10 + 34 * key_count as u64 + 45;
        let witness = 4 + ESCROW_SIGNATURE_VBYTES * threshold as u64 + script_len;
        41 + witness.div_ceil(4)
    }

    fn placeholder_address(&self) -> &'static str {
        match self.network {
            Network::Bitcoin => PLACEHOLDER_MAINNET,
            _ => PLACEHOLDER_TESTNET,
        }
    }

    fn sign_input(
        &self,
        tx: &mut Transaction,
        index: usize,
        prev_script: &Script,
        value: u64,
        key: &PrivateKey,
    ) -> Result<(), WalletError> {
        let secp = Secp256k1::new();
        let pubkey = CompressedPublicKey(key.inner.public_key(&secp));

        let unsigned = tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        let sighash = cache
            .p2wpkh_signature_hash(
                index,
                prev_script,
                Amount::from_sat(value),
                EcdsaSighashType::All,
            )
            .map_err(|e| WalletError::SigningFailed(format!("input {index}: {e}")))?;

        let signature = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &key.inner);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All as u8);

        let mut witness = Witness::new();
        witness.push(&sig_bytes);
        witness.push(pubkey.to_bytes());
        tx.input[index].witness = witness;
        Ok(())
    }

    fn escrow_sighash(
        &self,
        tx: &Transaction,
        index: usize,
        redeem: &Script,
        value: u64,
    ) -> Result<[u8; 32], WalletError> {
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wsh_signature_hash(index, redeem, Amount::from_sat(value), EcdsaSighashType::All)
            .map_err(|e| WalletError::SigningFailed(format!("input {index}: {e}")))?;
        Ok(sighash.to_byte_array())
    }

    fn sighash_suffix(&self) -> u8 {
        EcdsaSighashType::All as u8
    }

    fn script_hash_address(&self, redeem: &Script) -> Result<String, WalletError> {
        Ok(Address::p2wsh(redeem, self.network).to_string())
    }

    fn apply_escrow_signatures(
        &self,
        tx: &mut Transaction,
        index: usize,
        sigs: &[Vec<u8>],
        redeem: &Script,
        path: EscrowSpendPath,
    ) -> Result<(), WalletError> {
        let mut witness = Witness::new();
        match path {
            EscrowSpendPath::Threshold { with_selector } => {
                // CHECKMULTISIG pops one extra stack item.
                witness.push(&[] as &[u8]);
                for sig in sigs {
                    witness.push(sig);
                }
                if with_selector {
                    witness.push([1u8]);
                }
            }
            EscrowSpendPath::Timeout => {
                let sig = sigs
                    .first()
                    .ok_or_else(|| WalletError::SigningFailed("missing timeout signature".into()))?;
                witness.push(sig);
                // Empty selector takes the ELSE branch.
                witness.push(&[] as &[u8]);
            }
        }
        witness.push(redeem.as_bytes());
        tx.input[index].witness = witness;
        Ok(())
    }

    fn target_spacing_secs(&self) -> u64 {
        600
    }
}
