use bitcoin::address::AddressType;
use bitcoin::bip32::Xpub;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::{
    Address, CompressedPublicKey, Network, PrivateKey, Script, ScriptBuf, Transaction,
};

use wallet_core::adapter::{CoinAdapter, EscrowSpendPath};
use wallet_core::escrow::ESCROW_SIGNATURE_VBYTES;
use wallet_core::types::FeeLevel;
use wallet_core::WalletError;

use crate::sighash::{signature_hash_forkid, SIGHASH_ALL_FORKID};

/// Size of a P2PKH input: outpoint + ~107-byte scriptSig + sequence. No
/// witness discount on this chain.
const P2PKH_INPUT_BYTES: u64 = 148;

/// Size of a P2PKH output.
const P2PKH_OUTPUT_BYTES: u64 = 34;

/// Well-formed legacy addresses used for fee-estimation sizing.
const PLACEHOLDER_MAINNET: &str = "1BitcoinEaterAddressDontSendf59kuE";
const PLACEHOLDER_TESTNET: &str = "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn";

/// Bitcoin Cash behavior behind the wallet core's coin seam.
pub struct BchAdapter {
    network: Network,
}

impl BchAdapter {
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
        let parsed = addr
            .parse::<Address<bitcoin::address::NetworkUnchecked>>()
            .map_err(|e| WalletError::InvalidAddress(format!("{addr}: {e}")))?
            .require_network(self.network)
            .map_err(|e| WalletError::InvalidAddress(format!("{addr}: {e}")))?;
        match parsed.address_type() {
            Some(AddressType::P2pkh) | Some(AddressType::P2sh) => Ok(parsed),
            _ => Err(WalletError::InvalidAddress(format!(
                "{addr}: witness addresses are not valid on this chain"
            ))),
        }
    }

    fn push_script(data: &[u8]) -> Result<PushBytesBuf, WalletError> {
        PushBytesBuf::try_from(data.to_vec())
            .map_err(|_| WalletError::SigningFailed("script push too large".into()))
    }
}

impl CoinAdapter for BchAdapter {
    fn currency_code(&self) -> &'static str {
        match self.network {
            Network::Bitcoin => "BCH",
            _ => "TBCH",
        }
    }

    fn network(&self) -> Network {
        self.network
    }

    fn address_from_key(&self, key: &Xpub) -> Result<String, WalletError> {
        Ok(Address::p2pkh(key.to_pub(), self.network).to_string())
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
        P2PKH_INPUT_BYTES
    }

    fn output_vbytes(&self) -> u64 {
        P2PKH_OUTPUT_BYTES
    }

    fn tx_overhead_vbytes(&self) -> u64 {
        // Version + locktime + the two count varints; no segwit marker.
        10
    }

    fn escrow_input_vbytes(&self, threshold: usize, key_count: usize) -> u64 {
        let script_len = 10 + 34 * key_count as u64 + 45;
        41 + 3 + ESCROW_SIGNATURE_VBYTES * threshold as u64 + script_len
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

        let digest = signature_hash_forkid(tx, index, prev_script, value, SIGHASH_ALL_FORKID)?;
        let signature = secp.sign_ecdsa(&Message::from_digest(digest), &key.inner);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(SIGHASH_ALL_FORKID as u8);

        tx.input[index].script_sig = Builder::new()
            .push_slice(Self::push_script(&sig_bytes)?)
            .push_slice(pubkey.to_bytes())
            .into_script();
        Ok(())
    }

    fn escrow_sighash(
        &self,
        tx: &Transaction,
        index: usize,
        redeem: &Script,
        value: u64,
    ) -> Result<[u8; 32], WalletError> {
        signature_hash_forkid(tx, index, redeem, value, SIGHASH_ALL_FORKID)
    }

    fn sighash_suffix(&self) -> u8 {
        SIGHASH_ALL_FORKID as u8
    }

    fn script_hash_address(&self, redeem: &Script) -> Result<String, WalletError> {
        Address::p2sh(redeem, self.network)
            .map(|addr| addr.to_string())
            .map_err(|e| WalletError::InvalidAddress(format!("redeem script: {e}")))
    }

    fn apply_escrow_signatures(
        &self,
        tx: &mut Transaction,
        index: usize,
        sigs: &[Vec<u8>],
        redeem: &Script,
        path: EscrowSpendPath,
    ) -> Result<(), WalletError> {
        let mut builder = Builder::new();
        match path {
            EscrowSpendPath::Threshold { with_selector } => {
                // CHECKMULTISIG pops one extra stack item.
                builder = builder.push_int(0);
                for sig in sigs {
                    builder = builder.push_slice(Self::push_script(sig)?);
                }
                if with_selector {
                    builder = builder.push_int(1);
                }
            }
            EscrowSpendPath::Timeout => {
                let sig = sigs
                    .first()
                    .ok_or_else(|| WalletError::SigningFailed("missing timeout signature".into()))?;
                builder = builder.push_slice(Self::push_script(sig)?).push_int(0);
            }
        }
        tx.input[index].script_sig = builder
            .push_slice(Self::push_script(redeem.as_bytes())?)
            .into_script();
        Ok(())
    }

    fn target_spacing_secs(&self) -> u64 {
        600
    }
}
