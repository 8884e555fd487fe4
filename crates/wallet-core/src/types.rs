use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Fee urgency selected by the user; each coin maps a level to a
/// fee-per-byte figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeeLevel {
    Economic,
    Normal,
    Priority,
}

/// One side of a transaction as the wallet reports it: the outpoint being
/// created or consumed, the address it pays, and the amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendInfo {
    /// Hex-encoded outpoint: txid followed by the 4-byte big-endian index.
    pub outpoint: String,
    /// Address paid to (or spent from). Empty if the script is not
    /// address-shaped.
    pub address: String,
    /// Amount in base units.
    pub amount: u64,
    /// Whether the address belongs to this wallet.
    pub is_relevant: bool,
    /// Whether the address is on the watched set.
    pub is_watched: bool,
}

/// A transaction as exposed to the host: id, both sides, and its height
/// (0 while unconfirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub from: Vec<SpendInfo>,
    pub to: Vec<SpendInfo>,
    pub height: u64,
}

/// Best-chain tip as last reported by the chain client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u64,
}

/// A single escrow signature covering one input of a multisig spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowSignature {
    /// Index of the input this signature covers.
    pub index: u32,
    /// DER signature with the coin's sighash byte appended.
    pub signature: Vec<u8>,
}

/// Serializes an outpoint as txid hex followed by the 4-byte big-endian
/// output index. This form sorts the same way BIP69 orders inputs.
pub fn encode_outpoint(op: &OutPoint) -> String {
    format!("{}{:08x}", op.txid, op.vout)
}

/// Parses the outpoint form produced by [`encode_outpoint`].
pub fn decode_outpoint(s: &str) -> Result<OutPoint, WalletError> {
    if s.len() != 72 {
        return Err(WalletError::CorruptRecord(format!(
            "outpoint has length {}, expected 72",
            s.len()
        )));
    }
    let (txid_hex, index_hex) = s.split_at(64);
    let txid: Txid = txid_hex
        .parse()
        .map_err(|_| WalletError::CorruptRecord(format!("bad txid in outpoint: {txid_hex}")))?;
    let vout = u32::from_str_radix(index_hex, 16)
        .map_err(|_| WalletError::CorruptRecord(format!("bad index in outpoint: {index_hex}")))?;
    Ok(OutPoint::new(txid, vout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn outpoint_roundtrip() {
        let txid =
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        let op = OutPoint::new(txid, 7);
        let encoded = encode_outpoint(&op);
        assert_eq!(encoded.len(), 72);
        assert!(encoded.ends_with("00000007"));
        assert_eq!(decode_outpoint(&encoded).unwrap(), op);
    }

    #[test]
    fn outpoint_index_is_big_endian() {
        let txid =
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        let encoded = encode_outpoint(&OutPoint::new(txid, 0x01020304));
        assert!(encoded.ends_with("01020304"));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(matches!(
            decode_outpoint("abcd"),
            Err(WalletError::CorruptRecord(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_txid() {
        let s = format!("{}00000000", "zz".repeat(32));
        assert!(matches!(
            decode_outpoint(&s),
            Err(WalletError::CorruptRecord(_))
        ));
    }

    #[test]
    fn spend_info_serde_roundtrip() {
        let info = SpendInfo {
            outpoint: format!("{}{:08x}", "ab".repeat(32), 1),
            address: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
            amount: 10_000,
            is_relevant: true,
            is_watched: false,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: SpendInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
