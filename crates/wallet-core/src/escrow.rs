//! Threshold escrow scripts and signature aggregation.
//!
//! Two redeem-script shapes are produced:
//!
//! ```text
//! OP_M <pk1> … <pkN> OP_N OP_CHECKMULTISIG
//!
//! OP_IF
//!     OP_M <pk1> … <pkN> OP_N OP_CHECKMULTISIG
//! OP_ELSE
//!     <sequence> OP_CHECKSEQUENCEVERIFY OP_DROP <timeoutKey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Keys are inserted in caller order and never reordered, so two parties
//! constructing the script from the same key list derive the same address.
//! The `<sequence>` is the BIP68 relative-time encoding of the timeout in
//! 512-second units.

use std::time::Duration;

use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF,
};
use bitcoin::opcodes::{Class, ClassifyContext};
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Amount, CompressedPublicKey, PrivateKey, Script, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};

use crate::adapter::{CoinAdapter, EscrowSpendPath};
use crate::builder::bip69_sort;
use crate::error::WalletError;
use crate::types::{decode_outpoint, EscrowSignature, WalletTransaction};

/// Builds a plain `m`-of-`n` multisig redeem script with keys in caller
/// order.
pub fn multisig_redeem_script(
    keys: &[CompressedPublicKey],
    threshold: usize,
) -> Result<ScriptBuf, WalletError> {
    if threshold > keys.len() {
        return Err(WalletError::ThresholdExceedsKeys {
            threshold,
            keys: keys.len(),
        });
    }
    let mut builder = Builder::new().push_int(threshold as i64);
    for key in keys {
        builder = builder.push_slice(key.to_bytes());
    }
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Builds an `m`-of-`n` redeem script with a timeout-recovery branch
/// spendable by `timeout_key` once the BIP68 relative lock has expired.
pub fn timeout_redeem_script(
    keys: &[CompressedPublicKey],
    threshold: usize,
    timeout: Duration,
    timeout_key: &CompressedPublicKey,
) -> Result<ScriptBuf, WalletError> {
    if threshold > keys.len() {
        return Err(WalletError::ThresholdExceedsKeys {
            threshold,
            keys: keys.len(),
        });
    }
    let sequence = timeout_sequence(timeout);
    let mut builder = Builder::new()
        .push_opcode(OP_IF)
        .push_int(threshold as i64);
    for key in keys {
        builder = builder.push_slice(key.to_bytes());
    }
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(sequence.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_slice(timeout_key.to_bytes())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script())
}

/// Encodes `timeout` as a BIP68 relative-time lock in 512-second units,
/// rounded up. Durations past the encodable maximum saturate.
pub fn timeout_sequence(timeout: Duration) -> Sequence {
    let intervals = timeout.as_secs().div_ceil(512).min(u16::MAX as u64);
    Sequence::from_512_second_intervals(intervals as u16)
}

/// Decoded contents of an escrow redeem script.
#[derive(Debug, Clone)]
pub struct RedeemInfo {
    pub threshold: usize,
    pub keys: Vec<PublicKey>,
    /// The timeout branch, when present: sequence lock and recovery key.
    pub timeout: Option<(Sequence, PublicKey)>,
}

/// Parses a redeem script previously produced by
/// [`multisig_redeem_script`] or [`timeout_redeem_script`].
pub fn parse_redeem_script(script: &Script) -> Result<RedeemInfo, WalletError> {
    let mut instructions = Vec::new();
    for item in script.instructions() {
        instructions
            .push(item.map_err(|e| WalletError::CorruptRecord(format!("redeem script: {e}")))?);
    }

    let has_timeout = matches!(instructions.first(), Some(Instruction::Op(op)) if *op == OP_IF);
    let mut cursor = if has_timeout { 1 } else { 0 };

    let threshold = expect_num(&instructions, &mut cursor)?;
    let mut keys = Vec::new();
    while let Some(key) = peek_key(&instructions, cursor) {
        keys.push(key?);
        cursor += 1;
    }
    let count = expect_num(&instructions, &mut cursor)?;
    if count as usize != keys.len() || threshold < 0 || threshold as usize > keys.len() {
        return Err(WalletError::CorruptRecord(
            "redeem script key count mismatch".into(),
        ));
    }
    expect_op(&instructions, &mut cursor, OP_CHECKMULTISIG)?;

    let timeout = if has_timeout {
        expect_op(&instructions, &mut cursor, OP_ELSE)?;
        let sequence = expect_num(&instructions, &mut cursor)?;
        expect_op(&instructions, &mut cursor, OP_CSV)?;
        expect_op(&instructions, &mut cursor, OP_DROP)?;
        let key = peek_key(&instructions, cursor)
            .ok_or_else(|| WalletError::CorruptRecord("missing timeout key".into()))??;
        cursor += 1;
        expect_op(&instructions, &mut cursor, OP_CHECKSIG)?;
        expect_op(&instructions, &mut cursor, OP_ENDIF)?;
        Some((Sequence(sequence as u32), key))
    } else {
        None
    };

    Ok(RedeemInfo {
        threshold: threshold as usize,
        keys,
        timeout,
    })
}

/// Builds the canonical spending transaction for an escrow operation from
/// the host-supplied transfer description. Inputs and outputs are BIP69
/// sorted so every signer derives an identical transaction.
///
/// Returns the transaction and the spent value of each input, aligned by
/// index.
pub fn escrow_transaction(
    txn: &WalletTransaction,
    adapter: &dyn CoinAdapter,
    sequence: Sequence,
) -> Result<(Transaction, Vec<u64>), WalletError> {
    if txn.from.is_empty() || txn.to.is_empty() {
        return Err(WalletError::SigningFailed(
            "escrow transaction needs at least one input and output".into(),
        ));
    }

    let mut inputs = Vec::with_capacity(txn.from.len());
    for info in &txn.from {
        inputs.push(TxIn {
            previous_output: decode_outpoint(&info.outpoint)?,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        });
    }

    let mut outputs = Vec::with_capacity(txn.to.len());
    for info in &txn.to {
        outputs.push(TxOut {
            value: Amount::from_sat(info.amount),
            script_pubkey: adapter.script_pubkey(&info.address)?,
        });
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs,
        output: outputs,
    };
    bip69_sort(&mut tx);

    // Align input values with the sorted input order.
    let mut values = Vec::with_capacity(tx.input.len());
    for txin in &tx.input {
        let info = txn
            .from
            .iter()
            .find(|i| decode_outpoint(&i.outpoint).ok() == Some(txin.previous_output))
            .ok_or_else(|| WalletError::SigningFailed("input value lookup failed".into()))?;
        values.push(info.amount);
    }
    Ok((tx, values))
}

/// Produces one escrow signature per input using `key`.
pub fn sign_multisig_transaction(
    adapter: &dyn CoinAdapter,
    txn: &WalletTransaction,
    key: &PrivateKey,
    redeem: &Script,
) -> Result<Vec<EscrowSignature>, WalletError> {
    let (tx, values) = escrow_transaction(txn, adapter, Sequence::MAX)?;
    let secp = Secp256k1::new();

    let mut signatures = Vec::with_capacity(tx.input.len());
    for (index, value) in values.iter().enumerate() {
        let digest = adapter.escrow_sighash(&tx, index, redeem, *value)?;
        let sig = secp.sign_ecdsa(&Message::from_digest(digest), &key.inner);
        let mut bytes = sig.serialize_der().to_vec();
        bytes.push(adapter.sighash_suffix());
        signatures.push(EscrowSignature {
            index: index as u32,
            signature: bytes,
        });
    }
    Ok(signatures)
}

/// Merges per-signer signature sets (outer slice = signer, inner = input)
/// into a fully signed threshold spend.
///
/// Signatures are matched to redeem-script keys by verification, so
/// CHECKMULTISIG sees them in key order regardless of which signer supplied
/// which signature.
pub fn aggregate_multisig_spend(
    adapter: &dyn CoinAdapter,
    txn: &WalletTransaction,
    signatures: &[Vec<EscrowSignature>],
    redeem: &Script,
) -> Result<Transaction, WalletError> {
    let info = parse_redeem_script(redeem)?;
    let (mut tx, values) = escrow_transaction(txn, adapter, Sequence::MAX)?;
    let secp = Secp256k1::verification_only();

    for index in 0..tx.input.len() {
        let digest = adapter.escrow_sighash(&tx, index, redeem, values[index])?;
        let message = Message::from_digest(digest);

        let provided: Vec<&[u8]> = signatures
            .iter()
            .flat_map(|signer| signer.iter())
            .filter(|s| s.index == index as u32 && !s.signature.is_empty())
            .map(|s| s.signature.as_slice())
            .collect();
        if provided.len() < info.threshold {
            return Err(WalletError::SigningFailed(format!(
                "input {index} has {} of {} required signatures",
                provided.len(),
                info.threshold
            )));
        }

        // Order signatures to match the key order in the redeem script.
        let mut ordered: Vec<Vec<u8>> = Vec::with_capacity(info.threshold);
        for key in &info.keys {
            if ordered.len() == info.threshold {
                break;
            }
            for sig in &provided {
                let der = &sig[..sig.len() - 1];
                if let Ok(parsed) = ecdsa::Signature::from_der(der) {
                    if secp.verify_ecdsa(&message, &parsed, key).is_ok() {
                        ordered.push(sig.to_vec());
                        break;
                    }
                }
            }
        }
        if ordered.len() < info.threshold {
            return Err(WalletError::SigningFailed(
                "signatures do not match the escrow keys".into(),
            ));
        }

        adapter.apply_escrow_signatures(
            &mut tx,
            index,
            &ordered,
            redeem,
            EscrowSpendPath::Threshold {
                with_selector: info.timeout.is_some(),
            },
        )?;
    }
    Ok(tx)
}

/// Signs every input with the timeout key and assembles the recovery-path
/// spend. The inputs carry the redeem script's sequence lock so
/// OP_CHECKSEQUENCEVERIFY passes once the lock has matured.
pub fn timeout_spend(
    adapter: &dyn CoinAdapter,
    txn: &WalletTransaction,
    timeout_key: &PrivateKey,
    redeem: &Script,
) -> Result<Transaction, WalletError> {
    let info = parse_redeem_script(redeem)?;
    let (sequence, _) = info.timeout.ok_or_else(|| {
        WalletError::SigningFailed("redeem script has no timeout branch".into())
    })?;

    let (mut tx, values) = escrow_transaction(txn, adapter, sequence)?;
    let secp = Secp256k1::new();
    for index in 0..tx.input.len() {
        let digest = adapter.escrow_sighash(&tx, index, redeem, values[index])?;
        let sig = secp.sign_ecdsa(&Message::from_digest(digest), &timeout_key.inner);
        let mut bytes = sig.serialize_der().to_vec();
        bytes.push(adapter.sighash_suffix());
        adapter.apply_escrow_signatures(
            &mut tx,
            index,
            &[bytes],
            redeem,
            EscrowSpendPath::Timeout,
        )?;
    }
    Ok(tx)
}

fn expect_num(instructions: &[Instruction<'_>], cursor: &mut usize) -> Result<i64, WalletError> {
    let instr = instructions
        .get(*cursor)
        .ok_or_else(|| WalletError::CorruptRecord("redeem script truncated".into()))?;
    *cursor += 1;
    match instr {
        Instruction::Op(op) => match op.classify(ClassifyContext::Legacy) {
            Class::PushNum(n) => Ok(n as i64),
            _ => Err(WalletError::CorruptRecord(format!(
                "expected number, found {op}"
            ))),
        },
        Instruction::PushBytes(bytes) => Ok(decode_scriptnum(bytes.as_bytes())),
    }
}

fn expect_op(
    instructions: &[Instruction<'_>],
    cursor: &mut usize,
    expected: bitcoin::Opcode,
) -> Result<(), WalletError> {
    match instructions.get(*cursor) {
        Some(Instruction::Op(op)) if *op == expected => {
            *cursor += 1;
            Ok(())
        }
        _ => Err(WalletError::CorruptRecord(format!(
            "expected {expected} in redeem script"
        ))),
    }
}

/// Returns the 33-byte key push at `cursor`, if that is what sits there.
fn peek_key(
    instructions: &[Instruction<'_>],
    cursor: usize,
) -> Option<Result<PublicKey, WalletError>> {
    match instructions.get(cursor) {
        Some(Instruction::PushBytes(bytes)) if bytes.len() == 33 => Some(
            PublicKey::from_slice(bytes.as_bytes())
                .map_err(|e| WalletError::CorruptRecord(format!("redeem script key: {e}"))),
        ),
        _ => None,
    }
}

/// Minimal CScriptNum decoding: little-endian with a sign bit in the top
/// byte.
fn decode_scriptnum(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as i64) << (8 * i);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        value = -(value & mask);
    }
    value
}

/// A standard-size DER signature plus sighash byte; used when estimating
/// escrow spend sizes.
pub const ESCROW_SIGNATURE_VBYTES: u64 = 73;

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn test_keys(n: usize) -> Vec<CompressedPublicKey> {
        let secp = Secp256k1::new();
        (1..=n as u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk))
            })
            .collect()
    }

    #[test]
    fn multisig_script_is_deterministic() {
        let keys = test_keys(3);
        let a = multisig_redeem_script(&keys, 2).unwrap();
        let b = multisig_redeem_script(&keys, 2).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn multisig_script_preserves_key_order() {
        let keys = test_keys(3);
        let mut reversed = keys.clone();
        reversed.reverse();
        let a = multisig_redeem_script(&keys, 2).unwrap();
        let b = multisig_redeem_script(&reversed, 2).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());

        let parsed = parse_redeem_script(&a).unwrap();
        for (parsed_key, key) in parsed.keys.iter().zip(&keys) {
            assert_eq!(*parsed_key, key.0);
        }
    }

    #[test]
    fn threshold_exceeding_keys_rejected() {
        let keys = test_keys(2);
        let err = multisig_redeem_script(&keys, 3).unwrap_err();
        assert!(matches!(
            err,
            WalletError::ThresholdExceedsKeys {
                threshold: 3,
                keys: 2
            }
        ));
        assert!(timeout_redeem_script(&keys, 3, Duration::from_secs(3600), &keys[0]).is_err());
    }

    #[test]
    fn plain_script_parse_roundtrip() {
        let keys = test_keys(3);
        let script = multisig_redeem_script(&keys, 2).unwrap();
        let info = parse_redeem_script(&script).unwrap();
        assert_eq!(info.threshold, 2);
        assert_eq!(info.keys.len(), 3);
        assert!(info.timeout.is_none());
    }

    #[test]
    fn one_of_two_cancelable_shape() {
        // 1-of-2 is used as a cancelable payment to an offline party.
        let keys = test_keys(2);
        let script = multisig_redeem_script(&keys, 1).unwrap();
        let info = parse_redeem_script(&script).unwrap();
        assert_eq!(info.threshold, 1);
        assert_eq!(info.keys.len(), 2);
    }

    #[test]
    fn timeout_sequence_uses_512s_units_rounded_up() {
        // 24h = 86400s; 86400 / 512 = 168.75, so 169 units.
        let seq = timeout_sequence(Duration::from_secs(24 * 3600));
        assert_eq!(seq, Sequence::from_512_second_intervals(169));
        assert_eq!(seq.to_consensus_u32(), (1 << 22) | 169);

        // Exact multiples do not round.
        let exact = timeout_sequence(Duration::from_secs(1024));
        assert_eq!(exact, Sequence::from_512_second_intervals(2));
    }

    #[test]
    fn timeout_sequence_saturates() {
        let seq = timeout_sequence(Duration::from_secs(u64::MAX));
        assert_eq!(seq, Sequence::from_512_second_intervals(u16::MAX));
    }

    #[test]
    fn timeout_script_parse_roundtrip() {
        let keys = test_keys(3);
        let timeout_key = &test_keys(4)[3];
        let script =
            timeout_redeem_script(&keys, 2, Duration::from_secs(24 * 3600), timeout_key).unwrap();

        let info = parse_redeem_script(&script).unwrap();
        assert_eq!(info.threshold, 2);
        assert_eq!(info.keys.len(), 3);
        let (sequence, recovered_key) = info.timeout.unwrap();
        assert_eq!(sequence, Sequence::from_512_second_intervals(169));
        assert_eq!(recovered_key, timeout_key.0);
    }

    #[test]
    fn timeout_script_is_deterministic() {
        let keys = test_keys(3);
        let tk = &test_keys(4)[3];
        let a = timeout_redeem_script(&keys, 2, Duration::from_secs(7200), tk).unwrap();
        let b = timeout_redeem_script(&keys, 2, Duration::from_secs(7200), tk).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn parse_rejects_garbage() {
        let garbage = ScriptBuf::from(vec![0x01]);
        assert!(parse_redeem_script(&garbage).is_err());

        let empty = ScriptBuf::new();
        assert!(parse_redeem_script(&empty).is_err());
    }

    #[test]
    fn scriptnum_decoding() {
        assert_eq!(decode_scriptnum(&[]), 0);
        assert_eq!(decode_scriptnum(&[0x01]), 1);
        assert_eq!(decode_scriptnum(&[0xa9, 0x00]), 169);
        assert_eq!(decode_scriptnum(&[0xa9, 0x00, 0x40]), 0x4000a9);
        assert_eq!(decode_scriptnum(&[0x81]), -1);
        assert_eq!(decode_scriptnum(&[0xff, 0x00]), 255);
    }
}
