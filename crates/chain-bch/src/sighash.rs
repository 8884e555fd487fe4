//! BIP143-style signature hashing with the Bitcoin Cash fork id.
//!
//! After the fork, all Bitcoin Cash signatures commit to the spent output's
//! value using the BIP143 preimage layout, with `SIGHASH_FORKID` (0x40)
//! OR-ed into the sighash type. The upstream sighash cache only exposes the
//! standard types, so the digest is assembled here.

use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Script, Transaction};

use wallet_core::WalletError;

/// `SIGHASH_ALL | SIGHASH_FORKID`, the only type this wallet emits.
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

/// Computes the BIP143+forkid digest for `index`, where the input spends
/// an output locking `value` base units behind `script_code`.
pub fn signature_hash_forkid(
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    value: u64,
    sighash_type: u32,
) -> Result<[u8; 32], WalletError> {
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| WalletError::SigningFailed(format!("no input at index {index}")))?;

    let mut prevouts = Vec::with_capacity(36 * tx.input.len());
    let mut sequences = Vec::with_capacity(4 * tx.input.len());
    for txin in &tx.input {
        encode(&txin.previous_output, &mut prevouts);
        encode(&txin.sequence, &mut sequences);
    }
    let mut outputs = Vec::new();
    for txout in &tx.output {
        encode(txout, &mut outputs);
    }

    let hash_prevouts = sha256d::Hash::hash(&prevouts);
    let hash_sequences = sha256d::Hash::hash(&sequences);
    let hash_outputs = sha256d::Hash::hash(&outputs);

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    encode(&tx.version, &mut preimage);
    preimage.extend_from_slice(hash_prevouts.as_byte_array());
    preimage.extend_from_slice(hash_sequences.as_byte_array());
    encode(&input.previous_output, &mut preimage);
    encode(&script_code.to_owned(), &mut preimage);
    preimage.extend_from_slice(&value.to_le_bytes());
    encode(&input.sequence, &mut preimage);
    preimage.extend_from_slice(hash_outputs.as_byte_array());
    encode(&tx.lock_time, &mut preimage);
    preimage.extend_from_slice(&sighash_type.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}

fn encode<E: Encodable>(value: &E, buf: &mut Vec<u8>) {
    value
        .consensus_encode(buf)
        .expect("in-memory writers don't error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    fn two_input_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![
                TxIn {
                    previous_output: OutPoint::new(Txid::from_byte_array([1; 32]), 0),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                },
                TxIn {
                    previous_output: OutPoint::new(Txid::from_byte_array([2; 32]), 1),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                },
            ],
            output: vec![TxOut {
                value: Amount::from_sat(9_000),
                script_pubkey: ScriptBuf::from(vec![0x51]),
            }],
        }
    }

    #[test]
    fn digest_is_deterministic() {
        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76, 0xa9]);
        let a = signature_hash_forkid(&tx, 0, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        let b = signature_hash_forkid(&tx, 0, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn digest_commits_to_input_index() {
        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76, 0xa9]);
        let a = signature_hash_forkid(&tx, 0, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        let b = signature_hash_forkid(&tx, 1, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn digest_commits_to_spent_value() {
        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76, 0xa9]);
        let a = signature_hash_forkid(&tx, 0, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        let b = signature_hash_forkid(&tx, 0, &script, 10_001, SIGHASH_ALL_FORKID).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn digest_commits_to_fork_id() {
        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76, 0xa9]);
        let with_fork = signature_hash_forkid(&tx, 0, &script, 10_000, SIGHASH_ALL_FORKID).unwrap();
        let without = signature_hash_forkid(&tx, 0, &script, 10_000, 0x01).unwrap();
        assert_ne!(with_fork, without);
    }

    #[test]
    fn out_of_range_index_fails() {
        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76]);
        let err = signature_hash_forkid(&tx, 5, &script, 1, SIGHASH_ALL_FORKID).unwrap_err();
        assert!(matches!(err, WalletError::SigningFailed(_)));
    }

    #[test]
    fn matches_upstream_segwit_digest_for_all_type() {
        // With the fork bit stripped, the preimage is plain BIP143; the
        // upstream cache must agree.
        use bitcoin::sighash::{EcdsaSighashType, SighashCache};

        let tx = two_input_tx();
        let script = ScriptBuf::from(vec![0x76, 0xa9, 0x14, 0xaa, 0xbb]);
        let ours = signature_hash_forkid(&tx, 0, &script, 25_000, 0x01).unwrap();

        let mut cache = SighashCache::new(&tx);
        let theirs = cache
            .p2wsh_signature_hash(0, &script, Amount::from_sat(25_000), EcdsaSighashType::All)
            .unwrap();
        assert_eq!(ours, theirs.to_byte_array());
    }
}
