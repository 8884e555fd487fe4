//! Transaction authoring: coin gathering, iterative fee sizing, change
//! creation, BIP69 canonical ordering, and per-input signing.

use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::Xpriv;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::adapter::CoinAdapter;
use crate::coin_selection::{MaxValueAgeSelector, SpendableCoin};
use crate::database::records::UtxoRecord;
use crate::database::Tx;
use crate::error::WalletError;
use crate::keychain::Keychain;
use crate::types::{decode_outpoint, FeeLevel};

/// A fully authored spend, ready for broadcast and ingestion.
pub struct SpendOutcome {
    /// The transaction; signed unless authored for fee estimation.
    pub tx: Transaction,
    /// Fee paid, in base units.
    pub fee: u64,
    /// Total value of the selected inputs.
    pub total_in: u64,
    /// Change amount, 0 when the remainder was donated to fee.
    pub change: u64,
    /// Address receiving the change output, if any.
    pub change_address: Option<String>,
    /// The coins consumed by this spend.
    pub spent: Vec<SpendableCoin>,
}

/// A spendable coin joined with its derived signing key.
struct GatheredCoin {
    coin: SpendableCoin,
    key: Option<PrivateKey>,
}

/// Builds and (optionally) signs a transaction paying `amount` to `dest`.
///
/// The fee is sized iteratively: selection at an estimated input count
/// changes the size, which changes the fee, which may change the
/// selection; the loop runs until the input count is stable.
#[allow(clippy::too_many_arguments)]
pub fn build_spend(
    dbtx: &Tx<'_>,
    keychain: &Keychain,
    adapter: &dyn CoinAdapter,
    best_height: u64,
    amount: u64,
    dest: &str,
    level: FeeLevel,
    account_priv: Option<&Xpriv>,
    sign: bool,
) -> Result<SpendOutcome, WalletError> {
    let dest_script = adapter.script_pubkey(dest)?;
    if adapter.is_dust(amount, &dest_script) {
        return Err(WalletError::DustOutput(amount));
    }

    let gathered = gather_coins(dbtx, keychain, adapter, best_height, sign, account_priv)?;
    let coins: Vec<SpendableCoin> = gathered.iter().map(|g| g.coin.clone()).collect();
    let rate = adapter.fee_per_byte(level);
    let selector = MaxValueAgeSelector::default();

    // Iterate until the fee implied by the selection's size no longer
    // changes the selection itself.
    let mut input_count = 1usize;
    let mut selected;
    let mut fee;
    loop {
        fee = estimated_vsize(adapter, input_count, 2) * rate;
        selected = selector.select(&coins, amount.saturating_add(fee))?;
        if selected.len() == input_count {
            break;
        }
        input_count = selected.len();
    }

    let total_in: u64 = selected.iter().map(|c| c.value).sum();
    let remainder = total_in - amount - fee;

    // Pay change to the internal chain unless the remainder is dust, in
    // which case it is donated to fee.
    let change_chain = !keychain.external_only();
    let change_address = keychain.current_address_in(dbtx, change_chain)?;
    let change_script = adapter.script_pubkey(&change_address)?;
    let change = if remainder > 0 && !adapter.is_dust(remainder, &change_script) {
        remainder
    } else {
        fee += remainder;
        0
    };

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: dest_script,
    }];
    if change > 0 {
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_script,
        });
    }

    let mut tx = assemble(&selected, outputs);
    if sign {
        sign_inputs(&mut tx, &gathered, adapter)?;
    }

    Ok(SpendOutcome {
        tx,
        fee,
        total_in,
        change,
        change_address: (change > 0).then_some(change_address),
        spent: selected,
    })
}

/// Builds and signs a transaction sweeping every UTXO to `dest`, fee
/// subtracted from the swept total.
pub fn build_sweep(
    dbtx: &Tx<'_>,
    keychain: &Keychain,
    adapter: &dyn CoinAdapter,
    best_height: u64,
    dest: &str,
    level: FeeLevel,
    account_priv: Option<&Xpriv>,
) -> Result<SpendOutcome, WalletError> {
    let dest_script = adapter.script_pubkey(dest)?;
    let gathered = gather_coins(dbtx, keychain, adapter, best_height, true, account_priv)?;
    if gathered.is_empty() {
        return Err(WalletError::InsufficientFunds { have: 0, need: 0 });
    }

    let total_in: u64 = gathered.iter().map(|g| g.coin.value).sum();
    let fee = estimated_vsize(adapter, gathered.len(), 1) * adapter.fee_per_byte(level);
    let amount = total_in.checked_sub(fee).ok_or(WalletError::InsufficientFunds {
        have: total_in,
        need: fee,
    })?;
    if adapter.is_dust(amount, &dest_script) {
        return Err(WalletError::DustOutput(amount));
    }

    let selected: Vec<SpendableCoin> = gathered.iter().map(|g| g.coin.clone()).collect();
    let outputs = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: dest_script,
    }];

    let mut tx = assemble(&selected, outputs);
    sign_inputs(&mut tx, &gathered, adapter)?;

    Ok(SpendOutcome {
        tx,
        fee,
        total_in,
        change: 0,
        change_address: None,
        spent: selected,
    })
}

/// Estimated virtual size for a spend with the given shape.
pub fn estimated_vsize(adapter: &dyn CoinAdapter, inputs: usize, outputs: usize) -> u64 {
    adapter.tx_overhead_vbytes()
        + inputs as u64 * adapter.input_vbytes()
        + outputs as u64 * adapter.output_vbytes()
}

/// Sorts inputs by (previous txid, output index) and outputs by
/// (amount, locking script), both ascending, per BIP69.
pub fn bip69_sort(tx: &mut Transaction) {
    tx.input.sort_by(|a, b| {
        a.previous_output
            .txid
            .to_string()
            .cmp(&b.previous_output.txid.to_string())
            .then(a.previous_output.vout.cmp(&b.previous_output.vout))
    });
    tx.output.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

/// Enumerates every UTXO joined with its owning address, and (when
/// `with_keys`) the derived private key for that address.
fn gather_coins(
    dbtx: &Tx<'_>,
    keychain: &Keychain,
    adapter: &dyn CoinAdapter,
    best_height: u64,
    with_keys: bool,
    account_priv: Option<&Xpriv>,
) -> Result<Vec<GatheredCoin>, WalletError> {
    let utxos: Vec<UtxoRecord> =
        dbtx.find_where(&[("coin", adapter.currency_code().to_string().into())])?;

    let mut out = Vec::with_capacity(utxos.len());
    for record in utxos {
        let outpoint = decode_outpoint(&record.outpoint)?;
        let script_pubkey = adapter.script_pubkey(&record.address)?;
        let confirmations = if record.height > 0 {
            best_height.saturating_sub(record.height as u64) + 1
        } else {
            0
        };
        let key = if with_keys {
            let xpriv = keychain.key_for_address_in(dbtx, &record.address, account_priv)?;
            Some(xpriv.to_priv())
        } else {
            None
        };
        out.push(GatheredCoin {
            coin: SpendableCoin {
                outpoint,
                value: record.amount.max(0) as u64,
                confirmations,
                script_pubkey,
                address: record.address,
            },
            key,
        });
    }
    Ok(out)
}

fn assemble(selected: &[SpendableCoin], outputs: Vec<TxOut>) -> Transaction {
    let inputs = selected
        .iter()
        .map(|coin| TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        })
        .collect();

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: outputs,
    };
    bip69_sort(&mut tx);
    tx
}

fn sign_inputs(
    tx: &mut Transaction,
    gathered: &[GatheredCoin],
    adapter: &dyn CoinAdapter,
) -> Result<(), WalletError> {
    let by_outpoint: HashMap<OutPoint, &GatheredCoin> =
        gathered.iter().map(|g| (g.coin.outpoint, g)).collect();

    for index in 0..tx.input.len() {
        let outpoint = tx.input[index].previous_output;
        let gathered = by_outpoint.get(&outpoint).ok_or_else(|| {
            WalletError::SigningFailed(format!("no coin for input {outpoint}"))
        })?;
        let key = gathered
            .key
            .as_ref()
            .ok_or_else(|| WalletError::SigningFailed("missing signing key".into()))?;
        let script = gathered.coin.script_pubkey.clone();
        adapter.sign_input(tx, index, &script, gathered.coin.value, key)?;
    }
    Ok(())
}
