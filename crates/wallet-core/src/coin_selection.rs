//! Max-value-age coin selection.
//!
//! Coins are ranked by value multiplied by confirmation depth, so large,
//! well-buried outputs are preferred. Selection stops at the smallest
//! prefix whose total covers the target.

use bitcoin::{OutPoint, ScriptBuf};

use crate::error::WalletError;

/// Hard cap on inputs per transaction.
pub const DEFAULT_MAX_INPUTS: usize = 10_000;

/// A spendable coin: one UTXO joined with its owning address.
#[derive(Debug, Clone)]
pub struct SpendableCoin {
    pub outpoint: OutPoint,
    /// Value in base units.
    pub value: u64,
    /// Confirmation depth; 0 while unconfirmed.
    pub confirmations: u64,
    /// Locking script of the output.
    pub script_pubkey: ScriptBuf,
    /// Owning address.
    pub address: String,
}

impl SpendableCoin {
    /// Selection priority. Unconfirmed coins rank last but remain
    /// spendable.
    fn value_age(&self) -> u128 {
        self.value as u128 * self.confirmations as u128
    }
}

/// Selects coins by descending value-age until `target` is covered.
#[derive(Debug, Clone)]
pub struct MaxValueAgeSelector {
    max_inputs: usize,
}

impl MaxValueAgeSelector {
    pub fn new(max_inputs: usize) -> Self {
        Self { max_inputs }
    }

    /// Returns the smallest priority-ordered set of coins whose total
    /// covers `target`, or [`WalletError::InsufficientFunds`].
    pub fn select(
        &self,
        coins: &[SpendableCoin],
        target: u64,
    ) -> Result<Vec<SpendableCoin>, WalletError> {
        let mut ranked: Vec<&SpendableCoin> = coins.iter().collect();
        ranked.sort_by(|a, b| {
            b.value_age()
                .cmp(&a.value_age())
                .then(b.value.cmp(&a.value))
        });

        let mut selected = Vec::new();
        let mut total: u64 = 0;
        for coin in ranked.into_iter().take(self.max_inputs) {
            selected.push(coin.clone());
            total = total.saturating_add(coin.value);
            if total >= target {
                return Ok(selected);
            }
        }

        Err(WalletError::InsufficientFunds {
            have: coins.iter().map(|c| c.value).sum(),
            need: target,
        })
    }
}

impl Default for MaxValueAgeSelector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUTS)
    }
}
