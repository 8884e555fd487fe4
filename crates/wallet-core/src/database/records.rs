//! Persisted record types and their table mappings.
//!
//! Each record maps one-to-one onto a SQLite table. The [`Record`] trait
//! carries everything the transaction layer needs to save, query, and
//! migrate a model without per-type SQL anywhere else in the crate.

use rusqlite::types::Value;
use rusqlite::Row;

use crate::types::{SpendInfo, WalletTransaction};

/// A persistable model: table name, schema, column order, and conversions
/// to and from a row.
pub trait Record: Sized {
    /// Table name.
    const TABLE: &'static str;

    /// `CREATE TABLE IF NOT EXISTS` statement for this model.
    const CREATE: &'static str;

    /// Column names in the order used by [`Record::bind`] and
    /// [`Record::from_row`].
    const COLUMNS: &'static [&'static str];

    /// Values for an insert, matching [`Record::COLUMNS`].
    fn bind(&self) -> Vec<Value>;

    /// Reconstructs the record from a row selected with
    /// [`Record::COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// One row per supported coin: the account-level extended keys and the
/// encryption parameters for the master private key.
#[derive(Debug, Clone)]
pub struct CoinRecord {
    /// Currency code, e.g. "BTC".
    pub coin: String,
    /// Account extended public key, always plaintext.
    pub master_pub: String,
    /// Account extended private key: plaintext, base64 ciphertext when
    /// `encrypted`, or empty for a watch-only wallet.
    pub master_priv: String,
    /// Whether `master_priv` is ciphertext.
    pub encrypted: bool,
    /// PBKDF2 salt (empty unless encrypted).
    pub kdf_salt: Vec<u8>,
    /// PBKDF2 round count.
    pub kdf_rounds: u32,
    /// Derived key length in bytes.
    pub kdf_key_len: u32,
    /// Wallet creation time (unix seconds); rescans never look further back.
    pub birthday: i64,
    /// Best block hash seen by this wallet.
    pub best_block_hash: String,
    /// Best block height seen by this wallet.
    pub best_block_height: i64,
}

impl Record for CoinRecord {
    const TABLE: &'static str = "coins";

    const CREATE: &'static str = "CREATE TABLE IF NOT EXISTS coins (
        coin TEXT PRIMARY KEY,
        master_pub TEXT NOT NULL,
        master_priv TEXT NOT NULL,
        encrypted INTEGER NOT NULL,
        kdf_salt BLOB NOT NULL,
        kdf_rounds INTEGER NOT NULL,
        kdf_key_len INTEGER NOT NULL,
        birthday INTEGER NOT NULL,
        best_block_hash TEXT NOT NULL,
        best_block_height INTEGER NOT NULL
    )";

    const COLUMNS: &'static [&'static str] = &[
        "coin",
        "master_pub",
        "master_priv",
        "encrypted",
        "kdf_salt",
        "kdf_rounds",
        "kdf_key_len",
        "birthday",
        "best_block_hash",
        "best_block_height",
    ];

    fn bind(&self) -> Vec<Value> {
        vec![
            self.coin.clone().into(),
            self.master_pub.clone().into(),
            self.master_priv.clone().into(),
            (self.encrypted as i64).into(),
            self.kdf_salt.clone().into(),
            (self.kdf_rounds as i64).into(),
            (self.kdf_key_len as i64).into(),
            self.birthday.into(),
            self.best_block_hash.clone().into(),
            self.best_block_height.into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            coin: row.get(0)?,
            master_pub: row.get(1)?,
            master_priv: row.get(2)?,
            encrypted: row.get::<_, i64>(3)? != 0,
            kdf_salt: row.get(4)?,
            kdf_rounds: row.get::<_, i64>(5)? as u32,
            kdf_key_len: row.get::<_, i64>(6)? as u32,
            birthday: row.get(7)?,
            best_block_hash: row.get(8)?,
            best_block_height: row.get(9)?,
        })
    }
}

/// One row per issued address. Per (coin, chain) the key indices form a
/// contiguous prefix except for indices skipped by invalid BIP32 children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: String,
    pub key_index: u32,
    /// false = external receive chain, true = internal change chain.
    pub is_change: bool,
    pub used: bool,
    pub coin: String,
}

impl Record for AddressRecord {
    const TABLE: &'static str = "addresses";

    const CREATE: &'static str = "CREATE TABLE IF NOT EXISTS addresses (
        address TEXT NOT NULL,
        key_index INTEGER NOT NULL,
        is_change INTEGER NOT NULL,
        used INTEGER NOT NULL,
        coin TEXT NOT NULL,
        PRIMARY KEY (coin, address)
    )";

    const COLUMNS: &'static [&'static str] =
        &["address", "key_index", "is_change", "used", "coin"];

    fn bind(&self) -> Vec<Value> {
        vec![
            self.address.clone().into(),
            (self.key_index as i64).into(),
            (self.is_change as i64).into(),
            (self.used as i64).into(),
            self.coin.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            key_index: row.get::<_, i64>(1)? as u32,
            is_change: row.get::<_, i64>(2)? != 0,
            used: row.get::<_, i64>(3)? != 0,
            coin: row.get(4)?,
        })
    }
}

/// One row per unspent output paying an owned address. Spending deletes
/// the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRecord {
    /// Encoded outpoint (see [`crate::types::encode_outpoint`]).
    pub outpoint: String,
    pub address: String,
    /// Amount in base units.
    pub amount: i64,
    /// Confirmation height, 0 while unconfirmed.
    pub height: i64,
    pub coin: String,
}

impl Record for UtxoRecord {
    const TABLE: &'static str = "utxos";

    const CREATE: &'static str = "CREATE TABLE IF NOT EXISTS utxos (
        outpoint TEXT NOT NULL,
        address TEXT NOT NULL,
        amount INTEGER NOT NULL,
        height INTEGER NOT NULL,
        coin TEXT NOT NULL,
        PRIMARY KEY (coin, outpoint)
    )";

    const COLUMNS: &'static [&'static str] = &["outpoint", "address", "amount", "height", "coin"];

    fn bind(&self) -> Vec<Value> {
        vec![
            self.outpoint.clone().into(),
            self.address.clone().into(),
            self.amount.into(),
            self.height.into(),
            self.coin.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            outpoint: row.get(0)?,
            address: row.get(1)?,
            amount: row.get(2)?,
            height: row.get(3)?,
            coin: row.get(4)?,
        })
    }
}

/// One row per transaction touching an owned or watched address. Immutable
/// once stored except for height promotion on first confirmation.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub txid: String,
    pub coin: String,
    /// Confirmation height, 0 while unconfirmed.
    pub height: i64,
    /// JSON-encoded input [`SpendInfo`] list.
    pub inputs: String,
    /// JSON-encoded output [`SpendInfo`] list.
    pub outputs: String,
}

impl TxRecord {
    pub fn from_transaction(coin: &str, tx: &WalletTransaction) -> Result<Self, serde_json::Error> {
        Ok(Self {
            txid: tx.id.clone(),
            coin: coin.to_string(),
            height: tx.height as i64,
            inputs: serde_json::to_string(&tx.from)?,
            outputs: serde_json::to_string(&tx.to)?,
        })
    }

    pub fn to_transaction(&self) -> Result<WalletTransaction, serde_json::Error> {
        let from: Vec<SpendInfo> = serde_json::from_str(&self.inputs)?;
        let to: Vec<SpendInfo> = serde_json::from_str(&self.outputs)?;
        Ok(WalletTransaction {
            id: self.txid.clone(),
            from,
            to,
            height: self.height.max(0) as u64,
        })
    }
}

impl Record for TxRecord {
    const TABLE: &'static str = "transactions";

    const CREATE: &'static str = "CREATE TABLE IF NOT EXISTS transactions (
        txid TEXT NOT NULL,
        coin TEXT NOT NULL,
        height INTEGER NOT NULL,
        inputs TEXT NOT NULL,
        outputs TEXT NOT NULL,
        PRIMARY KEY (coin, txid)
    )";

    const COLUMNS: &'static [&'static str] = &["txid", "coin", "height", "inputs", "outputs"];

    fn bind(&self) -> Vec<Value> {
        vec![
            self.txid.clone().into(),
            self.coin.clone().into(),
            self.height.into(),
            self.inputs.clone().into(),
            self.outputs.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            txid: row.get(0)?,
            coin: row.get(1)?,
            height: row.get(2)?,
            inputs: row.get(3)?,
            outputs: row.get(4)?,
        })
    }
}

/// A non-owned address the wallet still reports activity on (escrow
/// addresses in particular).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedAddressRecord {
    pub address: String,
    pub coin: String,
}

impl Record for WatchedAddressRecord {
    const TABLE: &'static str = "watched_addresses";

    const CREATE: &'static str = "CREATE TABLE IF NOT EXISTS watched_addresses (
        address TEXT NOT NULL,
        coin TEXT NOT NULL,
        PRIMARY KEY (coin, address)
    )";

    const COLUMNS: &'static [&'static str] = &["address", "coin"];

    fn bind(&self) -> Vec<Value> {
        vec![self.address.clone().into(), self.coin.clone().into()]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            coin: row.get(1)?,
        })
    }
}
