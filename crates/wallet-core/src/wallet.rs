//! The wallet façade: assembles the keychain, store, builder, and escrow
//! layers into the host-visible operations.
//!
//! All spend-shaped operations take an open database [`Tx`] owned by the
//! host. The wallet stages its own mutations as an `on_commit` hook over
//! validated values: if the host rolls the transaction back nothing
//! happened, and the network broadcast only ever runs after the local
//! commit is durable.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{CompressedPublicKey, PrivateKey, Script, Transaction};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::adapter::CoinAdapter;
use crate::builder::{self, SpendOutcome};
use crate::chain_client::{ChainClient, ChainEvent};
use crate::database::records::{
    AddressRecord, CoinRecord, TxRecord, UtxoRecord, WatchedAddressRecord,
};
use crate::database::{Database, Tx};
use crate::error::WalletError;
use crate::escrow;
use crate::keychain::{AddressFunc, Keychain, KeychainConfig};
use crate::types::{
    decode_outpoint, encode_outpoint, BlockInfo, EscrowSignature, FeeLevel, SpendInfo,
    WalletTransaction,
};

/// Wallet construction options.
#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    pub keychain: KeychainConfig,
}

#[derive(Default)]
struct WalletState {
    best_block: BlockInfo,
    tx_subscribers: Vec<tokio::sync::mpsc::UnboundedSender<WalletTransaction>>,
    block_subscribers: Vec<tokio::sync::mpsc::UnboundedSender<BlockInfo>>,
}

struct WalletInner {
    db: Arc<Database>,
    adapter: Arc<dyn CoinAdapter>,
    client: Arc<dyn ChainClient>,
    keychain: Keychain,
    state: RwLock<WalletState>,
}

/// A single coin's wallet.
pub struct Wallet {
    inner: Arc<WalletInner>,
}

impl Wallet {
    /// Whether a wallet has been created for `coin` in this database.
    pub fn exists(db: &Database, coin: &str) -> Result<bool, WalletError> {
        db.update(|tx| tx.migrate::<CoinRecord>())?;
        let records: Vec<CoinRecord> =
            db.view(|tx| tx.find_where(&[("coin", coin.to_string().into())]))?;
        Ok(!records.is_empty())
    }

    /// Creates the wallet from an externally supplied account-level
    /// extended key (`m/44'/coin'/account'`), private or public. A
    /// passphrase immediately encrypts the master private key at rest.
    pub fn create(
        db: &Database,
        adapter: &dyn CoinAdapter,
        account_key: &str,
        passphrase: Option<&[u8]>,
        birthday: i64,
    ) -> Result<(), WalletError> {
        let coin = adapter.currency_code();
        if Self::exists(db, coin)? {
            return Err(WalletError::WalletLocked(format!(
                "wallet for {coin} already exists"
            )));
        }

        let secp = Secp256k1::new();
        let (master_pub, master_priv) = match Xpriv::from_str(account_key) {
            Ok(account) => (Xpub::from_priv(&secp, &account).to_string(), account.to_string()),
            Err(_) => {
                let account = Xpub::from_str(account_key).map_err(|e| {
                    WalletError::KeyDerivation(format!("account key does not parse: {e}"))
                })?;
                (account.to_string(), String::new())
            }
        };

        let mut record = CoinRecord {
            coin: coin.to_string(),
            master_pub,
            master_priv,
            encrypted: false,
            kdf_salt: Vec::new(),
            kdf_rounds: 0,
            kdf_key_len: 0,
            birthday,
            best_block_hash: String::new(),
            best_block_height: 0,
        };

        if let Some(passphrase) = passphrase {
            if !record.master_priv.is_empty() {
                let cipher =
                    crypto_utils::encryption::encrypt(record.master_priv.as_bytes(), passphrase)?;
                record.master_priv = cipher.cipher_b64;
                record.encrypted = true;
                record.kdf_salt = cipher.salt.to_vec();
                record.kdf_rounds = cipher.rounds;
                record.kdf_key_len = cipher.key_len;
            }
        }

        db.update(|tx| {
            tx.migrate::<CoinRecord>()?;
            tx.migrate::<AddressRecord>()?;
            tx.migrate::<UtxoRecord>()?;
            tx.migrate::<TxRecord>()?;
            tx.migrate::<WatchedAddressRecord>()?;
            tx.save(&record)
        })?;
        info!(coin, "wallet created");
        Ok(())
    }

    /// Opens the wallet: loads the coin record, restores the look-ahead
    /// window, and starts consuming chain-client events.
    pub fn open(
        db: Arc<Database>,
        adapter: Arc<dyn CoinAdapter>,
        client: Arc<dyn ChainClient>,
        config: WalletConfig,
    ) -> Result<Self, WalletError> {
        db.update(|tx| {
            tx.migrate::<CoinRecord>()?;
            tx.migrate::<AddressRecord>()?;
            tx.migrate::<UtxoRecord>()?;
            tx.migrate::<TxRecord>()?;
            tx.migrate::<WatchedAddressRecord>()
        })?;

        let addr_func: AddressFunc = {
            let adapter = Arc::clone(&adapter);
            Arc::new(move |key: &Xpub| adapter.address_from_key(key))
        };
        let keychain = Keychain::new(
            Arc::clone(&db),
            adapter.currency_code(),
            addr_func,
            config.keychain,
        )?;

        let record: CoinRecord = db.view(|tx| {
            tx.find_first(
                &[("coin", adapter.currency_code().to_string().into())],
                "coin ASC",
            )
        })?;

        let inner = Arc::new(WalletInner {
            db,
            adapter,
            client,
            keychain,
            state: RwLock::new(WalletState {
                best_block: BlockInfo {
                    hash: record.best_block_hash,
                    height: record.best_block_height.max(0) as u64,
                },
                ..Default::default()
            }),
        });

        // Catch up with the chain tip if the client already knows a better
        // one than we persisted.
        if let Ok(tip) = inner.client.best_block() {
            if tip.height > inner.state.read().best_block.height {
                inner.process_block(tip)?;
            }
        }

        let mut events = inner.client.subscribe();
        let weak = Arc::downgrade(&inner);
        std::thread::spawn(move || {
            while let Some(event) = events.blocking_recv() {
                let Some(inner) = weak.upgrade() else { break };
                let result = match event {
                    ChainEvent::Transaction(tx) => inner.ingest(tx),
                    ChainEvent::Block(block) => inner.process_block(block),
                };
                if let Err(e) = result {
                    warn!(error = %e, "chain event processing failed");
                }
            }
            debug!("chain event stream closed");
        });

        Ok(Self { inner })
    }

    /// Zeroizes in-memory key material and stops publishing to
    /// subscribers.
    pub fn close(self) {
        self.inner.keychain.lock();
        let mut state = self.inner.state.write();
        state.tx_subscribers.clear();
        state.block_subscribers.clear();
    }

    /// The database this wallet persists to; the host opens manual
    /// transactions here to frame spend operations.
    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn currency_code(&self) -> &'static str {
        self.inner.adapter.currency_code()
    }

    // ── Addresses ────────────────────────────────────────────────────

    /// The first unused address on the external (or internal) chain.
    pub fn current_address(&self, change: bool) -> Result<String, WalletError> {
        self.inner.keychain.current_address(change)
    }

    /// A never-before-returned address, for host-assigned single-use
    /// receive addresses.
    pub fn new_address(&self, change: bool) -> Result<String, WalletError> {
        self.inner.keychain.new_address(change)
    }

    pub fn validate_address(&self, addr: &str) -> Result<(), WalletError> {
        self.inner.adapter.validate_address(addr)
    }

    pub fn has_key(&self, addr: &str) -> Result<bool, WalletError> {
        self.inner.keychain.has_key(addr)
    }

    /// Adds a non-owned address to the watched set; transactions paying it
    /// are stored and published, but never counted in the balance.
    pub fn watch_address(&self, dbtx: &mut Tx<'_>, addr: &str) -> Result<(), WalletError> {
        self.inner.adapter.validate_address(addr)?;
        dbtx.save(&WatchedAddressRecord {
            address: addr.to_string(),
            coin: self.inner.adapter.currency_code().to_string(),
        })
    }

    // ── Keychain passphrase management ───────────────────────────────

    pub fn set_passphrase(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        self.inner.keychain.set_passphrase(passphrase)
    }

    pub fn change_passphrase(&self, old: &[u8], new: &[u8]) -> Result<(), WalletError> {
        self.inner.keychain.change_passphrase(old, new)
    }

    pub fn remove_passphrase(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        self.inner.keychain.remove_passphrase(passphrase)
    }

    /// Decrypts the master key into memory for `how_long`; the keys are
    /// wiped when the timer fires regardless of activity.
    pub fn unlock(&self, passphrase: &[u8], how_long: Duration) -> Result<(), WalletError> {
        self.inner.keychain.unlock(passphrase, how_long)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Returns (confirmed, unconfirmed) balance in base units.
    pub fn balance(&self) -> Result<(u64, u64), WalletError> {
        let utxos: Vec<UtxoRecord> = self.inner.db.view(|tx| {
            tx.find_where(&[("coin", self.inner.adapter.currency_code().to_string().into())])
        })?;
        let mut confirmed = 0u64;
        let mut unconfirmed = 0u64;
        for utxo in utxos {
            let amount = utxo.amount.max(0) as u64;
            if utxo.height > 0 {
                confirmed += amount;
            } else {
                unconfirmed += amount;
            }
        }
        Ok((confirmed, unconfirmed))
    }

    /// All transactions touching owned or watched addresses.
    pub fn transactions(&self) -> Result<Vec<WalletTransaction>, WalletError> {
        let records: Vec<TxRecord> = self.inner.db.view(|tx| {
            tx.find_where(&[("coin", self.inner.adapter.currency_code().to_string().into())])
        })?;
        records
            .iter()
            .map(|r| {
                r.to_transaction()
                    .map_err(|e| WalletError::CorruptRecord(format!("transaction {}: {e}", r.txid)))
            })
            .collect()
    }

    pub fn get_transaction(&self, id: &str) -> Result<WalletTransaction, WalletError> {
        let record: TxRecord = self
            .inner
            .db
            .view(|tx| {
                tx.find_first(
                    &[
                        ("coin", self.inner.adapter.currency_code().to_string().into()),
                        ("txid", id.to_string().into()),
                    ],
                    "txid ASC",
                )
            })
            .map_err(|_| WalletError::NotFound(format!("transaction {id}")))?;
        record
            .to_transaction()
            .map_err(|e| WalletError::CorruptRecord(format!("transaction {id}: {e}")))
    }

    pub fn blockchain_info(&self) -> BlockInfo {
        self.inner.state.read().best_block.clone()
    }

    /// Whether `amount` is below the network's economic relay threshold.
    pub fn is_dust(&self, amount: u64) -> bool {
        match self
            .inner
            .adapter
            .script_pubkey(self.inner.adapter.placeholder_address())
        {
            Ok(script) => self.inner.adapter.is_dust(amount, &script),
            Err(_) => true,
        }
    }

    // ── Spending ─────────────────────────────────────────────────────

    /// Anticipated fee to transfer `amount` at `level`, computed by
    /// authoring a transaction against a deliberately long placeholder
    /// address so the size is never under-estimated.
    pub fn estimate_spend_fee(&self, amount: u64, level: FeeLevel) -> Result<u64, WalletError> {
        let best_height = self.inner.state.read().best_block.height;
        self.inner.db.view(|tx| {
            let outcome = builder::build_spend(
                tx,
                &self.inner.keychain,
                &*self.inner.adapter,
                best_height,
                amount,
                self.inner.adapter.placeholder_address(),
                level,
                None,
                false,
            )?;
            Ok(outcome.total_in - outcome.tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>())
        })
    }

    /// Builds, signs, and stages a payment of `amount` to `to`.
    ///
    /// Nothing is broadcast or persisted until the host commits `dbtx`;
    /// rollback discards the spend entirely. On commit the transaction is
    /// broadcast and then ingested, deleting the spent UTXOs and crediting
    /// the change output.
    pub fn spend(
        &self,
        dbtx: &mut Tx<'_>,
        to: &str,
        amount: u64,
        level: FeeLevel,
    ) -> Result<String, WalletError> {
        let best_height = self.inner.state.read().best_block.height;
        let outcome = builder::build_spend(
            dbtx,
            &self.inner.keychain,
            &*self.inner.adapter,
            best_height,
            amount,
            to,
            level,
            None,
            true,
        )?;
        self.stage_broadcast(dbtx, &outcome.tx, self.spend_transaction(&outcome, to))
    }

    /// Sweeps the full wallet balance to `to`, fee subtracted from the
    /// swept amount. Same commit semantics as [`Wallet::spend`].
    pub fn sweep_wallet(
        &self,
        dbtx: &mut Tx<'_>,
        to: &str,
        level: FeeLevel,
    ) -> Result<String, WalletError> {
        let best_height = self.inner.state.read().best_block.height;
        let outcome = builder::build_sweep(
            dbtx,
            &self.inner.keychain,
            &*self.inner.adapter,
            best_height,
            to,
            level,
            None,
        )?;
        self.stage_broadcast(dbtx, &outcome.tx, self.spend_transaction(&outcome, to))
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Ordered, unbounded stream of transactions as they are stored.
    pub fn subscribe_transactions(&self) -> UnboundedReceiver<WalletTransaction> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.state.write().tx_subscribers.push(tx);
        rx
    }

    /// Ordered, unbounded stream of new best blocks.
    pub fn subscribe_blocks(&self) -> UnboundedReceiver<BlockInfo> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.state.write().block_subscribers.push(tx);
        rx
    }

    /// Feeds one chain event through ingestion, exactly as the background
    /// subscription thread does.
    pub fn process_event(&self, event: ChainEvent) -> Result<(), WalletError> {
        match event {
            ChainEvent::Transaction(tx) => self.inner.ingest(tx),
            ChainEvent::Block(block) => self.inner.process_block(block),
        }
    }

    // ── Escrow ───────────────────────────────────────────────────────

    /// Deterministically derives a threshold multisig address and its
    /// redeem script. Key order is the caller's responsibility and is
    /// preserved byte-for-byte.
    pub fn create_multisig_address(
        &self,
        keys: &[CompressedPublicKey],
        threshold: usize,
    ) -> Result<(String, Vec<u8>), WalletError> {
        let script = escrow::multisig_redeem_script(keys, threshold)?;
        let address = self.inner.adapter.script_hash_address(&script)?;
        Ok((address, script.to_bytes()))
    }

    /// As [`Wallet::create_multisig_address`], with a timeout-recovery
    /// branch spendable by `timeout_key` after `timeout` has elapsed
    /// on-chain.
    pub fn create_multisig_with_timeout(
        &self,
        keys: &[CompressedPublicKey],
        threshold: usize,
        timeout: Duration,
        timeout_key: &CompressedPublicKey,
    ) -> Result<(String, Vec<u8>), WalletError> {
        let script = escrow::timeout_redeem_script(keys, threshold, timeout, timeout_key)?;
        let address = self.inner.adapter.script_hash_address(&script)?;
        Ok((address, script.to_bytes()))
    }

    /// Crude escrow release fee estimate assuming one input and one
    /// output of an (m, m+1) threshold script; the host scales it for
    /// additional inputs.
    pub fn estimate_escrow_fee(&self, threshold: usize, level: FeeLevel) -> Result<u64, WalletError> {
        let adapter = &*self.inner.adapter;
        let vsize = adapter.tx_overhead_vbytes()
            + adapter.escrow_input_vbytes(threshold, threshold + 1)
            + adapter.output_vbytes();
        Ok(vsize * adapter.fee_per_byte(level))
    }

    /// Signs every input of the escrow transfer with `key`, returning one
    /// signature per input for exchange with the other parties.
    pub fn sign_multisig_transaction(
        &self,
        txn: &WalletTransaction,
        key: &PrivateKey,
        redeem: &[u8],
    ) -> Result<Vec<EscrowSignature>, WalletError> {
        escrow::sign_multisig_transaction(
            &*self.inner.adapter,
            txn,
            key,
            Script::from_bytes(redeem),
        )
    }

    /// Merges the parties' signatures, assembles the threshold spend, and
    /// stages broadcast plus ingestion on commit of `dbtx`.
    pub fn build_and_send(
        &self,
        dbtx: &mut Tx<'_>,
        txn: &WalletTransaction,
        signatures: &[Vec<EscrowSignature>],
        redeem: &[u8],
    ) -> Result<String, WalletError> {
        let tx = escrow::aggregate_multisig_spend(
            &*self.inner.adapter,
            txn,
            signatures,
            Script::from_bytes(redeem),
        )?;
        self.stage_broadcast(dbtx, &tx, self.escrow_transaction_record(&tx, txn))
    }

    /// Releases escrow funds via the timeout branch. Fails with
    /// [`WalletError::TimeoutNotExpired`] until the funding output has
    /// been confirmed for longer than the redeem script's sequence lock.
    pub fn release_funds_after_timeout(
        &self,
        dbtx: &mut Tx<'_>,
        txn: &WalletTransaction,
        timeout_key: &PrivateKey,
        redeem: &[u8],
    ) -> Result<String, WalletError> {
        let redeem_script = Script::from_bytes(redeem);
        let info = escrow::parse_redeem_script(redeem_script)?;
        let (sequence, _) = info.timeout.ok_or_else(|| {
            WalletError::SigningFailed("redeem script has no timeout branch".into())
        })?;

        let required_secs = (sequence.to_consensus_u32() & 0xFFFF) as u64 * 512;
        let best_height = self.inner.state.read().best_block.height;
        let coin = self.inner.adapter.currency_code();

        for input in &txn.from {
            let outpoint = decode_outpoint(&input.outpoint)?;
            let funding: Vec<TxRecord> = dbtx.find_where(&[
                ("coin", coin.to_string().into()),
                ("txid", outpoint.txid.to_string().into()),
            ])?;
            let height = funding.first().map(|r| r.height).unwrap_or(0);
            if height <= 0 {
                return Err(WalletError::TimeoutNotExpired);
            }
            let elapsed = best_height.saturating_sub(height as u64)
                * self.inner.adapter.target_spacing_secs();
            if elapsed < required_secs {
                return Err(WalletError::TimeoutNotExpired);
            }
        }

        let tx = escrow::timeout_spend(&*self.inner.adapter, txn, timeout_key, redeem_script)?;
        self.stage_broadcast(dbtx, &tx, self.escrow_transaction_record(&tx, txn))
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Registers the broadcast-then-ingest hook for a finished
    /// transaction and returns its id.
    fn stage_broadcast(
        &self,
        dbtx: &mut Tx<'_>,
        tx: &Transaction,
        wtx: WalletTransaction,
    ) -> Result<String, WalletError> {
        let txid = tx.compute_txid().to_string();
        let raw = bitcoin::consensus::serialize(tx);
        let inner = Arc::clone(&self.inner);
        dbtx.on_commit(move || {
            inner.client.broadcast(&raw)?;
            debug!(txid = %wtx.id, "transaction broadcast");
            inner.ingest(wtx)
        });
        Ok(txid)
    }

    /// Converts a spend outcome into the wallet-facing transaction form.
    fn spend_transaction(&self, outcome: &SpendOutcome, dest: &str) -> WalletTransaction {
        let txid = outcome.tx.compute_txid();
        let from = outcome
            .spent
            .iter()
            .map(|coin| SpendInfo {
                outpoint: encode_outpoint(&coin.outpoint),
                address: coin.address.clone(),
                amount: coin.value,
                is_relevant: true,
                is_watched: false,
            })
            .collect();

        let dest_script = self.inner.adapter.script_pubkey(dest).ok();
        let to = outcome
            .tx
            .output
            .iter()
            .enumerate()
            .map(|(index, out)| {
                let address = if Some(&out.script_pubkey) == dest_script.as_ref() {
                    dest.to_string()
                } else {
                    outcome.change_address.clone().unwrap_or_default()
                };
                SpendInfo {
                    outpoint: encode_outpoint(&bitcoin::OutPoint::new(txid, index as u32)),
                    address,
                    amount: out.value.to_sat(),
                    is_relevant: false,
                    is_watched: false,
                }
            })
            .collect();

        WalletTransaction {
            id: txid.to_string(),
            from,
            to,
            height: 0,
        }
    }

    /// Converts an assembled escrow spend into the wallet-facing form,
    /// re-keying the host's output descriptions to the final outpoints.
    fn escrow_transaction_record(
        &self,
        tx: &Transaction,
        txn: &WalletTransaction,
    ) -> WalletTransaction {
        let txid = tx.compute_txid();
        let to = tx
            .output
            .iter()
            .enumerate()
            .map(|(index, out)| {
                let address = txn
                    .to
                    .iter()
                    .find(|info| {
                        info.amount == out.value.to_sat()
                            && self
                                .inner
                                .adapter
                                .script_pubkey(&info.address)
                                .map(|s| s == out.script_pubkey)
                                .unwrap_or(false)
                    })
                    .map(|info| info.address.clone())
                    .unwrap_or_default();
                SpendInfo {
                    outpoint: encode_outpoint(&bitcoin::OutPoint::new(txid, index as u32)),
                    address,
                    amount: out.value.to_sat(),
                    is_relevant: false,
                    is_watched: false,
                }
            })
            .collect();

        WalletTransaction {
            id: txid.to_string(),
            from: txn.from.clone(),
            to,
            height: 0,
        }
    }
}

impl WalletInner {
    /// Applies a transaction to the store: deletes spent UTXOs, credits
    /// owned outputs, records watched activity, and publishes the result.
    ///
    /// A transaction is stored iff at least one side is relevant or
    /// watched. Re-ingesting a known transaction only promotes heights.
    fn ingest(&self, mut wtx: WalletTransaction) -> Result<(), WalletError> {
        let coin = self.adapter.currency_code().to_string();
        let stored = self.db.update(|tx| {
            let mut relevant = false;
            let mut watched = false;

            let known: Vec<TxRecord> = tx.find_where(&[
                ("coin", coin.clone().into()),
                ("txid", wtx.id.clone().into()),
            ])?;
            let first_seen = known.is_empty();

            // Height only ever promotes from 0 to a confirmation height; a
            // stale unconfirmed sighting never demotes it.
            if let Some(prior) = known.first() {
                if prior.height > 0 && wtx.height == 0 {
                    wtx.height = prior.height as u64;
                }
            }

            for info in &mut wtx.from {
                let spent: Vec<UtxoRecord> = tx.find_where(&[
                    ("coin", coin.clone().into()),
                    ("outpoint", info.outpoint.clone().into()),
                ])?;
                if let Some(utxo) = spent.first() {
                    info.is_relevant = true;
                    info.address = utxo.address.clone();
                    info.amount = utxo.amount.max(0) as u64;
                    relevant = true;
                    tx.delete_where::<UtxoRecord>(&[
                        ("coin", coin.clone().into()),
                        ("outpoint", info.outpoint.clone().into()),
                    ])?;
                } else if !first_seen {
                    // Already processed on first ingestion; keep the flags
                    // the stored record assigned.
                    if let Some(prior) = known
                        .first()
                        .and_then(|r| r.to_transaction().ok())
                        .and_then(|t| {
                            t.from.iter().find(|p| p.outpoint == info.outpoint).cloned()
                        })
                    {
                        *info = prior;
                        relevant |= info.is_relevant;
                    }
                }
            }

            for info in &mut wtx.to {
                if self.keychain.has_key_in(tx, &info.address)? {
                    info.is_relevant = true;
                    relevant = true;
                    if first_seen {
                        tx.save(&UtxoRecord {
                            outpoint: info.outpoint.clone(),
                            address: info.address.clone(),
                            amount: info.amount as i64,
                            height: wtx.height as i64,
                            coin: coin.clone(),
                        })?;
                        self.keychain.mark_address_as_used_in(tx, &info.address)?;
                    } else {
                        tx.update_where::<UtxoRecord>(
                            ("height", (wtx.height as i64).into()),
                            &[
                                ("coin", coin.clone().into()),
                                ("outpoint", info.outpoint.clone().into()),
                            ],
                        )?;
                    }
                } else if self.is_watched_in(tx, &info.address)? {
                    info.is_watched = true;
                    watched = true;
                }
            }

            if !(relevant || watched) {
                return Ok(false);
            }

            let record = TxRecord::from_transaction(&coin, &wtx)
                .map_err(|e| WalletError::CorruptRecord(e.to_string()))?;
            tx.save(&record)?;
            Ok(true)
        })?;

        if stored {
            debug!(txid = %wtx.id, height = wtx.height, "transaction ingested");
            let mut state = self.state.write();
            state
                .tx_subscribers
                .retain(|sub| sub.send(wtx.clone()).is_ok());
        }
        Ok(())
    }

    fn process_block(&self, block: BlockInfo) -> Result<(), WalletError> {
        let coin = self.adapter.currency_code().to_string();
        self.db.update(|tx| {
            tx.update_where::<CoinRecord>(
                ("best_block_hash", block.hash.clone().into()),
                &[("coin", coin.clone().into())],
            )?;
            tx.update_where::<CoinRecord>(
                ("best_block_height", (block.height as i64).into()),
                &[("coin", coin.clone().into())],
            )?;
            Ok(())
        })?;

        let mut state = self.state.write();
        state.best_block = block.clone();
        state
            .block_subscribers
            .retain(|sub| sub.send(block.clone()).is_ok());
        Ok(())
    }

    fn is_watched_in(&self, tx: &Tx<'_>, addr: &str) -> Result<bool, WalletError> {
        let found: Vec<WatchedAddressRecord> = tx.find_where(&[
            ("coin", self.adapter.currency_code().to_string().into()),
            ("address", addr.to_string().into()),
        ])?;
        Ok(!found.is_empty())
    }
}
