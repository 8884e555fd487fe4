//! BIP44 keychain: deterministic address issuance with a look-ahead window
//! and at-rest encryption of the account master private key.
//!
//! The keychain is handed the *account* level key (`m/44'/coin'/account'`)
//! and derives exactly two non-hardened children: child 0 is the external
//! receive chain, child 1 the internal change chain. Addresses are derived
//! from the chain-level public keys only, so the account private key can be
//! encrypted at rest without stopping address issuance.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use parking_lot::RwLock;
use tracing::debug;

use crate::database::records::{AddressRecord, CoinRecord};
use crate::database::{Database, Tx};
use crate::error::WalletError;

/// Number of keys to keep derived past the last used key on each chain.
/// The key manager strives to maintain this buffer so a rescan from seed
/// can detect arbitrary gaps up to the window size.
pub const DEFAULT_LOOKAHEAD_WINDOW: usize = 10;

/// Derives an address string from a chain-level child public key.
pub type AddressFunc = Arc<dyn Fn(&Xpub) -> Result<String, WalletError> + Send + Sync>;

/// Optional keychain behavior switches.
#[derive(Debug, Clone)]
pub struct KeychainConfig {
    /// Look-ahead window size per chain.
    pub lookahead_window_size: usize,
    /// Only maintain the external chain (no change addresses).
    pub external_only: bool,
    /// Make [`Keychain::mark_address_as_used_in`] a no-op.
    pub disable_mark_as_used: bool,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self {
            lookahead_window_size: DEFAULT_LOOKAHEAD_WINDOW,
            external_only: false,
            disable_mark_as_used: false,
        }
    }
}

/// In-memory key material. Private chain keys are present iff the master
/// key is unencrypted or currently unlocked.
struct ChainKeys {
    external_pub: Xpub,
    internal_pub: Xpub,
    external_priv: Option<Xpriv>,
    internal_priv: Option<Xpriv>,
    /// Bumped on every unlock so an expired timer never clears keys
    /// installed by a later unlock.
    unlock_generation: u64,
}

impl ChainKeys {
    fn clear_private(&mut self) {
        if let Some(mut key) = self.external_priv.take() {
            key.private_key.non_secure_erase();
        }
        if let Some(mut key) = self.internal_priv.take() {
            key.private_key.non_secure_erase();
        }
    }
}

/// Manages one coin's BIP44 keychain.
pub struct Keychain {
    db: Arc<Database>,
    coin: String,
    addr_func: AddressFunc,
    cfg: KeychainConfig,
    keys: Arc<RwLock<ChainKeys>>,
    secp: Secp256k1<All>,
}

impl Keychain {
    /// Loads the coin record and instantiates the keychain, topping up the
    /// look-ahead window.
    pub fn new(
        db: Arc<Database>,
        coin: &str,
        addr_func: AddressFunc,
        cfg: KeychainConfig,
    ) -> Result<Self, WalletError> {
        let record: CoinRecord =
            db.view(|tx| tx.find_first(&[("coin", coin.to_string().into())], "coin ASC"))?;

        let secp = Secp256k1::new();
        let account_pub = Xpub::from_str(&record.master_pub)
            .map_err(|e| WalletError::CorruptRecord(format!("account xpub: {e}")))?;
        let (external_pub, internal_pub) = derive_chain_pubs(&secp, &account_pub)?;

        let (external_priv, internal_priv) = if !record.encrypted && !record.master_priv.is_empty()
        {
            let account_priv = Xpriv::from_str(&record.master_priv)
                .map_err(|e| WalletError::CorruptRecord(format!("account xpriv: {e}")))?;
            let (external, internal) = derive_chain_privs(&secp, &account_priv)?;
            (Some(external), Some(internal))
        } else {
            (None, None)
        };

        let kc = Self {
            db,
            coin: coin.to_string(),
            addr_func,
            cfg,
            keys: Arc::new(RwLock::new(ChainKeys {
                external_pub,
                internal_pub,
                external_priv,
                internal_priv,
                unlock_generation: 0,
            })),
            secp,
        };
        kc.extend_keychain()?;
        Ok(kc)
    }

    /// Whether this keychain maintains only the external chain.
    pub fn external_only(&self) -> bool {
        self.cfg.external_only
    }

    /// Whether the master private key is absent from memory (encrypted,
    /// locked, or watch-only).
    pub fn is_encrypted(&self) -> bool {
        let keys = self.keys.read();
        keys.external_priv.is_none() || keys.internal_priv.is_none()
    }

    /// Returns all issued addresses for this coin.
    pub fn addresses(&self) -> Result<Vec<String>, WalletError> {
        let records: Vec<AddressRecord> = self
            .db
            .view(|tx| tx.find_where(&[("coin", self.coin.clone().into())]))?;
        Ok(records.into_iter().map(|r| r.address).collect())
    }

    /// The first unused address on the requested chain.
    pub fn current_address(&self, change: bool) -> Result<String, WalletError> {
        self.db.view(|tx| self.current_address_in(tx, change))
    }

    /// [`Keychain::current_address`] against an already-open transaction.
    pub fn current_address_in(&self, tx: &Tx<'_>, change: bool) -> Result<String, WalletError> {
        if change && self.cfg.external_only {
            return Err(WalletError::WalletLocked(
                "keychain is configured for external addresses only".into(),
            ));
        }
        let record: AddressRecord = tx.find_first(
            &[
                ("coin", self.coin.clone().into()),
                ("is_change", (change as i64).into()),
                ("used", 0i64.into()),
            ],
            "key_index ASC",
        )?;
        Ok(record.address)
    }

    /// Issues a never-before-returned address at `max(index) + 1`.
    ///
    /// This bypasses first-unused semantics and is reserved for
    /// host-assigned single-use receive addresses.
    pub fn new_address(&self, change: bool) -> Result<String, WalletError> {
        if change && self.cfg.external_only {
            return Err(WalletError::WalletLocked(
                "keychain is configured for external addresses only".into(),
            ));
        }
        self.db.update(|tx| {
            let highest: AddressRecord = tx.find_first(
                &[
                    ("coin", self.coin.clone().into()),
                    ("is_change", (change as i64).into()),
                ],
                "key_index DESC",
            )?;

            let (index, key) = self.derive_valid_child(change, highest.key_index + 1)?;
            let address = (self.addr_func)(&key)?;

            tx.save(&AddressRecord {
                address: address.clone(),
                key_index: index,
                is_change: change,
                used: false,
                coin: self.coin.clone(),
            })?;
            self.extend_keychain_in(tx)?;
            Ok(address)
        })
    }

    /// Whether this wallet can derive the key for `addr`.
    pub fn has_key(&self, addr: &str) -> Result<bool, WalletError> {
        self.db.view(|tx| self.has_key_in(tx, addr))
    }

    /// [`Keychain::has_key`] against an already-open transaction.
    pub fn has_key_in(&self, tx: &Tx<'_>, addr: &str) -> Result<bool, WalletError> {
        let found: Vec<AddressRecord> = tx.find_where(&[
            ("coin", self.coin.clone().into()),
            ("address", addr.to_string().into()),
        ])?;
        Ok(!found.is_empty())
    }

    /// Derives the extended private key for `addr`.
    ///
    /// When the keychain is encrypted the caller must pass the unlocked
    /// account private key; otherwise the in-memory chain keys are used.
    /// Fails with [`WalletError::EncryptedKeychain`] if neither is
    /// available.
    pub fn key_for_address_in(
        &self,
        tx: &Tx<'_>,
        addr: &str,
        account_priv: Option<&Xpriv>,
    ) -> Result<Xpriv, WalletError> {
        let record: AddressRecord = tx
            .find_first(
                &[
                    ("coin", self.coin.clone().into()),
                    ("address", addr.to_string().into()),
                ],
                "key_index ASC",
            )
            .map_err(|_| WalletError::NotFound(format!("address {addr}")))?;

        let keys = self.keys.read();
        let chain_priv = match (record.is_change, account_priv) {
            (false, _) if keys.external_priv.is_some() => keys.external_priv.unwrap(),
            (true, _) if keys.internal_priv.is_some() => keys.internal_priv.unwrap(),
            (change, Some(account)) => {
                let (external, internal) = derive_chain_privs(&self.secp, account)?;
                if change {
                    internal
                } else {
                    external
                }
            }
            _ => return Err(WalletError::EncryptedKeychain),
        };
        drop(keys);

        let child = ChildNumber::from_normal_idx(record.key_index)
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        chain_priv
            .derive_priv(&self.secp, &[child])
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))
    }

    /// Marks `addr` as used and tops the look-ahead window back up. No-op
    /// when the keychain is configured with `disable_mark_as_used`.
    pub fn mark_address_as_used_in(&self, tx: &mut Tx<'_>, addr: &str) -> Result<(), WalletError> {
        if self.cfg.disable_mark_as_used {
            return Ok(());
        }
        let changed = tx.update_where::<AddressRecord>(
            ("used", 1i64.into()),
            &[
                ("coin", self.coin.clone().into()),
                ("address", addr.to_string().into()),
            ],
        )?;
        if changed == 0 {
            return Err(WalletError::NotFound(format!("address {addr}")));
        }
        self.extend_keychain_in(tx)
    }

    /// Encrypts the master private key in the database and drops the chain
    /// private keys from memory.
    ///
    /// The database transaction always runs before the key lock is taken;
    /// the spend path acquires those in the opposite order, so nesting them
    /// here would invite a deadlock.
    pub fn set_passphrase(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        self.db.update(|tx| {
            let mut record = self.coin_record_in(tx)?;
            if record.encrypted {
                return Err(WalletError::WalletLocked("keychain already encrypted".into()));
            }
            if record.master_priv.is_empty() {
                return Err(WalletError::WalletLocked(
                    "watch-only wallet has no private key".into(),
                ));
            }

            let cipher = crypto_utils::encryption::encrypt(record.master_priv.as_bytes(), passphrase)?;
            record.master_priv = cipher.cipher_b64;
            record.encrypted = true;
            record.kdf_salt = cipher.salt.to_vec();
            record.kdf_rounds = cipher.rounds;
            record.kdf_key_len = cipher.key_len;
            tx.save(&record)
        })?;
        self.keys.write().clear_private();
        debug!(coin = %self.coin, "keychain encrypted");
        Ok(())
    }

    /// Re-encrypts the master private key under a new passphrase.
    pub fn change_passphrase(&self, old: &[u8], new: &[u8]) -> Result<(), WalletError> {
        self.db.update(|tx| {
            let mut record = self.coin_record_in(tx)?;
            if !record.encrypted {
                return Err(WalletError::WalletLocked("wallet is not encrypted".into()));
            }

            let plaintext = self.decrypt_master(&record, old)?;
            let cipher = crypto_utils::encryption::encrypt(plaintext.to_string().as_bytes(), new)?;
            record.master_priv = cipher.cipher_b64;
            record.kdf_salt = cipher.salt.to_vec();
            record.kdf_rounds = cipher.rounds;
            record.kdf_key_len = cipher.key_len;
            tx.save(&record)
        })
    }

    /// Removes encryption from the master key and restores the chain
    /// private keys to memory.
    pub fn remove_passphrase(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        let account = self.db.update(|tx| {
            let mut record = self.coin_record_in(tx)?;
            if !record.encrypted {
                return Err(WalletError::WalletLocked("wallet is not encrypted".into()));
            }

            let account = self.decrypt_master(&record, passphrase)?;
            record.master_priv = account.to_string();
            record.encrypted = false;
            record.kdf_salt = Vec::new();
            tx.save(&record)?;
            Ok(account)
        })?;

        let (external, internal) = derive_chain_privs(&self.secp, &account)?;
        let mut keys = self.keys.write();
        keys.external_priv = Some(external);
        keys.internal_priv = Some(internal);
        debug!(coin = %self.coin, "keychain decrypted");
        Ok(())
    }

    /// Decrypts the master key and installs the chain private keys in
    /// memory for `how_long`, after which they are unconditionally wiped.
    pub fn unlock(&self, passphrase: &[u8], how_long: Duration) -> Result<(), WalletError> {
        if !self.is_encrypted() {
            return Err(WalletError::WalletLocked("wallet is not encrypted".into()));
        }

        let record = self.db.view(|tx| self.coin_record_in(tx))?;
        if !record.encrypted {
            return Err(WalletError::WalletLocked("wallet is not encrypted".into()));
        }
        let account = self.decrypt_master(&record, passphrase)?;
        let (external, internal) = derive_chain_privs(&self.secp, &account)?;

        let mut keys = self.keys.write();
        keys.external_priv = Some(external);
        keys.internal_priv = Some(internal);
        keys.unlock_generation += 1;
        let generation = keys.unlock_generation;
        drop(keys);

        let shared = Arc::clone(&self.keys);
        let coin = self.coin.clone();
        std::thread::spawn(move || {
            std::thread::sleep(how_long);
            let mut keys = shared.write();
            // A later unlock supersedes this timer.
            if keys.unlock_generation == generation {
                keys.clear_private();
                debug!(coin = %coin, "unlock expired, private keys wiped");
            }
        });
        Ok(())
    }

    /// Restores the look-ahead invariant inside its own transaction.
    pub fn extend_keychain(&self) -> Result<(), WalletError> {
        self.db.update(|tx| self.extend_keychain_in(tx))
    }

    /// Restores the look-ahead invariant: each chain keeps at least the
    /// window size of unused keys above its highest used index.
    pub fn extend_keychain_in(&self, tx: &mut Tx<'_>) -> Result<(), WalletError> {
        let (internal_unused, external_unused) = self.lookahead_windows(tx)?;
        if !self.cfg.external_only && internal_unused < self.cfg.lookahead_window_size {
            self.create_new_keys(tx, true, self.cfg.lookahead_window_size - internal_unused)?;
        }
        if external_unused < self.cfg.lookahead_window_size {
            self.create_new_keys(tx, false, self.cfg.lookahead_window_size - external_unused)?;
        }
        Ok(())
    }

    fn create_new_keys(
        &self,
        tx: &mut Tx<'_>,
        change: bool,
        num_keys: usize,
    ) -> Result<(), WalletError> {
        let mut next_index = match tx.find_first::<AddressRecord>(
            &[
                ("coin", self.coin.clone().into()),
                ("is_change", (change as i64).into()),
            ],
            "key_index DESC",
        ) {
            Ok(record) => record.key_index + 1,
            Err(WalletError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };

        for _ in 0..num_keys {
            let (index, key) = self.derive_valid_child(change, next_index)?;
            let address = (self.addr_func)(&key)?;
            tx.save(&AddressRecord {
                address,
                key_index: index,
                is_change: change,
                used: false,
                coin: self.coin.clone(),
            })?;
            next_index = index + 1;
        }
        Ok(())
    }

    /// Derives the chain child at `start` or, when BIP32 rejects an index,
    /// the next valid one. Skipped indices are never revisited so restores
    /// from seed land on the same addresses.
    fn derive_valid_child(&self, change: bool, start: u32) -> Result<(u32, Xpub), WalletError> {
        let keys = self.keys.read();
        let chain_pub = if change {
            keys.internal_pub
        } else {
            keys.external_pub
        };
        drop(keys);

        let mut index = start;
        loop {
            let child = ChildNumber::from_normal_idx(index)
                .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
            match chain_pub.derive_pub(&self.secp, &[child]) {
                Ok(key) => return Ok((index, key)),
                Err(_) => index += 1,
            }
        }
    }

    fn lookahead_windows(&self, tx: &Tx<'_>) -> Result<(usize, usize), WalletError> {
        let records: Vec<AddressRecord> =
            tx.find_where(&[("coin", self.coin.clone().into())])?;

        let mut internal_last_used: i64 = -1;
        let mut external_last_used: i64 = -1;
        for rec in &records {
            if rec.used {
                let idx = rec.key_index as i64;
                if rec.is_change && idx > internal_last_used {
                    internal_last_used = idx;
                }
                if !rec.is_change && idx > external_last_used {
                    external_last_used = idx;
                }
            }
        }

        let mut internal_unused = 0;
        let mut external_unused = 0;
        for rec in &records {
            if !rec.used {
                let idx = rec.key_index as i64;
                if rec.is_change && idx > internal_last_used {
                    internal_unused += 1;
                }
                if !rec.is_change && idx > external_last_used {
                    external_unused += 1;
                }
            }
        }
        Ok((internal_unused, external_unused))
    }

    fn coin_record_in(&self, tx: &Tx<'_>) -> Result<CoinRecord, WalletError> {
        tx.find_first(&[("coin", self.coin.clone().into())], "coin ASC")
    }

    /// Decrypts the stored master private key, reporting a wrong
    /// passphrase when the plaintext does not parse as an extended key.
    fn decrypt_master(&self, record: &CoinRecord, passphrase: &[u8]) -> Result<Xpriv, WalletError> {
        let plain = crypto_utils::encryption::decrypt(
            &record.master_priv,
            passphrase,
            &record.kdf_salt,
            record.kdf_rounds,
            record.kdf_key_len,
        )?;
        let text = std::str::from_utf8(&plain).map_err(|_| WalletError::InvalidPassphrase)?;
        Xpriv::from_str(text).map_err(|_| WalletError::InvalidPassphrase)
    }

    /// Clears any in-memory private keys (wallet close).
    pub fn lock(&self) {
        self.keys.write().clear_private();
    }
}

/// Child 0 = external receive chain, child 1 = internal change chain.
fn derive_chain_privs(
    secp: &Secp256k1<All>,
    account: &Xpriv,
) -> Result<(Xpriv, Xpriv), WalletError> {
    let external = account
        .derive_priv(secp, &[ChildNumber::from_normal_idx(0).expect("0 < 2^31")])
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    let internal = account
        .derive_priv(secp, &[ChildNumber::from_normal_idx(1).expect("1 < 2^31")])
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    Ok((external, internal))
}

fn derive_chain_pubs(secp: &Secp256k1<All>, account: &Xpub) -> Result<(Xpub, Xpub), WalletError> {
    let external = account
        .derive_pub(secp, &[ChildNumber::from_normal_idx(0).expect("0 < 2^31")])
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    let internal = account
        .derive_pub(secp, &[ChildNumber::from_normal_idx(1).expect("1 < 2^31")])
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    Ok((external, internal))
}
