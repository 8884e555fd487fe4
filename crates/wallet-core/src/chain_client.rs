//! Interface to the external chain-client server.
//!
//! The wallet core never talks to a network itself; a per-coin client
//! implementation relays raw transactions and feeds back parsed wallet
//! events. Relevance flags on incoming transactions are recomputed by the
//! wallet during ingestion, so clients only need to fill in outpoints,
//! addresses, and amounts.

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::WalletError;
use crate::types::{BlockInfo, WalletTransaction};

/// An event pushed by the chain client.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A transaction relevant to one of the subscribed addresses, confirmed
    /// (height > 0) or unconfirmed (height == 0).
    Transaction(WalletTransaction),
    /// A new best block.
    Block(BlockInfo),
}

/// Connection to an external chain-client server.
pub trait ChainClient: Send + Sync {
    /// Relays a raw serialized transaction to the network.
    fn broadcast(&self, raw_tx: &[u8]) -> Result<(), WalletError>;

    /// Returns the current best-chain tip.
    fn best_block(&self) -> Result<BlockInfo, WalletError>;

    /// Subscribes to incoming transactions and new blocks. The stream is
    /// unbounded and ordered; it ends when the client shuts down.
    fn subscribe(&self) -> UnboundedReceiver<ChainEvent>;
}
