//! Hopline Ledger Client
//!
//! The narrow boundary between the routing engine and a public ledger.
//!
//! # Contents
//!
//! - **Types**: `Amount`, `Address`, `TxHash`, `Account`, `FeeQuote`, receipts
//! - **Client trait**: [`LedgerClient`], the only way the router touches a ledger
//! - **Keys**: ed25519 key pairs and address derivation for fresh accounts
//! - **Simulation**: [`SimulatedLedger`], an in-process ledger with fault injection

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod client;
pub mod error;
pub mod keys;
pub mod simulated;
pub mod types;

// Re-exports
pub use client::LedgerClient;
pub use error::{LedgerError, Result};
pub use keys::KeyPair;
pub use simulated::{FaultKind, JournalEntry, JournalKind, SimulatedLedger, SimulationSettings};
pub use types::{
    Account, Address, Amount, FeeQuote, InboundTransaction, SecretKey, TransferReceipt, TxHash,
};
