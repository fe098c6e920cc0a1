//! The ledger client trait consumed by the router

use crate::error::Result;
use crate::types::{Account, Address, Amount, FeeQuote, InboundTransaction, TransferReceipt, TxHash};
use async_trait::async_trait;

/// Everything the router needs from a ledger.
///
/// Implementations own transport, signing and fee discovery. Every method
/// may fail with a retryable [`crate::LedgerError`]; the router decides
/// whether and when to try again.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current per-transfer fee estimate (feeL1, feeL2)
    async fn estimate_fee(&self) -> Result<FeeQuote>;

    /// Spendable balance of an address
    async fn get_balance(&self, address: &Address) -> Result<Amount>;

    /// Look up a transaction; `Ok(None)` when the ledger has no such hash
    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<InboundTransaction>>;

    /// Send `amount` to `to`, paying at most `fee_budget` in fees.
    ///
    /// Blocks until the transfer is confirmed or fails.
    async fn submit_transfer(
        &self,
        from: &Account,
        to: &Address,
        amount: Amount,
        fee_budget: Amount,
    ) -> Result<TransferReceipt>;

    /// Fresh identity from the key-generation collaborator
    fn generate_account(&self) -> Result<Account>;
}
