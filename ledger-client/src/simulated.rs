//! In-process ledger used by tests, demos and the CLI
//!
//! Balances live in memory behind a single mutex. Every transfer is signed
//! with the sender's key and verified before it is applied, and the exact
//! fee budget is charged to the sender. A logical clock stamps each
//! submission and confirmation in a journal so callers can check ordering.

use crate::client::LedgerClient;
use crate::error::{LedgerError, Result};
use crate::keys::SignedTransfer;
use crate::types::{Account, Address, Amount, FeeQuote, InboundTransaction, TransferReceipt, TxHash};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source address used for simulated deposits
pub const FAUCET_ADDRESS: &str = "0x000000000000000000000000000000000000fa0c";

/// Simulated ledger parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Flat network fee per transfer (feeL1)
    pub network_fee: Amount,

    /// Protocol surcharge as a percentage of the network fee (feeL2)
    pub surcharge_percent: u32,

    /// Artificial latency per call (milliseconds)
    pub latency_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            network_fee: 180,
            surcharge_percent: 19,
            latency_ms: 0,
        }
    }
}

/// Failure injected into the next submission from an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Node rejects the call before anything is applied
    Unavailable,
    /// Transfer is applied but the caller never sees the receipt
    LostReceipt,
}

/// Journal entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalKind {
    /// Transfer reached the ledger
    Submitted,
    /// Transfer was applied
    Confirmed,
}

/// One stamped ledger event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Logical clock value
    pub sequence: u64,
    /// Event kind
    pub kind: JournalKind,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Value
    pub amount: Amount,
    /// Set once confirmed
    pub hash: Option<TxHash>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerBook {
    settings: SimulationSettings,
    balances: HashMap<Address, Amount>,
    transactions: HashMap<TxHash, InboundTransaction>,
    nonces: HashMap<Address, u64>,
    journal: Vec<JournalEntry>,
    clock: u64,
    #[serde(skip)]
    faults: HashMap<Address, VecDeque<FaultKind>>,
}

impl LedgerBook {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn balance(&self, address: &Address) -> Amount {
        self.balances
            .get(&address.normalized())
            .copied()
            .unwrap_or(0)
    }

    fn next_nonce(&mut self, address: &Address) -> u64 {
        let nonce = self.nonces.entry(address.normalized()).or_insert(0);
        let current = *nonce;
        *nonce += 1;
        current
    }

    fn pop_fault(&mut self, address: &Address) -> Option<FaultKind> {
        self.faults
            .get_mut(&address.normalized())
            .and_then(|queue| queue.pop_front())
    }

    fn record(&mut self, kind: JournalKind, transfer: &SignedTransfer, hash: Option<TxHash>) -> u64 {
        let sequence = self.tick();
        self.journal.push(JournalEntry {
            sequence,
            kind,
            from: transfer.from.clone(),
            to: transfer.to.clone(),
            amount: transfer.amount,
            hash,
        });
        sequence
    }

    fn submit(&mut self, transfer: SignedTransfer) -> Result<TransferReceipt> {
        self.record(JournalKind::Submitted, &transfer, None);

        match self.pop_fault(&transfer.from) {
            Some(FaultKind::Unavailable) => {
                warn!("Simulated ledger: node unavailable for {}", transfer.from);
                Err(LedgerError::Unavailable("simulated node failure".to_string()))
            }
            Some(FaultKind::LostReceipt) => {
                let receipt = self.settle(&transfer)?;
                warn!(
                    "Simulated ledger: receipt {} lost after settlement",
                    receipt.hash
                );
                Err(LedgerError::Unavailable(
                    "connection reset before receipt".to_string(),
                ))
            }
            None => self.settle(&transfer),
        }
    }

    fn settle(&mut self, transfer: &SignedTransfer) -> Result<TransferReceipt> {
        if !transfer.verify() {
            return Err(LedgerError::InvalidSignature(transfer.from.clone()));
        }

        if transfer.fee_budget < self.settings.network_fee {
            return Err(LedgerError::Rejected(format!(
                "fee budget {} below network fee {}",
                transfer.fee_budget, self.settings.network_fee
            )));
        }

        let required = transfer
            .amount
            .checked_add(transfer.fee_budget)
            .ok_or_else(|| LedgerError::Rejected("amount overflow".to_string()))?;
        let available = self.balance(&transfer.from);
        if required > available {
            return Err(LedgerError::InsufficientBalance { required, available });
        }

        self.balances
            .insert(transfer.from.normalized(), available - required);
        *self.balances.entry(transfer.to.normalized()).or_insert(0) += transfer.amount;

        let hash = TxHash::new(transfer.hash());
        self.transactions.insert(
            hash.normalized(),
            InboundTransaction {
                hash: hash.clone(),
                from: transfer.from.clone(),
                to: transfer.to.clone(),
                value: transfer.amount,
                confirmed: true,
            },
        );
        let sequence = self.record(JournalKind::Confirmed, transfer, Some(hash.clone()));

        Ok(TransferReceipt {
            hash,
            from: transfer.from.clone(),
            to: transfer.to.clone(),
            amount: transfer.amount,
            fee: transfer.fee_budget,
            sequence,
            confirmed_at: Utc::now(),
        })
    }
}

/// In-memory ledger implementing [`LedgerClient`]
#[derive(Debug, Clone)]
pub struct SimulatedLedger {
    book: Arc<Mutex<LedgerBook>>,
}

impl SimulatedLedger {
    /// Create an empty ledger
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            book: Arc::new(Mutex::new(LedgerBook {
                settings,
                ..LedgerBook::default()
            })),
        }
    }

    /// Restore a ledger saved with [`SimulatedLedger::save_snapshot`]
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let book: LedgerBook = serde_json::from_str(&content)?;
        Ok(Self {
            book: Arc::new(Mutex::new(book)),
        })
    }

    /// Open a snapshot if present, otherwise start empty
    pub fn open_or_create(path: impl AsRef<Path>, settings: SimulationSettings) -> Result<Self> {
        if path.as_ref().exists() {
            let ledger = Self::load_snapshot(path)?;
            ledger.book.lock().settings = settings;
            Ok(ledger)
        } else {
            Ok(Self::new(settings))
        }
    }

    /// Persist balances, transactions and journal as JSON
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&*self.book.lock())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Simulated external deposit; returns the inbound transaction hash
    pub fn deposit(&self, to: &Address, value: Amount) -> TxHash {
        let mut book = self.book.lock();
        let sequence = book.tick();
        let hash = TxHash::new(format!(
            "0x{}",
            hex::encode(crate::keys::hash_bytes(
                format!("deposit|{}|{}|{}", to.normalized(), value, sequence).as_bytes()
            ))
        ));

        *book.balances.entry(to.normalized()).or_insert(0) += value;
        let faucet = Address::new(FAUCET_ADDRESS);
        book.transactions.insert(
            hash.normalized(),
            InboundTransaction {
                hash: hash.clone(),
                from: faucet.clone(),
                to: to.clone(),
                value,
                confirmed: true,
            },
        );
        book.journal.push(JournalEntry {
            sequence,
            kind: JournalKind::Confirmed,
            from: faucet,
            to: to.clone(),
            amount: value,
            hash: Some(hash.clone()),
        });

        info!("Simulated ledger: deposited {} to {} ({})", value, to, hash);
        hash
    }

    /// Register a transaction record without moving funds
    pub fn insert_transaction(&self, transaction: InboundTransaction) {
        self.book
            .lock()
            .transactions
            .insert(transaction.hash.normalized(), transaction);
    }

    /// Current balance without latency or faults
    pub fn balance_of(&self, address: &Address) -> Amount {
        self.book.lock().balance(address)
    }

    /// Copy of the submission/confirmation journal
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.book.lock().journal.clone()
    }

    /// Number of confirmed transfers, deposits excluded
    pub fn transfer_count(&self) -> usize {
        let faucet = Address::new(FAUCET_ADDRESS);
        self.book
            .lock()
            .journal
            .iter()
            .filter(|entry| entry.kind == JournalKind::Confirmed && !entry.from.matches(&faucet))
            .count()
    }

    /// Fail the next `times` submissions from `from`
    pub fn inject_fault(&self, from: &Address, kind: FaultKind, times: usize) {
        let mut book = self.book.lock();
        let queue = book.faults.entry(from.normalized()).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    /// Change the network fee quoted from now on
    pub fn set_network_fee(&self, network_fee: Amount) {
        self.book.lock().settings.network_fee = network_fee;
    }

    /// Change the per-call latency
    pub fn set_latency(&self, latency_ms: u64) {
        self.book.lock().settings.latency_ms = latency_ms;
    }

    async fn simulate_latency(&self) {
        let latency_ms = self.book.lock().settings.latency_ms;
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn estimate_fee(&self) -> Result<FeeQuote> {
        self.simulate_latency().await;

        let book = self.book.lock();
        Ok(FeeQuote::with_surcharge_percent(
            book.settings.network_fee,
            book.settings.surcharge_percent,
        ))
    }

    async fn get_balance(&self, address: &Address) -> Result<Amount> {
        self.simulate_latency().await;
        Ok(self.book.lock().balance(address))
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<InboundTransaction>> {
        self.simulate_latency().await;
        Ok(self.book.lock().transactions.get(&hash.normalized()).cloned())
    }

    async fn submit_transfer(
        &self,
        from: &Account,
        to: &Address,
        amount: Amount,
        fee_budget: Amount,
    ) -> Result<TransferReceipt> {
        debug!(
            "Simulated ledger: submitting {} from {} to {} (fee budget {})",
            amount, from.address, to, fee_budget
        );

        self.simulate_latency().await;

        let mut book = self.book.lock();
        let nonce = book.next_nonce(&from.address);
        let transfer = SignedTransfer::sign(&from.keypair(), &from.address, to, amount, fee_budget, nonce);
        book.submit(transfer)
    }

    fn generate_account(&self) -> Result<Account> {
        Ok(Account::generate())
    }
}
