//! Error types for the routing engine

use crate::graph::{EdgeKey, StageId};
use ledger_client::{Address, Amount, LedgerError, TxHash};
use thiserror::Error;

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RouteError>;

/// Why an inbound transaction cannot start a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRejection {
    /// Ledger has no such transaction
    NotFound,
    /// Transaction exists but is not final
    NotConfirmed,
    /// Transaction was sent somewhere other than the seed account
    WrongDestination {
        /// Seed address that was expected
        expected: String,
        /// Destination found on the ledger
        actual: String,
    },
    /// Transaction carries no value
    ZeroValue,
}

impl std::fmt::Display for InboundRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundRejection::NotFound => write!(f, "transaction not found"),
            InboundRejection::NotConfirmed => write!(f, "transaction not confirmed"),
            InboundRejection::WrongDestination { expected, actual } => {
                write!(f, "sent to {} instead of seed {}", actual, expected)
            }
            InboundRejection::ZeroValue => write!(f, "transaction carries no value"),
        }
    }
}

/// Routing errors
#[derive(Error, Debug)]
pub enum RouteError {
    /// Inbound transfer proof is unusable
    #[error("Invalid inbound transaction {tx}: {reason}")]
    InvalidInboundTransaction {
        /// Inbound transaction hash
        tx: TxHash,
        /// What is wrong with it
        reason: InboundRejection,
    },

    /// Post-fee amount is zero or the balance cannot cover the fee
    #[error("Insufficient funds on edge {edge}: available {available}, fee {fee}")]
    InsufficientFunds {
        /// Stage of the edge
        stage: StageId,
        /// Edge identifier
        edge: EdgeKey,
        /// Amount the edge could spend after clamping
        available: Amount,
        /// Fee budget of one transfer
        fee: Amount,
    },

    /// Transient ledger failure (timeout, transport)
    #[error("Transient ledger failure on edge {edge}: {source}")]
    LedgerTransient {
        /// Stage of the edge
        stage: StageId,
        /// Edge identifier
        edge: EdgeKey,
        /// Underlying ledger error
        #[source]
        source: LedgerError,
    },

    /// Edge could not be executed; the run is halted and resumable
    #[error("Edge {edge} failed after {attempts} attempt(s): {reason}")]
    EdgeExecutionFailed {
        /// Stage of the edge
        stage: StageId,
        /// Edge identifier
        edge: EdgeKey,
        /// Attempts made in this session
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Shutdown requested; no new stage was started
    #[error("Run cancelled before stage {stage}")]
    Cancelled {
        /// First stage not started
        stage: StageId,
    },

    /// Run-level deadline passed; no new stage was started
    #[error("Run deadline exceeded before stage {stage}")]
    DeadlineExceeded {
        /// First stage not started
        stage: StageId,
    },

    /// Ledger call outside any edge failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A run exists for the inbound transaction with other parties
    #[error("Run for {inbound} already routes {field} {persisted}, not {requested}")]
    RunMismatch {
        /// Inbound transaction hash of the existing run
        inbound: TxHash,
        /// `seed` or `recipient`
        field: &'static str,
        /// Address recorded in the run
        persisted: Address,
        /// Address passed to `route`
        requested: Address,
    },

    /// No persisted run for this inbound transaction
    #[error("No run found for inbound transaction {0}")]
    RunNotFound(TxHash),

    /// Route graph is inconsistent
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// Run state persistence error
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No fresh account could be produced
    #[error("Account generation failed: {0}")]
    AccountGeneration(String),

    /// A stage task panicked or was cancelled
    #[error("Stage task failed: {0}")]
    Task(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouteError {
    /// Stage and edge the error belongs to, when it is edge-level
    pub fn edge(&self) -> Option<(StageId, EdgeKey)> {
        match self {
            RouteError::InsufficientFunds { stage, edge, .. }
            | RouteError::LedgerTransient { stage, edge, .. }
            | RouteError::EdgeExecutionFailed { stage, edge, .. } => Some((*stage, *edge)),
            _ => None,
        }
    }

    /// Whether a later `resume` can make progress
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            RouteError::InvalidInboundTransaction { .. } | RouteError::Topology(_)
        )
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(err: serde_json::Error) -> Self {
        RouteError::Store(err.to_string())
    }
}
