//! Hopline Routing Engine
//!
//! Takes one inbound transfer and moves it through a fixed, layered graph of
//! fresh holding accounts before consolidating it to the recipient.
//!
//! # Architecture
//!
//! - **Value model**: exact integer split, fee deduction and clamping
//! - **Route graph**: the stage topology as data, validated up front
//! - **Scheduler**: stage-gated execution with one task per source account
//! - **Run state**: every edge persisted by `(stage, index)`, resumable
//!
//! # Invariants
//!
//! - Conservation: delivered == inbound - Σ(fees of confirmed edges), minus dust
//! - No account spends before every transfer into it is confirmed
//! - No transfer spends more than the live balance of its source
//! - A confirmed edge is never submitted again

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounts;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod value;

// Re-exports
pub use accounts::AccountFactory;
pub use config::Config;
pub use error::{InboundRejection, Result, RouteError};
pub use events::{EdgeSummary, RouteEvent, RouteOutcome, StageSummary};
pub use graph::{EdgeKey, Holdings, PlannedEdge, RouteGraph, Share, Slot, StageId, Target, Tier};
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduler::{RouteRequest, RouteScheduler};
pub use state::{EdgeRecord, EdgeStatus, RunPhase, RunState};
pub use store::{FileRunStore, MemoryRunStore, RunStore};
