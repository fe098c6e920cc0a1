//! Progress events published by the scheduler

use crate::graph::{EdgeKey, Slot, StageId, Target};
use crate::state::{EdgeStatus, RunState};
use ledger_client::{Amount, FeeQuote, TxHash};
use serde::Serialize;
use uuid::Uuid;

/// Result of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteOutcome {
    /// Run identifier
    pub run_id: Uuid,
    /// Inbound transaction hash
    pub inbound: TxHash,
    /// Value received by the recipient
    pub delivered: Amount,
    /// Fees paid across all confirmed edges
    pub fees: Amount,
    /// Confirmed transfers
    pub transfers: usize,
    /// Skipped leaf edges
    pub skipped: usize,
}

impl RouteOutcome {
    /// Summarize a run state
    pub fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id,
            inbound: state.inbound.clone(),
            delivered: state.delivered(),
            fees: state.fees_paid(),
            transfers: state.confirmed().count(),
            skipped: state.skipped(),
        }
    }
}

/// One edge in a stage summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeSummary {
    /// Edge identifier
    pub key: EdgeKey,
    /// Sending slot
    pub from: Slot,
    /// Receiving side
    pub to: Target,
    /// Net amount delivered
    pub amount: Amount,
    /// Fee charged
    pub fee: Amount,
    /// Final status
    pub status: EdgeStatus,
}

/// Per-stage report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    /// Stage identifier
    pub stage: StageId,
    /// Fee quote used for the stage
    pub quote: FeeQuote,
    /// Edges in template order
    pub edges: Vec<EdgeSummary>,
}

impl StageSummary {
    /// Collect the edges of `stage` from a run state
    pub fn collect(state: &RunState, stage: StageId, quote: FeeQuote) -> Self {
        let edges = state
            .edges
            .iter()
            .filter(|(key, _)| key.stage == stage)
            .map(|(key, record)| EdgeSummary {
                key: *key,
                from: record.from,
                to: record.to,
                amount: record.amount,
                fee: record.fee,
                status: record.status,
            })
            .collect();

        Self { stage, quote, edges }
    }

    /// Net value moved by the stage
    pub fn moved(&self) -> Amount {
        self.edges
            .iter()
            .filter(|edge| edge.status == EdgeStatus::Confirmed)
            .map(|edge| edge.amount)
            .sum()
    }
}

/// Scheduler progress event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouteEvent {
    /// New run accepted
    RunStarted {
        /// Inbound transaction hash
        inbound: TxHash,
        /// Inbound value
        value: Amount,
    },
    /// Stage about to execute
    StageStarted {
        /// Stage identifier
        stage: StageId,
        /// Edges still to execute
        pending: usize,
        /// Fee quote for the stage
        quote: FeeQuote,
    },
    /// Edge failed transiently and will be retried
    EdgeRetrying {
        /// Edge identifier
        edge: EdgeKey,
        /// Attempts made so far in this session
        attempt: u32,
        /// Backoff before the next attempt (milliseconds)
        delay_ms: u64,
        /// Failure text
        reason: String,
    },
    /// Leaf edge skipped for lack of funds
    EdgeSkipped {
        /// Edge identifier
        edge: EdgeKey,
        /// Amount that was available
        available: Amount,
    },
    /// Every edge of a stage settled
    StageCompleted(StageSummary),
    /// Payout confirmed
    RunCompleted(RouteOutcome),
    /// Run halted
    RunAborted {
        /// Inbound transaction hash
        inbound: TxHash,
        /// Stage that failed or was not started
        stage: Option<StageId>,
        /// Error text
        reason: String,
    },
}
