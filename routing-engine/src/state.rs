//! Run state: the persisted record of one route
//!
//! A [`RunState`] is keyed by the inbound transaction hash. It binds topology
//! slots to accounts and tracks every edge by [`EdgeKey`]. Holdings for the
//! next stage are always re-derived from confirmed edges, which is what
//! makes a run resumable after a crash or an aborted stage.

use crate::graph::{EdgeKey, Holdings, PlannedEdge, Slot, StageId, StageTemplate, Target};
use crate::error::{Result, RouteError};
use chrono::{DateTime, Utc};
use ledger_client::{Account, Address, Amount, TxHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Edge lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    /// Planned, never submitted
    Pending,
    /// Handed to the ledger, outcome unknown
    Submitted,
    /// Applied on the ledger
    Confirmed,
    /// Last attempt failed
    Failed {
        /// No further attempts in this session
        terminal: bool,
    },
    /// Leaf edge with nothing left to send after fees
    Skipped,
}

impl EdgeStatus {
    /// Confirmed or skipped; never executed again
    pub fn is_settled(&self) -> bool {
        matches!(self, EdgeStatus::Confirmed | EdgeStatus::Skipped)
    }
}

/// Persisted record of one edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Sending slot
    pub from: Slot,
    /// Receiving side
    pub to: Target,
    /// Sender address
    pub from_address: Address,
    /// Recipient address
    pub to_address: Address,
    /// Planned value leaving the source, fees included
    pub gross: Amount,
    /// Net value of the last submission
    pub amount: Amount,
    /// Fee budget of the last submission
    pub fee: Amount,
    /// Lifecycle state
    pub status: EdgeStatus,
    /// Submissions across all sessions
    pub attempts: u32,
    /// Source balance read right before the last submission
    pub balance_before: Option<Amount>,
    /// Ledger transaction hash once confirmed with a receipt
    pub receipt: Option<TxHash>,
    /// Last failure
    pub error: Option<String>,
    /// Last submission time
    pub submitted_at: Option<DateTime<Utc>>,
    /// Confirmation time
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl EdgeRecord {
    fn pending(edge: &PlannedEdge, from_address: Address, to_address: Address) -> Self {
        Self {
            from: edge.from,
            to: edge.to,
            from_address,
            to_address,
            gross: edge.gross,
            amount: 0,
            fee: 0,
            status: EdgeStatus::Pending,
            attempts: 0,
            balance_before: None,
            receipt: None,
            error: None,
            submitted_at: None,
            confirmed_at: None,
        }
    }

    /// A submission was made whose outcome was never observed
    pub fn is_ambiguous(&self) -> bool {
        self.balance_before.is_some()
            && matches!(self.status, EdgeStatus::Submitted | EdgeStatus::Failed { .. })
    }
}

/// Run lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Inbound transaction accepted, no stage started yet
    Validating,
    /// Executing a stage
    Routing {
        /// Current stage
        stage: StageId,
    },
    /// Payout done
    Completed {
        /// Value that reached the recipient
        delivered: Amount,
    },
    /// Halted; resumable unless the cause is permanent
    Aborted {
        /// Stage that failed or was not started
        stage: Option<StageId>,
        /// Error text
        reason: String,
    },
}

/// Persisted state of one route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Run identifier
    pub run_id: Uuid,
    /// Inbound transaction hash (the run key)
    pub inbound: TxHash,
    /// Value of the inbound transaction
    pub inbound_value: Amount,
    /// External recipient
    pub recipient: Address,
    /// Live accounts by slot
    pub accounts: BTreeMap<Slot, Account>,
    /// Drained accounts whose secret was dropped
    pub retired: BTreeMap<Slot, Address>,
    /// Edges by key
    pub edges: BTreeMap<EdgeKey, EdgeRecord>,
    /// Lifecycle
    pub phase: RunPhase,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Start a run for a validated inbound transaction
    pub fn new(inbound: TxHash, inbound_value: Amount, seed: Account, recipient: Address) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            inbound,
            inbound_value,
            recipient,
            accounts: BTreeMap::from([(Slot::SEED, seed)]),
            retired: BTreeMap::new(),
            edges: BTreeMap::new(),
            phase: RunPhase::Validating,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the modification time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Account bound to a slot
    pub fn account(&self, slot: &Slot) -> Option<&Account> {
        self.accounts.get(slot)
    }

    /// Address bound to a slot, live or retired
    pub fn address_of(&self, slot: &Slot) -> Option<&Address> {
        self.accounts
            .get(slot)
            .map(|account| &account.address)
            .or_else(|| self.retired.get(slot))
    }

    /// Whether an address already belongs to this run
    pub fn knows_address(&self, address: &Address) -> bool {
        address.matches(&self.recipient)
            || self.accounts.values().any(|account| account.address.matches(address))
            || self.retired.values().any(|retired| retired.matches(address))
    }

    /// Bind an account to a slot
    pub fn bind(&mut self, slot: Slot, account: Account) {
        self.accounts.insert(slot, account);
    }

    /// Drop the secret of a drained account
    pub fn retire(&mut self, slot: &Slot) -> bool {
        match self.accounts.remove(slot) {
            Some(account) => {
                self.retired.insert(*slot, account.address);
                true
            }
            None => false,
        }
    }

    /// Edge record by key
    pub fn edge(&self, key: &EdgeKey) -> Option<&EdgeRecord> {
        self.edges.get(key)
    }

    /// Mutable edge record by key
    pub fn edge_mut(&mut self, key: &EdgeKey) -> Result<&mut EdgeRecord> {
        self.edges
            .get_mut(key)
            .ok_or_else(|| RouteError::Store(format!("Edge {} is not planned", key)))
    }

    /// Record a planned edge; existing records are kept as they are
    pub fn plan_edge(&mut self, edge: &PlannedEdge) -> Result<()> {
        if self.edges.contains_key(&edge.key) {
            return Ok(());
        }

        let from_address = self
            .address_of(&edge.from)
            .cloned()
            .ok_or_else(|| RouteError::Topology(format!("Slot {} has no account", edge.from)))?;
        let to_address = match edge.to {
            Target::Recipient => self.recipient.clone(),
            Target::Slot(slot) => self
                .address_of(&slot)
                .cloned()
                .ok_or_else(|| RouteError::Topology(format!("Slot {} has no account", slot)))?,
        };

        self.edges
            .insert(edge.key, EdgeRecord::pending(edge, from_address, to_address));
        Ok(())
    }

    /// Every edge of the stage is confirmed or skipped
    pub fn stage_settled(&self, template: &StageTemplate) -> bool {
        (0..template.edges.len()).all(|index| {
            self.edges
                .get(&EdgeKey::new(template.id, index as u16))
                .map(|record| record.status.is_settled())
                .unwrap_or(false)
        })
    }

    /// Holdings derived from the inbound value and every confirmed edge of
    /// earlier stages
    pub fn holdings_before(&self, stage: StageId) -> Holdings {
        let mut holdings = Holdings::new();
        holdings.credit(Slot::SEED, self.inbound_value);

        for (key, record) in self.edges.range(..EdgeKey::new(stage, 0)) {
            if record.status != EdgeStatus::Confirmed {
                continue;
            }
            holdings.debit(record.from, record.amount.saturating_add(record.fee));
            if let Target::Slot(slot) = record.to {
                holdings.credit(slot, record.amount);
            }
            holdings.record_arrival(*key, record.amount);
        }

        holdings
    }

    /// Confirmed edges
    pub fn confirmed(&self) -> impl Iterator<Item = (&EdgeKey, &EdgeRecord)> {
        self.edges
            .iter()
            .filter(|(_, record)| record.status == EdgeStatus::Confirmed)
    }

    /// Value confirmed into the recipient
    pub fn delivered(&self) -> Amount {
        self.confirmed()
            .filter(|(_, record)| record.to == Target::Recipient)
            .map(|(_, record)| record.amount)
            .sum()
    }

    /// Fees paid by confirmed edges
    pub fn fees_paid(&self) -> Amount {
        self.confirmed().map(|(_, record)| record.fee).sum()
    }

    /// Number of skipped edges
    pub fn skipped(&self) -> usize {
        self.edges
            .values()
            .filter(|record| record.status == EdgeStatus::Skipped)
            .count()
    }

    /// Completed runs never execute anything again
    pub fn is_completed(&self) -> bool {
        matches!(self.phase, RunPhase::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RouteGraph, Tier};

    fn state(value: Amount) -> RunState {
        RunState::new(
            TxHash::new("0xinbound"),
            value,
            Account::generate(),
            Address::new("0xrecipient"),
        )
    }

    fn confirm(state: &mut RunState, edge: &PlannedEdge, amount: Amount, fee: Amount) {
        state.plan_edge(edge).unwrap();
        let record = state.edge_mut(&edge.key).unwrap();
        record.amount = amount;
        record.fee = fee;
        record.status = EdgeStatus::Confirmed;
    }

    #[test]
    fn test_holdings_follow_confirmed_edges() {
        let graph = RouteGraph::standard();
        let mut state = state(1_000_000_000);
        state.bind(Slot::new(Tier::Split, 0), Account::generate());
        state.bind(Slot::new(Tier::Split, 1), Account::generate());

        let edges = graph
            .generate_edges(StageId::Split, &state.holdings_before(StageId::Split))
            .unwrap();
        confirm(&mut state, &edges[0], 499_999_786, 214);

        let holdings = state.holdings_before(StageId::FanOut);
        assert_eq!(holdings.balance(&Slot::SEED), 500_000_000);
        assert_eq!(holdings.balance(&Slot::new(Tier::Split, 0)), 499_999_786);
        assert_eq!(holdings.balance(&Slot::new(Tier::Split, 1)), 0);
        assert_eq!(holdings.arrival(&edges[0].key), 499_999_786);

        // same-stage edges do not count yet
        assert_eq!(state.holdings_before(StageId::Split).balance(&Slot::SEED), 1_000_000_000);
        assert!(!state.stage_settled(graph.stage(StageId::Split).unwrap()));
    }

    #[test]
    fn test_plan_edge_requires_bound_accounts() {
        let graph = RouteGraph::standard();
        let mut state = state(1_000);
        let edges = graph
            .generate_edges(StageId::Split, &state.holdings_before(StageId::Split))
            .unwrap();

        assert!(matches!(state.plan_edge(&edges[0]), Err(RouteError::Topology(_))));
    }

    #[test]
    fn test_retire_keeps_address() {
        let mut state = state(1_000);
        let seed = state.account(&Slot::SEED).unwrap().address.clone();

        assert!(state.retire(&Slot::SEED));
        assert!(state.account(&Slot::SEED).is_none());
        assert_eq!(state.address_of(&Slot::SEED), Some(&seed));
        assert!(state.knows_address(&seed));
        assert!(!state.retire(&Slot::SEED));
    }

    #[test]
    fn test_state_json_roundtrip() {
        let mut state = state(1_000_000_000_000_000_000_000);
        state.bind(Slot::new(Tier::Stealth, 1), Account::generate());
        state.phase = RunPhase::Aborted {
            stage: Some(StageId::ShuffleIn),
            reason: "edge failed".to_string(),
        };

        let json = serde_json::to_string(&state).unwrap();
        let restored: RunState = serde_json::from_str(&json).unwrap();

        assert!(json.contains("\"s.1\""));
        assert_eq!(restored.inbound_value, state.inbound_value);
        assert_eq!(restored.phase, state.phase);
        assert_eq!(restored.accounts.len(), 2);
    }
}
