//! Route scheduler: walks the route graph stage by stage
//!
//! Each stage refreshes the fee quote, derives holdings from confirmed
//! edges, binds accounts to new target slots and then runs one task per
//! source slot on a `JoinSet`. Edges that share a source run in order
//! inside that task. A stage only starts after every edge of the previous
//! stage is confirmed or skipped.
//!
//! The run state is persisted after every edge status change. A run that
//! aborts (edge failure, cancellation, deadline) can be resumed with
//! [`RouteScheduler::resume`]; confirmed edges are never sent again.

use crate::accounts::AccountFactory;
use crate::config::Config;
use crate::error::{InboundRejection, Result, RouteError};
use crate::events::{RouteEvent, RouteOutcome, StageSummary};
use crate::graph::{PlannedEdge, RouteGraph, Slot, StageId, StageTemplate};
use crate::retry::RetryPolicy;
use crate::state::{EdgeStatus, RunPhase, RunState};
use crate::store::RunStore;
use crate::value;
use chrono::Utc;
use ledger_client::{
    Account, Address, Amount, FeeQuote, InboundTransaction, LedgerClient, LedgerError, TxHash,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

type SharedState = Arc<Mutex<RunState>>;

/// Input of a new route
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Hash of the transfer into the seed account
    pub inbound: TxHash,
    /// Seed account that received the inbound transfer
    pub seed: Account,
    /// External recipient of the payout
    pub recipient: Address,
}

enum EdgeFailure {
    Ledger(LedgerError),
    Insufficient { available: Amount },
    Route(RouteError),
}

impl From<RouteError> for EdgeFailure {
    fn from(err: RouteError) -> Self {
        EdgeFailure::Route(err)
    }
}

/// Stage-gated, resumable route executor
#[derive(Clone)]
pub struct RouteScheduler {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn RunStore>,
    graph: Arc<RouteGraph>,
    accounts: AccountFactory,
    retry: RetryPolicy,
    call_timeout: Duration,
    run_timeout: Option<Duration>,
    events: broadcast::Sender<RouteEvent>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for RouteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteScheduler")
            .field("stages", &self.graph.stages().len())
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

impl RouteScheduler {
    /// Create a scheduler over the standard route graph
    pub fn new(ledger: Arc<dyn LedgerClient>, store: Arc<dyn RunStore>, config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            accounts: AccountFactory::new(Arc::clone(&ledger)),
            ledger,
            store,
            graph: Arc::new(RouteGraph::standard()),
            retry: RetryPolicy::new(config.retry.clone()),
            call_timeout: config.timeouts.call_timeout(),
            run_timeout: config.timeouts.run_timeout(),
            events,
            shutdown: None,
        }
    }

    /// Use another (validated) route graph
    pub fn with_graph(mut self, graph: RouteGraph) -> Self {
        self.graph = Arc::new(graph);
        self
    }

    /// Stop before the next stage once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Route graph in use
    pub fn graph(&self) -> &RouteGraph {
        &self.graph
    }

    /// Progress events of every run driven by this scheduler
    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    /// Route an inbound transfer; continues the existing run if there is one
    pub async fn route(&self, request: RouteRequest) -> Result<RouteOutcome> {
        if let Some(state) = self.store.load(&request.inbound)? {
            Self::check_same_parties(&state, &request)?;
            info!("Run for {} already exists, continuing it", request.inbound);
            return self.drive(state).await;
        }

        let inbound = self.validate_inbound(&request).await?;
        info!(
            "Accepted inbound transaction {} of {} into seed {}",
            inbound.hash, inbound.value, request.seed.address
        );

        let state = RunState::new(
            request.inbound,
            inbound.value,
            request.seed,
            request.recipient,
        );
        self.store.save(&state)?;
        self.emit(RouteEvent::RunStarted {
            inbound: state.inbound.clone(),
            value: state.inbound_value,
        });

        self.drive(state).await
    }

    fn check_same_parties(state: &RunState, request: &RouteRequest) -> Result<()> {
        let mismatch = |field, persisted: &Address, requested: &Address| RouteError::RunMismatch {
            inbound: state.inbound.clone(),
            field,
            persisted: persisted.clone(),
            requested: requested.clone(),
        };

        if let Some(seed) = state.address_of(&Slot::SEED) {
            if !seed.matches(&request.seed.address) {
                return Err(mismatch("seed", seed, &request.seed.address));
            }
        }
        if !state.recipient.matches(&request.recipient) {
            return Err(mismatch("recipient", &state.recipient, &request.recipient));
        }
        Ok(())
    }

    /// Continue a persisted run
    pub async fn resume(&self, inbound: &TxHash) -> Result<RouteOutcome> {
        let state = self
            .store
            .load(inbound)?
            .ok_or_else(|| RouteError::RunNotFound(inbound.clone()))?;
        self.drive(state).await
    }

    async fn validate_inbound(&self, request: &RouteRequest) -> Result<InboundTransaction> {
        let reject = |reason| RouteError::InvalidInboundTransaction {
            tx: request.inbound.clone(),
            reason,
        };

        let tx = self
            .query("get_transaction", || self.ledger.get_transaction(&request.inbound))
            .await?
            .ok_or_else(|| reject(InboundRejection::NotFound))?;

        if !tx.confirmed {
            return Err(reject(InboundRejection::NotConfirmed));
        }
        if !tx.to.matches(&request.seed.address) {
            return Err(reject(InboundRejection::WrongDestination {
                expected: request.seed.address.to_string(),
                actual: tx.to.to_string(),
            }));
        }
        if tx.value == 0 {
            return Err(reject(InboundRejection::ZeroValue));
        }

        Ok(tx)
    }

    async fn drive(&self, state: RunState) -> Result<RouteOutcome> {
        if state.is_completed() {
            info!("Run {} for {} is already completed", state.run_id, state.inbound);
            return Ok(RouteOutcome::from_state(&state));
        }
        if let RunPhase::Aborted { stage, reason } = &state.phase {
            info!(
                "Resuming run {} (aborted at {:?}: {})",
                state.run_id, stage, reason
            );
        }

        let started = Instant::now();
        let state: SharedState = Arc::new(Mutex::new(state));

        for template in self.graph.stages() {
            let stage = template.id;
            let settled = state.lock().stage_settled(template);
            if settled {
                debug!("Stage {} already settled", stage);
                continue;
            }

            if let Err(err) = self.check_continue(stage, started) {
                return Err(self.abort(&state, Some(stage), err));
            }

            if let Err(err) = self.persist(&state, |s| {
                s.phase = RunPhase::Routing { stage };
                Ok(())
            }) {
                return Err(self.abort(&state, Some(stage), err));
            }

            if let Err(err) = self.run_stage(&state, template).await {
                return Err(self.abort(&state, Some(stage), err));
            }
        }

        self.finish(&state).await
    }

    fn check_continue(&self, stage: StageId, started: Instant) -> Result<()> {
        if let Some(shutdown) = &self.shutdown {
            if *shutdown.borrow() {
                return Err(RouteError::Cancelled { stage });
            }
        }
        if let Some(limit) = self.run_timeout {
            if started.elapsed() >= limit {
                return Err(RouteError::DeadlineExceeded { stage });
            }
        }
        Ok(())
    }

    async fn run_stage(&self, state: &SharedState, template: &StageTemplate) -> Result<()> {
        let stage = template.id;
        let quote = self
            .query("estimate_fee", || self.ledger.estimate_fee())
            .await?;

        let pending = self.persist(state, |s| {
            let planned = self.graph.generate_edges(stage, &s.holdings_before(stage))?;
            let created = self.accounts.materialize(s, template.target_slots())?;
            if created > 0 {
                debug!("Stage {}: bound {} new account(s)", stage, created);
            }
            for edge in &planned {
                s.plan_edge(edge)?;
            }
            Ok(planned
                .into_iter()
                .filter(|edge| {
                    s.edge(&edge.key)
                        .map(|record| !record.status.is_settled())
                        .unwrap_or(true)
                })
                .collect::<Vec<_>>())
        })?;

        info!(
            "Stage {}: {} edge(s) to execute, fee {} + {} per transfer",
            stage,
            pending.len(),
            quote.network_fee,
            quote.surcharge
        );
        self.emit(RouteEvent::StageStarted {
            stage,
            pending: pending.len(),
            quote,
        });

        let mut groups: BTreeMap<Slot, Vec<PlannedEdge>> = BTreeMap::new();
        for edge in pending {
            groups.entry(edge.from).or_default().push(edge);
        }

        let mut tasks = JoinSet::new();
        for (_, edges) in groups {
            let scheduler = self.clone();
            let state = Arc::clone(state);
            tasks.spawn(async move {
                for edge in edges {
                    scheduler.execute_edge(&state, edge, quote).await?;
                }
                Ok::<(), RouteError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| RouteError::Task(e.to_string()))
                .and_then(|result| result);
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!("Stage {}: additional failure: {}", stage, err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let summary = StageSummary::collect(&state.lock(), stage, quote);
        info!(
            "Stage {} completed: {} edge(s), {} moved",
            stage,
            summary.edges.len(),
            summary.moved()
        );
        self.emit(RouteEvent::StageCompleted(summary));
        Ok(())
    }

    fn edge_parties(&self, state: &SharedState, edge: &PlannedEdge) -> Result<Option<(Account, Address)>> {
        let s = state.lock();
        let record = s
            .edge(&edge.key)
            .ok_or_else(|| RouteError::Store(format!("Edge {} is not planned", edge.key)))?;
        if record.status.is_settled() {
            return Ok(None);
        }
        let from = s
            .account(&edge.from)
            .cloned()
            .ok_or_else(|| RouteError::Topology(format!("Slot {} has no signing account", edge.from)))?;
        Ok(Some((from, record.to_address.clone())))
    }

    async fn execute_edge(&self, state: &SharedState, edge: PlannedEdge, quote: FeeQuote) -> Result<()> {
        let (from, to) = match self.edge_parties(state, &edge)? {
            Some(parties) => parties,
            None => return Ok(()),
        };

        let key = edge.key;
        let stage = key.stage;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match self.try_edge(state, &edge, &from, &to, quote).await {
                Ok(()) => return Ok(()),
                Err(EdgeFailure::Route(err)) => return Err(err),
                Err(EdgeFailure::Insufficient { available }) => {
                    return self.insufficient(state, &edge, available, quote);
                }
                Err(EdgeFailure::Ledger(err)) => err,
            };

            let reason = err.to_string();
            let transient = RouteError::LedgerTransient {
                stage,
                edge: key,
                source: err.clone(),
            };

            if self.retry.should_retry(attempts, &err) {
                let delay = self.retry.delay_for(attempts - 1);
                self.persist(state, |s| {
                    let record = s.edge_mut(&key)?;
                    record.status = EdgeStatus::Failed { terminal: false };
                    record.error = Some(reason.clone());
                    Ok(())
                })?;
                warn!(
                    "{} (attempt {}/{}), retrying in {:?}",
                    transient,
                    attempts,
                    self.retry.max_attempts(),
                    delay
                );
                self.emit(RouteEvent::EdgeRetrying {
                    edge: key,
                    attempt: attempts,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason,
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            self.persist(state, |s| {
                let record = s.edge_mut(&key)?;
                record.status = EdgeStatus::Failed { terminal: true };
                record.error = Some(reason.clone());
                Ok(())
            })?;
            error!("Edge {} failed terminally after {} attempt(s): {}", key, attempts, err);
            return Err(RouteError::EdgeExecutionFailed {
                stage,
                edge: key,
                attempts,
                reason,
            });
        }
    }

    async fn try_edge(
        &self,
        state: &SharedState,
        edge: &PlannedEdge,
        from: &Account,
        to: &Address,
        quote: FeeQuote,
    ) -> std::result::Result<(), EdgeFailure> {
        let key = edge.key;
        let available = self
            .call(self.ledger.get_balance(&from.address))
            .await
            .map_err(EdgeFailure::Ledger)?;

        if self.reconcile(state, edge, available)? {
            return Ok(());
        }

        let gross = value::clamp(edge.gross, available);
        let amount = value::deduct_fees(gross, quote.network_fee, quote.surcharge);
        if amount == 0 {
            return Err(EdgeFailure::Insufficient { available: gross });
        }
        let fee = quote.total();

        self.persist(state, |s| {
            let record = s.edge_mut(&key)?;
            record.amount = amount;
            record.fee = fee;
            record.status = EdgeStatus::Submitted;
            record.attempts += 1;
            record.balance_before = Some(available);
            record.submitted_at = Some(Utc::now());
            record.error = None;
            Ok(())
        })?;

        info!(
            "Edge {} {} -> {}: sending {} (fee {})",
            key, edge.from, edge.to, amount, fee
        );
        let receipt = self
            .call(self.ledger.submit_transfer(from, to, amount, fee))
            .await
            .map_err(EdgeFailure::Ledger)?;

        self.persist(state, |s| {
            let record = s.edge_mut(&key)?;
            record.amount = receipt.amount;
            record.fee = receipt.fee;
            record.status = EdgeStatus::Confirmed;
            record.receipt = Some(receipt.hash.clone());
            record.confirmed_at = Some(receipt.confirmed_at);
            Ok(())
        })?;
        debug!("Edge {} confirmed as {}", key, receipt.hash);
        Ok(())
    }

    /// Settle an edge whose last submission never reported back: if the
    /// source balance dropped by at least amount + fee since that
    /// submission, the transfer was applied.
    fn reconcile(&self, state: &SharedState, edge: &PlannedEdge, available: Amount) -> Result<bool> {
        let mut s = state.lock();
        let record = s.edge_mut(&edge.key)?;
        if !record.is_ambiguous() {
            return Ok(false);
        }

        let spent = record.amount.saturating_add(record.fee);
        let dropped = record.balance_before.unwrap_or(0).saturating_sub(available);
        if spent == 0 || dropped < spent {
            return Ok(false);
        }

        record.status = EdgeStatus::Confirmed;
        record.confirmed_at = Some(Utc::now());
        record.error = None;
        info!(
            "Edge {} reconciled: {} already left {}",
            edge.key, spent, record.from_address
        );
        s.touch();
        self.store.save(&s)?;
        Ok(true)
    }

    fn insufficient(
        &self,
        state: &SharedState,
        edge: &PlannedEdge,
        available: Amount,
        quote: FeeQuote,
    ) -> Result<()> {
        let key = edge.key;
        let reason = format!("{} cannot cover fee {}", available, quote.total());

        if edge.leaf {
            self.persist(state, |s| {
                let record = s.edge_mut(&key)?;
                record.status = EdgeStatus::Skipped;
                record.error = Some(reason.clone());
                Ok(())
            })?;
            warn!("Edge {} skipped: {}", key, reason);
            self.emit(RouteEvent::EdgeSkipped { edge: key, available });
            return Ok(());
        }

        self.persist(state, |s| {
            let record = s.edge_mut(&key)?;
            record.status = EdgeStatus::Failed { terminal: true };
            record.error = Some(reason.clone());
            Ok(())
        })?;
        error!("Edge {} has insufficient funds: {}", key, reason);
        Err(RouteError::InsufficientFunds {
            stage: key.stage,
            edge: key,
            available,
            fee: quote.total(),
        })
    }

    async fn finish(&self, state: &SharedState) -> Result<RouteOutcome> {
        let live: Vec<(Slot, Address)> = state
            .lock()
            .accounts
            .iter()
            .map(|(slot, account)| (*slot, account.address.clone()))
            .collect();

        let mut drained = Vec::new();
        for (slot, address) in live {
            match self
                .query("get_balance", || self.ledger.get_balance(&address))
                .await
            {
                Ok(0) => drained.push(slot),
                Ok(dust) => warn!("Slot {} ({}) keeps {} after routing", slot, address, dust),
                Err(e) => warn!("Could not check balance of {} ({}): {}", slot, address, e),
            }
        }

        let outcome = self.persist(state, |s| {
            for slot in &drained {
                s.retire(slot);
            }
            s.phase = RunPhase::Completed {
                delivered: s.delivered(),
            };
            Ok(RouteOutcome::from_state(s))
        })?;

        info!(
            "Run {} completed: {} delivered, {} in fees over {} transfer(s)",
            outcome.run_id, outcome.delivered, outcome.fees, outcome.transfers
        );
        self.emit(RouteEvent::RunCompleted(outcome.clone()));
        Ok(outcome)
    }

    fn abort(&self, state: &SharedState, stage: Option<StageId>, err: RouteError) -> RouteError {
        let reason = err.to_string();
        let inbound = {
            let mut s = state.lock();
            s.phase = RunPhase::Aborted {
                stage,
                reason: reason.clone(),
            };
            s.touch();
            if let Err(e) = self.store.save(&s) {
                error!("Failed to persist aborted run {}: {}", s.run_id, e);
            }
            s.inbound.clone()
        };

        error!("Run for {} aborted: {}", inbound, reason);
        self.emit(RouteEvent::RunAborted {
            inbound,
            stage,
            reason,
        });
        err
    }

    // Saves under the lock so the store never sees versions out of order.
    fn persist<R>(
        &self,
        state: &SharedState,
        update: impl FnOnce(&mut RunState) -> Result<R>,
    ) -> Result<R> {
        let mut s = state.lock();
        let out = update(&mut s)?;
        s.touch();
        self.store.save(&s)?;
        Ok(out)
    }

    fn emit(&self, event: RouteEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn call<T, Fut>(&self, call: Fut) -> std::result::Result<T, LedgerError>
    where
        Fut: Future<Output = ledger_client::Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(
                u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Ledger read with timeout and retry
    async fn query<T, F, Fut>(&self, what: &str, op: F) -> std::result::Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ledger_client::Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.call(op()).await {
                Ok(value) => return Ok(value),
                Err(e) if self.retry.should_retry(attempts, &e) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    warn!(
                        "Ledger {} failed (attempt {}/{}): {}, retrying in {:?}",
                        what,
                        attempts,
                        self.retry.max_attempts(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::store::MemoryRunStore;
    use ledger_client::{SimulatedLedger, SimulationSettings};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        config.timeouts.call_timeout_ms = 1_000;
        config
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let ledger = Arc::new(SimulatedLedger::new(SimulationSettings::default()));
        let scheduler = RouteScheduler::new(ledger, Arc::new(MemoryRunStore::new()), &fast_config());

        let err = scheduler.resume(&TxHash::new("0xmissing")).await.unwrap_err();
        assert!(matches!(err, RouteError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_events_follow_stage_order() {
        let ledger = Arc::new(SimulatedLedger::new(SimulationSettings::default()));
        let scheduler = RouteScheduler::new(
            ledger.clone(),
            Arc::new(MemoryRunStore::new()),
            &fast_config(),
        );
        let mut events = scheduler.subscribe();

        let seed = Account::generate();
        let inbound = ledger.deposit(&seed.address, 1_000_000_000);
        scheduler
            .route(RouteRequest {
                inbound,
                seed,
                recipient: Account::generate().address,
            })
            .await
            .unwrap();

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RouteEvent::StageCompleted(summary) = event {
                completed.push(summary.stage);
            }
        }
        assert_eq!(completed, StageId::ALL.to_vec());
    }
}
