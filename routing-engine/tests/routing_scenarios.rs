//! End-to-end routing scenarios against the simulated ledger
//!
//! - Reference amounts and exact conservation
//! - Stage ordering checked on the ledger journal
//! - Failure, abort and resume without double execution
//! - Lost receipts, transient faults, timeouts, cancellation
//! - Fee changes between stages
//! - Inbound validation and leaf skipping

use async_trait::async_trait;
use ledger_client::{
    Account, Address, Amount, FaultKind, FeeQuote, InboundTransaction, JournalKind, LedgerClient,
    LedgerError, SimulatedLedger, SimulationSettings, TransferReceipt, TxHash,
};
use routing_engine::graph::{EdgeTemplate, StageTemplate};
use routing_engine::{
    Config, EdgeKey, EdgeStatus, FileRunStore, InboundRejection, MemoryRunStore, RetryConfig,
    RouteError, RouteEvent, RouteGraph, RouteRequest, RouteScheduler, RunPhase, RunStore, Slot,
    StageId,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

const REFERENCE_VALUE: Amount = 1_000_000_000;
const REFERENCE_DELIVERED: Amount = 999_993_152;
const FEE_PER_EDGE: Amount = 214;
const EDGES: usize = 32;

fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    config.timeouts.call_timeout_ms = 5_000;
    config
}

/// Ledger wrapper that counts generated accounts and can take the node
/// down once a number of transfers went through
struct FlakyLedger {
    inner: SimulatedLedger,
    failing: AtomicBool,
    fail_after: usize,
    generated: AtomicUsize,
}

impl FlakyLedger {
    fn new(inner: SimulatedLedger, fail_after: usize) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            fail_after,
            generated: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LedgerClient for FlakyLedger {
    async fn estimate_fee(&self) -> ledger_client::Result<FeeQuote> {
        self.inner.estimate_fee().await
    }

    async fn get_balance(&self, address: &Address) -> ledger_client::Result<Amount> {
        self.inner.get_balance(address).await
    }

    async fn get_transaction(&self, hash: &TxHash) -> ledger_client::Result<Option<InboundTransaction>> {
        self.inner.get_transaction(hash).await
    }

    async fn submit_transfer(
        &self,
        from: &Account,
        to: &Address,
        amount: Amount,
        fee_budget: Amount,
    ) -> ledger_client::Result<TransferReceipt> {
        if self.failing.load(Ordering::SeqCst) && self.inner.transfer_count() >= self.fail_after {
            return Err(LedgerError::Unavailable("node down".to_string()));
        }
        self.inner.submit_transfer(from, to, amount, fee_budget).await
    }

    fn generate_account(&self) -> ledger_client::Result<Account> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_account()
    }
}

/// Ledger wrapper that raises the network fee once a number of transfers
/// went through
struct FeeStepLedger {
    inner: SimulatedLedger,
    after: usize,
    raised: Amount,
}

#[async_trait]
impl LedgerClient for FeeStepLedger {
    async fn estimate_fee(&self) -> ledger_client::Result<FeeQuote> {
        if self.inner.transfer_count() >= self.after {
            self.inner.set_network_fee(self.raised);
        }
        self.inner.estimate_fee().await
    }

    async fn get_balance(&self, address: &Address) -> ledger_client::Result<Amount> {
        self.inner.get_balance(address).await
    }

    async fn get_transaction(&self, hash: &TxHash) -> ledger_client::Result<Option<InboundTransaction>> {
        self.inner.get_transaction(hash).await
    }

    async fn submit_transfer(
        &self,
        from: &Account,
        to: &Address,
        amount: Amount,
        fee_budget: Amount,
    ) -> ledger_client::Result<TransferReceipt> {
        self.inner.submit_transfer(from, to, amount, fee_budget).await
    }

    fn generate_account(&self) -> ledger_client::Result<Account> {
        self.inner.generate_account()
    }
}

struct TestEnvironment {
    ledger: SimulatedLedger,
    store: Arc<MemoryRunStore>,
    scheduler: RouteScheduler,
}

impl TestEnvironment {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: Config) -> Self {
        let ledger = SimulatedLedger::new(config.simulation_settings());
        let store = Arc::new(MemoryRunStore::new());
        let scheduler = RouteScheduler::new(Arc::new(ledger.clone()), store.clone(), &config);
        Self {
            ledger,
            store,
            scheduler,
        }
    }

    fn fund(&self, value: Amount) -> RouteRequest {
        let seed = Account::generate();
        let inbound = self.ledger.deposit(&seed.address, value);
        RouteRequest {
            inbound,
            seed,
            recipient: Account::generate().address,
        }
    }
}

#[tokio::test]
async fn test_reference_scenario() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let recipient = request.recipient.clone();
    let inbound = request.inbound.clone();

    let outcome = env.scheduler.route(request).await.unwrap();

    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
    assert_eq!(outcome.fees, EDGES as Amount * FEE_PER_EDGE);
    assert_eq!(outcome.transfers, EDGES);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(env.ledger.balance_of(&recipient), REFERENCE_DELIVERED);
    assert_eq!(env.ledger.transfer_count(), EDGES);

    let state = env.store.load(&inbound).unwrap().unwrap();
    for index in 0..2 {
        let branch = state.edge(&EdgeKey::new(StageId::Split, index)).unwrap();
        assert_eq!(branch.amount, 500_000_000 - FEE_PER_EDGE);
        assert_eq!(branch.status, EdgeStatus::Confirmed);
    }
    assert_eq!(
        state.phase,
        RunPhase::Completed {
            delivered: REFERENCE_DELIVERED
        }
    );
}

#[tokio::test]
async fn test_conservation_across_amounts() {
    for value in [1_000_000_007u128, 123_456_789_012, 10u128.pow(21) + 3] {
        let env = TestEnvironment::new();
        let request = env.fund(value);
        let recipient = request.recipient.clone();

        let outcome = env.scheduler.route(request).await.unwrap();

        assert_eq!(outcome.delivered + outcome.fees, value, "value {}", value);
        assert_eq!(env.ledger.balance_of(&recipient), outcome.delivered);
    }
}

#[tokio::test]
async fn test_drained_accounts_are_retired() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();

    env.scheduler.route(request).await.unwrap();
    let state = env.store.load(&inbound).unwrap().unwrap();

    assert!(state.accounts.is_empty());
    assert_eq!(state.retired.len(), 21);
    for address in state.retired.values() {
        assert_eq!(env.ledger.balance_of(address), 0, "{} keeps funds", address);
    }
}

#[tokio::test]
async fn test_no_account_spends_before_it_is_funded() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();

    env.scheduler.route(request).await.unwrap();
    let state = env.store.load(&inbound).unwrap().unwrap();
    let journal = env.ledger.journal();

    let sequence_of = |kind: JournalKind, from: &Address, to: &Address, amount: Amount| {
        journal
            .iter()
            .filter(|entry| {
                entry.kind == kind
                    && entry.from.matches(from)
                    && entry.to.matches(to)
                    && entry.amount == amount
            })
            .map(|entry| entry.sequence)
            .last()
            .unwrap()
    };

    let mut submitted = BTreeMap::new();
    let mut confirmed = BTreeMap::new();
    for (key, record) in &state.edges {
        let (from, to) = (&record.from_address, &record.to_address);
        submitted.insert(*key, sequence_of(JournalKind::Submitted, from, to, record.amount));
        confirmed.insert(*key, sequence_of(JournalKind::Confirmed, from, to, record.amount));
    }

    for (spend_key, spend) in &state.edges {
        for (fund_key, fund) in &state.edges {
            let funds_source = fund.to_address.matches(&spend.from_address);
            if funds_source && fund_key.stage < spend_key.stage {
                assert!(
                    confirmed[fund_key] < submitted[spend_key],
                    "{} spent before {} confirmed",
                    spend_key,
                    fund_key
                );
            }
        }
    }

    // stage gate: nothing of a stage is submitted before the previous one settled
    for pair in StageId::ALL.windows(2) {
        let last_confirmed = confirmed
            .iter()
            .filter(|(key, _)| key.stage == pair[0])
            .map(|(_, seq)| *seq)
            .max()
            .unwrap();
        let first_submitted = submitted
            .iter()
            .filter(|(key, _)| key.stage == pair[1])
            .map(|(_, seq)| *seq)
            .min()
            .unwrap();
        assert!(last_confirmed < first_submitted, "{} overlaps {}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_resume_after_failure_between_stages() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.retry.max_attempts = 2;

    let simulated = SimulatedLedger::new(SimulationSettings::default());
    // split (2) + fan-out (6) + consolidate-1 (6)
    let flaky = Arc::new(FlakyLedger::new(simulated.clone(), 14));
    flaky.failing.store(true, Ordering::SeqCst);

    let seed = Account::generate();
    let inbound = simulated.deposit(&seed.address, REFERENCE_VALUE);
    let recipient = Account::generate().address;
    let request = RouteRequest {
        inbound: inbound.clone(),
        seed,
        recipient: recipient.clone(),
    };

    let store = Arc::new(FileRunStore::open(dir.path()).unwrap());
    let scheduler = RouteScheduler::new(flaky.clone(), store.clone(), &config);
    let err = scheduler.route(request).await.unwrap_err();

    match err {
        RouteError::EdgeExecutionFailed { stage, attempts, .. } => {
            assert_eq!(stage, StageId::ShuffleIn);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(simulated.transfer_count(), 14);

    let reopened = FileRunStore::open(dir.path()).unwrap();
    let state = reopened.load(&inbound).unwrap().unwrap();
    assert!(matches!(
        state.phase,
        RunPhase::Aborted {
            stage: Some(StageId::ShuffleIn),
            ..
        }
    ));

    flaky.failing.store(false, Ordering::SeqCst);
    let scheduler = RouteScheduler::new(flaky.clone(), Arc::new(reopened), &config);
    let outcome = scheduler.resume(&inbound).await.unwrap();

    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
    assert_eq!(simulated.balance_of(&recipient), REFERENCE_DELIVERED);
    assert_eq!(simulated.transfer_count(), EDGES);
}

#[tokio::test]
async fn test_completed_run_is_not_executed_again() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();

    let first = env.scheduler.route(request.clone()).await.unwrap();
    let again = env.scheduler.route(request).await.unwrap();
    let resumed = env.scheduler.resume(&inbound).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(first, resumed);
    assert_eq!(env.ledger.transfer_count(), EDGES);
}

#[tokio::test]
async fn test_lost_receipt_is_reconciled() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();
    env.ledger
        .inject_fault(&request.seed.address, FaultKind::LostReceipt, 1);

    let outcome = env.scheduler.route(request).await.unwrap();

    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
    assert_eq!(env.ledger.transfer_count(), EDGES);

    let state = env.store.load(&inbound).unwrap().unwrap();
    let first = state.edge(&EdgeKey::new(StageId::Split, 0)).unwrap();
    assert_eq!(first.status, EdgeStatus::Confirmed);
    assert_eq!(first.attempts, 1);
    assert!(first.receipt.is_none());
}

#[tokio::test]
async fn test_lost_receipt_is_reconciled_after_resume() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.retry.max_attempts = 1;

    let ledger = SimulatedLedger::new(config.simulation_settings());
    let seed = Account::generate();
    let inbound = ledger.deposit(&seed.address, REFERENCE_VALUE);
    let recipient = Account::generate().address;
    ledger.inject_fault(&seed.address, FaultKind::LostReceipt, 1);
    let request = RouteRequest {
        inbound: inbound.clone(),
        seed,
        recipient: recipient.clone(),
    };

    let store = Arc::new(FileRunStore::open(dir.path()).unwrap());
    let scheduler = RouteScheduler::new(Arc::new(ledger.clone()), store, &config);
    let err = scheduler.route(request).await.unwrap_err();
    assert!(matches!(
        err,
        RouteError::EdgeExecutionFailed {
            stage: StageId::Split,
            attempts: 1,
            ..
        }
    ));

    let reopened = Arc::new(FileRunStore::open(dir.path()).unwrap());
    let scheduler = RouteScheduler::new(Arc::new(ledger.clone()), reopened.clone(), &config);
    let outcome = scheduler.resume(&inbound).await.unwrap();

    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
    assert_eq!(ledger.balance_of(&recipient), REFERENCE_DELIVERED);
    assert_eq!(ledger.transfer_count(), EDGES);

    let state = reopened.load(&inbound).unwrap().unwrap();
    let first = state.edge(&EdgeKey::new(StageId::Split, 0)).unwrap();
    assert_eq!(first.status, EdgeStatus::Confirmed);
    assert_eq!(first.attempts, 1);
    assert!(first.receipt.is_none());
}

#[tokio::test]
async fn test_fee_is_refreshed_every_stage() {
    const RAISED_FEE: Amount = 1_000;
    const RAISED_TOTAL: Amount = RAISED_FEE + RAISED_FEE * 19 / 100;

    let config = test_config();
    let simulated = SimulatedLedger::new(config.simulation_settings());
    // split (2) + fan-out (6)
    let ledger = Arc::new(FeeStepLedger {
        inner: simulated.clone(),
        after: 8,
        raised: RAISED_FEE,
    });
    let store = Arc::new(MemoryRunStore::new());
    let scheduler = RouteScheduler::new(ledger, store.clone(), &config);

    let seed = Account::generate();
    let inbound = simulated.deposit(&seed.address, REFERENCE_VALUE);
    let recipient = Account::generate().address;
    let outcome = scheduler
        .route(RouteRequest {
            inbound: inbound.clone(),
            seed,
            recipient: recipient.clone(),
        })
        .await
        .unwrap();

    let expected_fees = 8 * FEE_PER_EDGE + 24 * RAISED_TOTAL;
    assert_eq!(outcome.fees, expected_fees);
    assert_eq!(outcome.delivered, REFERENCE_VALUE - expected_fees);
    assert_eq!(simulated.balance_of(&recipient), outcome.delivered);
    assert_eq!(simulated.transfer_count(), EDGES);

    let state = store.load(&inbound).unwrap().unwrap();
    let fan_out = state.edge(&EdgeKey::new(StageId::FanOut, 0)).unwrap();
    let merge = state.edge(&EdgeKey::new(StageId::Consolidate1, 0)).unwrap();
    assert_eq!(fan_out.fee, FEE_PER_EDGE);
    assert_eq!(merge.fee, RAISED_TOTAL);
    // merges spend what fan-out actually confirmed, not nominal shares
    assert_eq!(merge.gross, merge.amount + RAISED_TOTAL);
}

#[tokio::test]
async fn test_existing_run_rejects_other_parties() {
    let env = TestEnvironment::new();
    let request = env.fund(REFERENCE_VALUE);
    let recipient = request.recipient.clone();
    env.scheduler.route(request.clone()).await.unwrap();

    let mut redirected = request.clone();
    redirected.recipient = Account::generate().address;
    let err = env.scheduler.route(redirected).await.unwrap_err();
    assert!(matches!(err, RouteError::RunMismatch { field: "recipient", .. }));

    let mut reseeded = request.clone();
    reseeded.seed = Account::generate();
    let err = env.scheduler.route(reseeded).await.unwrap_err();
    assert!(matches!(err, RouteError::RunMismatch { field: "seed", .. }));

    let mut shouting = request;
    shouting.recipient = Address::new(recipient.as_str().to_ascii_uppercase());
    let again = env.scheduler.route(shouting).await.unwrap();
    assert_eq!(again.delivered, REFERENCE_DELIVERED);
    assert_eq!(env.ledger.transfer_count(), EDGES);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let env = TestEnvironment::new();
    let mut events = env.scheduler.subscribe();
    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();
    env.ledger
        .inject_fault(&request.seed.address, FaultKind::Unavailable, 2);

    let outcome = env.scheduler.route(request).await.unwrap();
    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);

    let state = env.store.load(&inbound).unwrap().unwrap();
    assert_eq!(state.edge(&EdgeKey::new(StageId::Split, 0)).unwrap().attempts, 3);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RouteEvent::EdgeRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_inbound_to_wrong_destination_is_rejected() {
    let simulated = SimulatedLedger::new(SimulationSettings::default());
    let flaky = Arc::new(FlakyLedger::new(simulated.clone(), usize::MAX));
    let store = Arc::new(MemoryRunStore::new());
    let scheduler = RouteScheduler::new(flaky.clone(), store.clone(), &test_config());

    let seed = Account::generate();
    let elsewhere = Account::generate();
    let inbound = simulated.deposit(&elsewhere.address, REFERENCE_VALUE);

    let err = scheduler
        .route(RouteRequest {
            inbound: inbound.clone(),
            seed,
            recipient: Account::generate().address,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RouteError::InvalidInboundTransaction {
            reason: InboundRejection::WrongDestination { .. },
            ..
        }
    ));
    assert!(!err.is_resumable());
    assert_eq!(flaky.generated.load(Ordering::SeqCst), 0);
    assert_eq!(simulated.transfer_count(), 0);
    assert!(store.load(&inbound).unwrap().is_none());
}

#[tokio::test]
async fn test_inbound_must_exist_and_be_confirmed() {
    let env = TestEnvironment::new();
    let seed = Account::generate();

    let err = env
        .scheduler
        .route(RouteRequest {
            inbound: TxHash::new("0xdoesnotexist"),
            seed: seed.clone(),
            recipient: Account::generate().address,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouteError::InvalidInboundTransaction {
            reason: InboundRejection::NotFound,
            ..
        }
    ));

    let pending = TxHash::new("0xpending");
    env.ledger.insert_transaction(InboundTransaction {
        hash: pending.clone(),
        from: Account::generate().address,
        to: seed.address.clone(),
        value: REFERENCE_VALUE,
        confirmed: false,
    });
    let err = env
        .scheduler
        .route(RouteRequest {
            inbound: pending,
            seed,
            recipient: Account::generate().address,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouteError::InvalidInboundTransaction {
            reason: InboundRejection::NotConfirmed,
            ..
        }
    ));
    assert_eq!(env.ledger.transfer_count(), 0);
}

#[tokio::test]
async fn test_seed_address_matches_case_insensitively() {
    let env = TestEnvironment::new();
    let mut request = env.fund(REFERENCE_VALUE);
    request.seed.address = Address::new(request.seed.address.as_str().to_ascii_uppercase());

    let outcome = env.scheduler.route(request).await.unwrap();
    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
}

#[tokio::test]
async fn test_leaf_edge_without_funds_is_skipped() {
    let stages = vec![
        StageTemplate::new(StageId::Split, vec![EdgeTemplate::full(Slot::SEED, Slot::COLLECTOR)]),
        StageTemplate::new(StageId::Payout, vec![EdgeTemplate::payout(Slot::COLLECTOR)]),
    ];
    let env = TestEnvironment::new();
    let scheduler = env.scheduler.clone().with_graph(RouteGraph::new(stages).unwrap());
    let request = env.fund(400);
    let recipient = request.recipient.clone();

    let outcome = scheduler.route(request).await.unwrap();

    assert_eq!(outcome.delivered, 0);
    assert_eq!(outcome.transfers, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(env.ledger.balance_of(&recipient), 0);
}

#[tokio::test]
async fn test_inner_edge_without_funds_aborts() {
    let env = TestEnvironment::new();
    let request = env.fund(200);
    let inbound = request.inbound.clone();

    let err = env.scheduler.route(request).await.unwrap_err();

    assert!(matches!(
        err,
        RouteError::InsufficientFunds {
            stage: StageId::Split,
            fee: FEE_PER_EDGE,
            ..
        }
    ));
    assert_eq!(err.edge().map(|(stage, _)| stage), Some(StageId::Split));
    let state = env.store.load(&inbound).unwrap().unwrap();
    assert!(matches!(state.phase, RunPhase::Aborted { .. }));
    assert_eq!(env.ledger.transfer_count(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_stage() {
    let env = TestEnvironment::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancelling = env.scheduler.clone().with_shutdown(shutdown_rx);
    shutdown_tx.send(true).unwrap();

    let request = env.fund(REFERENCE_VALUE);
    let inbound = request.inbound.clone();
    let err = cancelling.route(request).await.unwrap_err();

    assert!(matches!(err, RouteError::Cancelled { stage: StageId::Split }));
    assert!(err.is_resumable());
    assert_eq!(env.ledger.transfer_count(), 0);

    let outcome = env.scheduler.resume(&inbound).await.unwrap();
    assert_eq!(outcome.delivered, REFERENCE_DELIVERED);
}

#[tokio::test]
async fn test_run_deadline() {
    let mut config = test_config();
    config.timeouts.run_timeout_secs = Some(0);
    let env = TestEnvironment::with_config(config);

    let err = env
        .scheduler
        .route(env.fund(REFERENCE_VALUE))
        .await
        .unwrap_err();

    assert!(matches!(err, RouteError::DeadlineExceeded { stage: StageId::Split }));
}

#[tokio::test]
async fn test_slow_ledger_call_times_out() {
    let mut config = test_config();
    config.retry.max_attempts = 1;
    config.timeouts.call_timeout_ms = 20;
    let env = TestEnvironment::with_config(config);
    let request = env.fund(REFERENCE_VALUE);
    env.ledger.set_latency(200);

    let err = env.scheduler.route(request).await.unwrap_err();

    assert!(matches!(err, RouteError::Ledger(LedgerError::Timeout(20))));
    assert_eq!(env.ledger.transfer_count(), 0);
}
