mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use ea_fleet_engine::blackout::BlackoutDecision;
use ea_fleet_engine::errors::{DeliveryError, QueueError, ValidationError};
use ea_fleet_engine::execution::{run_queue_worker, Claim, CommandDispatcher, CommandSink};
use ea_fleet_engine::models::{
    AgentKey, Command, CommandKind, CommandRequest, CommandStatus, DeliveryOutcome,
    DispatchOutcome, ImpactLevel, ManualOverride, NewsEvent,
};
use ea_fleet_engine::state::Delta;

use common::{fleet, harness, MockSink};

fn request(command: &str, target: &str) -> CommandRequest {
    CommandRequest {
        command: command.into(),
        parameters: None,
        target: target.into(),
        scheduled_for: None,
    }
}

#[tokio::test]
async fn test_queued_pause_cancelled_before_dispatch() {
    let h = harness(fleet(), MockSink::default()).await;

    let command = h
        .dispatcher
        .enqueue(&request("pause", "symbol_EURUSD"))
        .await
        .unwrap();
    assert_eq!(command.status, CommandStatus::Pending);
    let magics: Vec<i64> = command.targets.iter().map(|t| t.magic_number).collect();
    assert_eq!(magics, vec![1001, 3003]);

    let cancelled = h.dispatcher.cancel(command.id).await.unwrap();
    assert_eq!(cancelled.status, CommandStatus::Cancelled);

    // Start the worker only now: it must find nothing to deliver.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sink: Arc<dyn ea_fleet_engine::execution::CommandSink> = h.sink.clone();
    let worker = tokio::spawn(run_queue_worker(
        h.queue.clone(),
        sink,
        Duration::from_secs(1),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();

    assert_eq!(h.sink.calls(), 0);
    assert_eq!(
        h.queue.get(command.id).await.unwrap().status,
        CommandStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_twice_is_rejected() {
    let h = harness(fleet(), MockSink::default()).await;
    let command = h.dispatcher.enqueue(&request("resume", "all")).await.unwrap();

    h.dispatcher.cancel(command.id).await.unwrap();
    let err = h.dispatcher.cancel(command.id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotCancellable { .. }));
}

#[tokio::test]
async fn test_empty_target_never_queued() {
    let h = harness(fleet(), MockSink::default()).await;

    let err = h
        .dispatcher
        .enqueue(&request("pause", "symbol_USDJPY"))
        .await
        .unwrap_err();

    assert!(matches!(err, ValidationError::EmptyTargets { .. }));
    assert!(h.queue.list().await.is_empty());
    assert_eq!(h.queue.pending_count().await, 0);
}

#[tokio::test]
async fn test_invalid_parameters_rejected_at_admission() {
    let h = harness(fleet(), MockSink::default()).await;

    let mut req = request("adjust_risk", "all");
    req.parameters = Some(json!({ "risk_percent": 250 }));
    let err = h.dispatcher.enqueue(&req).await.unwrap_err();
    assert!(matches!(err, ValidationError::InvalidParameter { field: "risk_percent", .. }));

    let mut req = request("pause", "all");
    req.parameters = Some(json!({ "force": true }));
    let err = h.dispatcher.enqueue(&req).await.unwrap_err();
    assert!(matches!(err, ValidationError::UnexpectedPayload { .. }));

    let err = h.dispatcher.enqueue(&request("reboot", "all")).await.unwrap_err();
    assert!(matches!(err, ValidationError::UnknownCommand(_)));

    assert!(h.queue.list().await.is_empty());
    assert_eq!(h.sink.calls(), 0);
}

#[tokio::test]
async fn test_execute_now_partial_success() {
    let h = harness(fleet(), MockSink::failing(&[2002])).await;

    let report = h.dispatcher.execute_now(&request("pause", "all")).await.unwrap();

    assert_eq!(report.outcome, DispatchOutcome::Partial);
    assert_eq!(report.command.status, CommandStatus::PartialSuccess);
    assert_eq!(report.command.succeeded().len(), 2);

    let failed = report.command.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.magic_number, 2002);
    assert!(failed[0].1.contains("not responding"));

    // Every target was attempted despite the failure.
    assert_eq!(h.sink.calls(), 3);

    // Immediate commands land in the audit list too.
    let audited = h.queue.get(report.command.id).await.unwrap();
    assert_eq!(audited.status, CommandStatus::PartialSuccess);
}

#[tokio::test]
async fn test_execute_now_all_or_nothing_outcomes() {
    let h = harness(fleet(), MockSink::default()).await;
    let report = h.dispatcher.execute_now(&request("resume", "strategy_trend")).await.unwrap();
    assert_eq!(report.outcome, DispatchOutcome::AllSucceeded);
    assert_eq!(report.command.status, CommandStatus::Success);

    let h = harness(fleet(), MockSink::failing(&[1001, 2002, 3003])).await;
    let report = h.dispatcher.execute_now(&request("resume", "all")).await.unwrap();
    assert_eq!(report.outcome, DispatchOutcome::AllFailed);
    assert_eq!(report.command.status, CommandStatus::Failed);
}

#[tokio::test]
async fn test_queue_worker_delivers_in_order() {
    let h = harness(fleet(), MockSink::default()).await;
    let first = h.dispatcher.enqueue(&request("pause", "ea_1001_inst-1001")).await.unwrap();
    let second = h.dispatcher.enqueue(&request("resume", "ea_1001_inst-1001")).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sink: Arc<dyn ea_fleet_engine::execution::CommandSink> = h.sink.clone();
    let worker = tokio::spawn(run_queue_worker(
        h.queue.clone(),
        sink,
        Duration::from_secs(1),
        shutdown_rx,
    ));

    for _ in 0..50 {
        if h.queue.get(second.id).await.unwrap().status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();

    assert_eq!(h.queue.get(first.id).await.unwrap().status, CommandStatus::Success);
    assert_eq!(h.queue.get(second.id).await.unwrap().status, CommandStatus::Success);
    let names: Vec<String> = h
        .sink
        .delivered
        .lock()
        .unwrap()
        .iter()
        .map(|(_, name)| name.clone())
        .collect();
    assert_eq!(names, vec!["pause", "resume"]);
}

#[tokio::test]
async fn test_preview_exposes_blackout_and_override() {
    let h = harness(fleet(), MockSink::default()).await;
    let now = chrono::Utc::now();
    h.store
        .apply_delta(Delta::News(vec![NewsEvent {
            id: "ecb-rate".into(),
            currency: "EUR".into(),
            symbols: vec![],
            impact_level: ImpactLevel::High,
            event_time: now + chrono::Duration::minutes(10),
            pre_minutes: 60,
            post_minutes: 60,
            description: "ECB rate decision".into(),
        }]))
        .await;

    let mut req = request("close_positions", "all");
    req.parameters = Some(json!({ "filter": "all" }));
    let preview = h.dispatcher.preview(&req).await.unwrap();

    assert!(matches!(preview.command, CommandKind::ClosePositions(_)));
    assert_eq!(preview.targets.len(), 3);
    let eur = preview.blackout.iter().find(|d| d.symbol == "EURUSD").unwrap();
    assert!(!eur.trading_allowed);
    let gbp = preview.blackout.iter().find(|d| d.symbol == "GBPUSD").unwrap();
    assert!(gbp.trading_allowed);

    // Preview admits nothing.
    assert!(h.queue.list().await.is_empty());

    h.store
        .apply_delta(Delta::OverrideEnabled(ManualOverride {
            symbol: "EURUSD".into(),
            start_time: now - chrono::Duration::minutes(1),
            end_time: now + chrono::Duration::hours(2),
            reason: "desk approval".into(),
        }))
        .await;
    let preview = h.dispatcher.preview(&req).await.unwrap();
    let eur = preview.blackout.iter().find(|d| d.symbol == "EURUSD").unwrap();
    assert!(eur.trading_allowed);
    assert!(matches!(eur.decision, BlackoutDecision::OverrideAllowed { .. }));
}

/// Accepts every agent except `stalled`, which never answers.
struct StallingSink {
    stalled: i64,
    accepted: Mutex<Vec<i64>>,
}

impl StallingSink {
    fn new(stalled: i64) -> Self {
        Self {
            stalled,
            accepted: Mutex::new(Vec::new()),
        }
    }

    fn accepted(&self) -> Vec<i64> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSink for StallingSink {
    async fn deliver(&self, agent: &AgentKey, _command: &Command) -> Result<(), DeliveryError> {
        if agent.magic_number == self.stalled {
            std::future::pending::<()>().await;
        }
        self.accepted.lock().unwrap().push(agent.magic_number);
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_shutdown_keeps_outcomes_of_finished_targets() {
    let h = harness(fleet(), MockSink::default()).await;
    let mut req = request("close_positions", "symbol_EURUSD");
    req.parameters = Some(json!({ "filter": "all" }));
    let command = h.dispatcher.enqueue(&req).await.unwrap();

    let sink = Arc::new(StallingSink::new(3003));
    let dyn_sink: Arc<dyn CommandSink> = sink.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_queue_worker(
        h.queue.clone(),
        dyn_sink,
        Duration::from_secs(30),
        shutdown_rx,
    ));

    wait_until(|| sink.accepted() == vec![1001]).await;
    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();

    let done = h.queue.get(command.id).await.unwrap();
    assert_eq!(done.status, CommandStatus::PartialSuccess);
    assert_eq!(done.results.len(), 2);

    let closed = done.results.iter().find(|r| r.target.magic_number == 1001).unwrap();
    assert_eq!(closed.outcome, DeliveryOutcome::Delivered);

    let cut = done.results.iter().find(|r| r.target.magic_number == 3003).unwrap();
    match &cut.outcome {
        DeliveryOutcome::Failed { reason, retryable } => {
            assert!(reason.contains("interrupted"));
            assert!(*retryable);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_dropped_execute_request_still_completes() {
    let h = harness(fleet(), MockSink::default()).await;

    /// Answers after a delay, long enough for the caller to give up.
    struct SlowSink;

    #[async_trait]
    impl CommandSink for SlowSink {
        async fn deliver(&self, _agent: &AgentKey, _command: &Command) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    let dispatcher = CommandDispatcher::new(
        h.store.clone(),
        h.queue.clone(),
        Arc::new(SlowSink),
        Duration::from_secs(5),
    );

    // The caller abandons the request mid-delivery.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        dispatcher.execute_now(&request("pause", "all")),
    )
    .await;
    assert!(abandoned.is_err());

    let mut recorded = h.queue.list().await;
    for _ in 0..200 {
        if recorded.first().is_some_and(|c| c.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        recorded = h.queue.list().await;
    }

    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, CommandStatus::Success);
    assert_eq!(recorded[0].results.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_claim_has_one_winner() {
    for _ in 0..50 {
        let h = harness(fleet(), MockSink::default()).await;
        let command = h.dispatcher.enqueue(&request("pause", "all")).await.unwrap();

        let queue = h.queue.clone();
        let claim = tokio::spawn(async move { queue.claim_next(chrono::Utc::now()).await });
        let queue = h.queue.clone();
        let cancel = tokio::spawn(async move { queue.cancel(command.id).await });

        let claimed = matches!(claim.await.unwrap(), Claim::Ready(_));
        let cancelled = cancel.await.unwrap().is_ok();
        assert!(claimed != cancelled, "claimed={claimed} cancelled={cancelled}");

        let status = h.queue.get(command.id).await.unwrap().status;
        if cancelled {
            assert_eq!(status, CommandStatus::Cancelled);
        } else {
            assert_eq!(status, CommandStatus::Executing);
        }
    }
}
