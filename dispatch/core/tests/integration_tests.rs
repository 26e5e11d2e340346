//! Integration tests for the dispatch pipeline
//!
//! These tests drive requests through a real [`Dispatcher`] backed by
//! simulated providers. Time is paused, so latencies and deadlines elapse
//! instantly and deterministically.
//!
//! Tests cover:
//! - End-to-end completion with metrics and pool accounting
//! - Priority ordering across the queue and worker
//! - Queue expiry while capacity is saturated
//! - Abort of queued and running requests
//! - Retries, connect timeouts and reconnects on the real path
//! - Streaming, batches, routing and shutdown

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use dispatch_core::{
    CompletionRequest, ConnectionState, DispatchConfig, DispatchError, DispatchEvent, Dispatcher,
    ErrorKind, HealthStatus, NoJitter, Priority, ProviderStatus, RequestId, RequestStatus,
    SimulatedBehavior, SimulatedProviderFactory, StreamingToken,
};

// =============================================================================
// Helpers
// =============================================================================

/// Defaults with short, jitter-free retry backoff
fn config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.retry.base_delay_ms = 100;
    config.retry.jitter_factor = 0.0;
    config
}

/// Dispatcher with one simulated provider `sim-1`, not yet started
fn dispatcher_with(
    config: DispatchConfig,
    behavior: SimulatedBehavior,
) -> (Arc<Dispatcher>, SimulatedProviderFactory) {
    let dispatcher = Dispatcher::with_jitter(config, Arc::new(NoJitter));
    let factory = SimulatedProviderFactory::new(behavior);
    dispatcher
        .add_provider(factory.spec("sim-1"), Arc::new(factory.clone()))
        .unwrap();
    (dispatcher, factory)
}

fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest::new(prompt, "")
}

/// Everything buffered on the receiver right now
fn drain(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_started(rx: &mut broadcast::Receiver<DispatchEvent>, id: &RequestId) {
    loop {
        match rx.recv().await {
            Ok(DispatchEvent::Started { request_id, .. }) if &request_id == id => return,
            Ok(_) => {}
            Err(e) => panic!("event stream ended before {id} started: {e}"),
        }
    }
}

// =============================================================================
// Test 1: End-to-End Completion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_execute_completes_and_updates_accounting() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    let outcome = dispatcher
        .execute(None, request("hello world"), Priority::Normal)
        .await
        .unwrap();

    assert_eq!(outcome.provider_id, "sim-1");
    assert_eq!(
        outcome.response.content,
        "Simulated response to: hello world"
    );
    assert_eq!(outcome.response.usage.total(), 7);
    assert!(outcome.latency_ms >= 50);
    assert!(outcome.violations.is_empty());
    assert_eq!(
        dispatcher.status(&outcome.request_id),
        Some(RequestStatus::Completed)
    );

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.request_count, 1);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.error_count, 0);
    assert_eq!(snapshot.total_tokens, 7);

    let pool = dispatcher.pool_stats("sim-1").unwrap();
    assert_eq!(pool.in_use, 0);
    assert_eq!(pool.idle, 1);
    assert_eq!(pool.created, 1);
    assert_eq!(factory.script().stats().connects, 1);
    assert_eq!(
        dispatcher.connection_states("sim-1")[0].1,
        ConnectionState::Connected
    );

    // Request lifecycle events arrive in order
    let lifecycle: Vec<&'static str> = drain(&mut events)
        .iter()
        .filter(|e| e.request_id() == Some(&outcome.request_id))
        .map(DispatchEvent::name)
        .collect();
    assert_eq!(lifecycle, vec!["queued", "started", "completed"]);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_is_reused_across_requests() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::default());
    dispatcher.start();

    for i in 0..4 {
        dispatcher
            .execute(None, request(&format!("prompt {i}")), Priority::Normal)
            .await
            .unwrap();
    }

    let pool = dispatcher.pool_stats("sim-1").unwrap();
    assert_eq!(pool.created, 1);
    assert_eq!(factory.script().stats().connects, 1);
    assert_eq!(factory.script().stats().calls, 4);
    assert_eq!(dispatcher.metrics_snapshot("sim-1").unwrap().request_count, 4);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 2: Priority Ordering
// =============================================================================

/// Three `high` and two `normal` requests queued before the worker starts are
/// served all-high-first, each class in insertion order.
#[tokio::test(start_paused = true)]
async fn test_high_priority_served_before_normal() {
    let mut config = config();
    config.executor.max_concurrent = 1;
    config.queue.per_priority.high = 5;
    config.queue.per_priority.normal = 5;
    let (dispatcher, _factory) = dispatcher_with(config, SimulatedBehavior::instant());
    let mut events = dispatcher.subscribe();

    let n1 = dispatcher.enqueue(None, request("n1"), Priority::Normal).unwrap();
    let h1 = dispatcher.enqueue(None, request("h1"), Priority::High).unwrap();
    let n2 = dispatcher.enqueue(None, request("n2"), Priority::Normal).unwrap();
    let h2 = dispatcher.enqueue(None, request("h2"), Priority::High).unwrap();
    let h3 = dispatcher.enqueue(None, request("h3"), Priority::High).unwrap();

    let expected: Vec<RequestId> = [&h1, &h2, &h3, &n1, &n2]
        .iter()
        .map(|h| h.id().clone())
        .collect();

    dispatcher.start();
    for handle in [n1, h1, n2, h2, h3] {
        handle.wait().await.unwrap();
    }

    let started: Vec<RequestId> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DispatchEvent::Started { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, expected);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 3: Back-pressure and Expiry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_full_is_backpressure() {
    let mut config = config();
    config.queue.max_size = 2;
    let (dispatcher, _factory) = dispatcher_with(config, SimulatedBehavior::instant());

    let _a = dispatcher.enqueue(None, request("a"), Priority::Low).unwrap();
    let _b = dispatcher.enqueue(None, request("b"), Priority::High).unwrap();
    let err = dispatcher
        .enqueue(None, request("c"), Priority::High)
        .unwrap_err();

    assert!(matches!(err, DispatchError::QueueFull { max: 2 }));
    assert!(err.is_backpressure());
    assert_eq!(dispatcher.queue_stats().total_queued, 2);

    dispatcher.shutdown().await;
}

/// With every execution slot busy, a queued request expires in place.
#[tokio::test(start_paused = true)]
async fn test_queued_request_expires_while_capacity_is_busy() {
    let mut config = config();
    config.executor.max_concurrent = 1;
    config.queue.item_timeout_ms = 1_000;
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(5));
    let (dispatcher, _factory) = dispatcher_with(config, behavior);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    let running = dispatcher.enqueue(None, request("slow"), Priority::High).unwrap();
    let waiting = dispatcher.enqueue(None, request("late"), Priority::High).unwrap();
    let waiting_id = waiting.id().clone();

    let err = waiting.wait().await.unwrap_err();
    assert!(matches!(err, DispatchError::QueueTimeout(ref id) if *id == waiting_id.to_string()));
    assert_eq!(dispatcher.status(&waiting_id), Some(RequestStatus::TimedOut));

    // The running request is unaffected
    running.wait().await.unwrap();

    let timeouts: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, DispatchEvent::QueueTimeout { .. }))
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].request_id(), Some(&waiting_id));

    // Expiry is back-pressure, not a provider failure
    assert_eq!(dispatcher.metrics_snapshot("sim-1").unwrap().error_count, 0);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 4: Abort
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_abort_queued_request() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    let handle = dispatcher.enqueue(None, request("never"), Priority::Normal).unwrap();
    let id = handle.id().clone();

    dispatcher.abort(&id).unwrap();

    assert!(matches!(handle.wait().await, Err(DispatchError::Aborted(_))));
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Aborted));
    assert_eq!(dispatcher.queue_stats().total_queued, 0);
    assert!(matches!(
        dispatcher.abort(&id),
        Err(DispatchError::RequestNotFound(_))
    ));
    assert_eq!(factory.script().stats().calls, 0);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_running_request_cancels_provider() {
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(10));
    let (dispatcher, factory) = dispatcher_with(config(), behavior);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    let handle = dispatcher.enqueue(None, request("long"), Priority::Normal).unwrap();
    let id = handle.id().clone();
    wait_for_started(&mut events, &id).await;
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Running));

    dispatcher.abort(&id).unwrap();

    assert!(matches!(handle.wait().await, Err(DispatchError::Aborted(_))));
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Aborted));
    assert_eq!(factory.script().stats().cancels, 1);
    assert_eq!(dispatcher.in_flight(), 0);

    // The connection went back to the pool
    let pool = dispatcher.pool_stats("sim-1").unwrap();
    assert_eq!(pool.in_use, 0);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, DispatchEvent::Aborted { request_id, .. } if *request_id == id)));

    dispatcher.shutdown().await;
}

/// Aborting right after the worker picks a request up, before it has
/// started executing, still cancels it.
#[tokio::test(start_paused = true)]
async fn test_abort_just_after_dequeue() {
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(10));
    let (dispatcher, _factory) = dispatcher_with(config(), behavior);
    dispatcher.start();

    let handle = dispatcher.enqueue(None, request("picked up"), Priority::High).unwrap();
    let id = handle.id().clone();
    tokio::task::yield_now().await;
    assert_eq!(dispatcher.queue_stats().total_queued, 0);

    assert!(dispatcher.abort(&id).is_ok());

    assert!(matches!(handle.wait().await, Err(DispatchError::Aborted(_))));
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Aborted));
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(dispatcher.queue_stats().active, 0);
    assert!(matches!(
        dispatcher.abort(&id),
        Err(DispatchError::RequestNotFound(_))
    ));

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_unknown_request() {
    let (dispatcher, _factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    let err = dispatcher.abort(&RequestId::new("nope")).unwrap_err();
    assert!(matches!(err, DispatchError::RequestNotFound(ref id) if id == "nope"));
    dispatcher.shutdown().await;
}

// =============================================================================
// Test 5: Retries and Connection Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_transparently() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    factory.script().fail_next(2, ErrorKind::ServiceUnavailable);
    dispatcher.start();

    let outcome = dispatcher
        .execute(None, request("eventually"), Priority::Normal)
        .await
        .unwrap();

    // 100ms + 200ms of backoff
    assert!(outcome.latency_ms >= 300);
    let stats = factory.script().stats();
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.failures, 2);

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.error_count, 0);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_fails_request() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    factory.script().fail_next(10, ErrorKind::Network);
    dispatcher.start();

    let handle = dispatcher.enqueue(None, request("doomed"), Priority::Normal).unwrap();
    let id = handle.id().clone();
    let err = handle.wait().await.unwrap_err();

    match err {
        DispatchError::RetryExhausted { attempts, source } => {
            assert_eq!(attempts, 4);
            assert_eq!(source.kind, ErrorKind::Network);
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(factory.script().stats().calls, 4);
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Failed));

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.errors_by_kind.get("network"), Some(&1));

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_provider_error_is_not_retried() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    factory.script().fail_next(1, ErrorKind::InvalidRequest);
    dispatcher.start();

    let err = dispatcher
        .execute(None, request("bad"), Priority::Normal)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Provider(ref e) if e.kind == ErrorKind::InvalidRequest
    ));
    assert_eq!(factory.script().stats().calls, 1);

    dispatcher.shutdown().await;
}

/// A connect that outlives its `Connecting` deadline leaves the connection
/// in `Error`.
#[tokio::test(start_paused = true)]
async fn test_connect_timeout_leaves_connection_in_error() {
    let mut config = config();
    config.state_machine.connecting_timeout_ms = 1_000;
    config.retry.max_retries = 0;
    let behavior = SimulatedBehavior::instant().with_connect_latency(Duration::from_secs(60));
    let (dispatcher, factory) = dispatcher_with(config, behavior);
    dispatcher.start();

    let err = dispatcher
        .execute(None, request("unreachable"), Priority::Normal)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::RetryExhausted { attempts: 1, ref source } if source.kind == ErrorKind::Timeout
    ));
    assert_eq!(factory.script().stats().connects, 0);

    let states = dispatcher.connection_states("sim-1");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1, ConnectionState::Error);

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.errors_by_kind.get("timeout"), Some(&1));

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_recovers_through_reconnecting() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    factory.script().fail_connect_next(1, ErrorKind::Network);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    dispatcher
        .execute(None, request("second time lucky"), Priority::Normal)
        .await
        .unwrap();

    let entered: Vec<ConnectionState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DispatchEvent::StateEntered { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        entered,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(factory.script().stats().connects, 1);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_reconnects_before_retry() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());
    factory.script().fail_next(1, ErrorKind::Network);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    dispatcher
        .execute(None, request("dropped once"), Priority::Normal)
        .await
        .unwrap();

    let entered: Vec<ConnectionState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DispatchEvent::StateEntered { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        entered,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
    let stats = factory.script().stats();
    assert_eq!(stats.calls, 2);
    assert_eq!(stats.connects, 2);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 6: Pool Limits Through the Dispatcher
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_surfaces_to_caller() {
    let mut config = config();
    config.pool.max_connections = 1;
    config.executor.max_concurrent = 2;
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(5));
    let (dispatcher, _factory) = dispatcher_with(config, behavior);
    dispatcher.start();

    let a = dispatcher.enqueue(None, request("a"), Priority::Normal).unwrap();
    let b = dispatcher.enqueue(None, request("b"), Priority::Normal).unwrap();
    let results = [a.wait().await, b.wait().await];

    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(DispatchError::PoolExhausted { max: 1, .. })))
        .count();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(exhausted, 1);
    assert_eq!(succeeded, 1);

    let pool = dispatcher.pool_stats("sim-1").unwrap();
    assert_eq!(pool.exhausted, 1);
    assert_eq!(pool.in_use, 0);
    // Back-pressure does not count against provider health
    assert_eq!(dispatcher.metrics_snapshot("sim-1").unwrap().error_count, 0);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 7: Streaming
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_streaming_delivers_tokens_then_outcome() {
    let (dispatcher, _factory) = dispatcher_with(config(), SimulatedBehavior::default());
    dispatcher.start();

    let mut stream = dispatcher
        .execute_streaming(None, request("stream this"), Priority::High)
        .unwrap();
    let id = stream.id().clone();

    let mut text = String::new();
    let mut completed = None;
    while let Some(token) = stream.next_token().await {
        match token {
            StreamingToken::Token(t) => text.push_str(&t),
            StreamingToken::Complete { message, .. } => completed = Some(message),
            StreamingToken::Error(e) => panic!("unexpected stream error: {e}"),
        }
    }

    let outcome = stream.finish().await.unwrap();
    assert_eq!(outcome.message, "Simulated response to: stream this");
    assert_eq!(completed.as_deref(), Some(outcome.message.as_str()));
    assert_eq!(text.trim_end(), outcome.message);
    assert_eq!(outcome.usage.prompt_tokens, 2);
    assert_eq!(dispatcher.status(&id), Some(RequestStatus::Completed));

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_streaming_failure_reaches_finish() {
    let mut config = config();
    config.retry.max_retries = 0;
    let (dispatcher, factory) = dispatcher_with(config, SimulatedBehavior::instant());
    factory.script().fail_next(1, ErrorKind::Authentication);
    dispatcher.start();

    let stream = dispatcher
        .execute_streaming(None, request("denied"), Priority::Normal)
        .unwrap();
    let err = stream.finish().await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Provider(ref e) if e.kind == ErrorKind::Authentication
    ));

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 8: Routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_routing_follows_registration_order_and_status() {
    let (dispatcher, _first) = dispatcher_with(config(), SimulatedBehavior::instant());
    let second = SimulatedProviderFactory::new(SimulatedBehavior::instant());
    dispatcher
        .add_provider(second.spec("sim-2"), Arc::new(second.clone()))
        .unwrap();
    dispatcher.start();

    let outcome = dispatcher
        .execute(None, request("first"), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(outcome.provider_id, "sim-1");

    dispatcher
        .set_provider_status("sim-1", ProviderStatus::Inactive)
        .unwrap();
    let outcome = dispatcher
        .execute(None, request("second"), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(outcome.provider_id, "sim-2");

    // Explicitly targeting an inactive provider is rejected
    let err = dispatcher
        .enqueue(Some("sim-1"), request("third"), Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProviderNotFound(_)));

    let outcome = dispatcher
        .execute(Some("sim-2"), request("fourth"), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(outcome.provider_id, "sim-2");

    dispatcher
        .set_provider_status("sim-2", ProviderStatus::Error)
        .unwrap();
    let err = dispatcher
        .enqueue(None, request("nowhere"), Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProviderNotFound(_)));

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_and_removed_providers() {
    let (dispatcher, factory) = dispatcher_with(config(), SimulatedBehavior::instant());

    let err = dispatcher
        .add_provider(factory.spec("sim-1"), Arc::new(factory.clone()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyRegistered(ref id) if id == "sim-1"));

    dispatcher.remove_provider("sim-1").await.unwrap();
    assert!(dispatcher.pool_stats("sim-1").is_none());
    assert!(matches!(
        dispatcher.enqueue(Some("sim-1"), request("gone"), Priority::Normal),
        Err(DispatchError::ProviderNotFound(_))
    ));
    assert!(matches!(
        dispatcher.remove_provider("sim-1").await,
        Err(DispatchError::ProviderNotFound(_))
    ));

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 9: Batches
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_batch_isolates_failures() {
    let mut config = config();
    config.retry.max_retries = 0;
    let (dispatcher, factory) = dispatcher_with(config, SimulatedBehavior::instant());
    factory.script().fail_next(1, ErrorKind::InvalidRequest);

    let report = dispatcher
        .run_batch(
            "model-a",
            "sim-1",
            vec![request("one"), request("two"), request("three")],
        )
        .await
        .unwrap();

    assert_eq!(report.model_id, "model-a");
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.plan.slots.is_empty());
    assert!(!dispatcher.executor().scheduler().is_running("model-a"));

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.success_count, 2);
    assert_eq!(snapshot.error_count, 1);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batch_for_same_model_is_rejected() {
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(5));
    let (dispatcher, _factory) = dispatcher_with(config(), behavior);

    let first = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .run_batch("model-a", "sim-1", vec![request("slow")])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = dispatcher
        .run_batch("model-a", "sim-1", vec![request("again")])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyInProgress(ref m) if m == "model-a"));

    // A different model is independent
    let other = dispatcher
        .run_batch("model-b", "sim-1", vec![request("other")])
        .await
        .unwrap();
    assert_eq!(other.succeeded(), 1);

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.succeeded(), 1);

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 10: Health
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_provider_turns_unhealthy() {
    let mut config = config();
    config.retry.max_retries = 0;
    let (dispatcher, factory) = dispatcher_with(config, SimulatedBehavior::instant());
    factory.script().fail_next(4, ErrorKind::InvalidRequest);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    for i in 0..6 {
        let _ = dispatcher
            .execute(None, request(&format!("r{i}")), Priority::Normal)
            .await;
    }

    let snapshot = dispatcher.metrics_snapshot("sim-1").unwrap();
    assert_eq!(snapshot.request_count, 6);
    assert_eq!(snapshot.error_count, 4);
    assert_eq!(snapshot.health, HealthStatus::Unhealthy);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        DispatchEvent::HealthUpdate { status: HealthStatus::Unhealthy, .. }
    )));

    dispatcher.shutdown().await;
}

// =============================================================================
// Test 11: Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_everything_and_disposes_pool() {
    let mut config = config();
    config.executor.max_concurrent = 1;
    let behavior = SimulatedBehavior::instant().with_latency(Duration::from_secs(10));
    let (dispatcher, factory) = dispatcher_with(config, behavior);
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    let running = dispatcher.enqueue(None, request("running"), Priority::High).unwrap();
    let queued = dispatcher.enqueue(None, request("queued"), Priority::Low).unwrap();
    let running_id = running.id().clone();
    let queued_id = queued.id().clone();
    wait_for_started(&mut events, &running_id).await;

    dispatcher.shutdown().await;

    assert!(dispatcher.is_shutting_down());
    assert!(matches!(running.wait().await, Err(DispatchError::ShuttingDown)));
    assert!(matches!(queued.wait().await, Err(DispatchError::ShuttingDown)));
    assert_eq!(dispatcher.status(&running_id), Some(RequestStatus::Aborted));
    assert_eq!(dispatcher.status(&queued_id), Some(RequestStatus::Aborted));
    assert_eq!(dispatcher.in_flight(), 0);
    assert!(dispatcher.pool_stats("sim-1").is_none());
    assert_eq!(factory.script().stats().disconnects, 1);

    assert!(matches!(
        dispatcher.enqueue(None, request("late"), Priority::High),
        Err(DispatchError::ShuttingDown)
    ));

    // Second call is a no-op
    dispatcher.shutdown().await;
}
