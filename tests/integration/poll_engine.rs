//! Integration tests for the poll loop against a scripted transport

use crate::support::{chat_ended_item, collect_events, credential, next_event, page, MockAuthorizer, MockTransport};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use livechat_engine::auth::{Credential, TokenCoordinator};
use livechat_engine::config::{PollConfig, QuotaConfig, TokenConfig};
use livechat_engine::engine::{
    BackoffPolicy, EngineState, LifecycleError, PollEngine, QuotaTracker, StopOutcome,
};
use livechat_engine::transport::{
    FeedPage, Mutation, MutationOutcome, Transport, TransportError, TransportResult,
};
use livechat_engine::{CloseReason, ErrorKind, ErrorSource, Event, EventKind, HandlerRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

fn fast_config() -> PollConfig {
    PollConfig {
        min_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(50),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 2.0, 0.0),
        jitter_seed: Some(11),
        ..PollConfig::default()
    }
}

struct Harness {
    engine: PollEngine,
    transport: Arc<MockTransport>,
    authorizer: Arc<MockAuthorizer>,
    quota: Arc<QuotaTracker>,
    registry: Arc<HandlerRegistry>,
}

fn harness(script: Vec<TransportResult<FeedPage>>, config: PollConfig) -> Harness {
    let transport = MockTransport::new(script);
    let authorizer = MockAuthorizer::new();
    let registry = HandlerRegistry::shared();
    let quota = Arc::new(QuotaTracker::new(&QuotaConfig::default()));
    let tokens = Arc::new(TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::hours(1)),
        TokenConfig::default(),
        registry.clone(),
    ));
    let engine = PollEngine::new(
        transport.clone(),
        tokens,
        quota.clone(),
        registry.clone(),
        config,
    );

    Harness {
        engine,
        transport,
        authorizer,
        quota,
        registry,
    }
}

fn text_of(event: &Event) -> &str {
    match event {
        Event::TextMessage(msg) => &msg.text,
        other => panic!("expected a text message, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_pages_publish_in_order_across_transient_failure() {
    let h = harness(
        vec![
            Ok(page(&[("a", "one"), ("b", "two"), ("c", "three")], Some("p2"), 5)),
            Err(TransportError::Transient("HTTP 503".into())),
            Ok(page(&[("d", "four"), ("e", "five")], Some("p3"), 5)),
        ],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    for expected in ["one", "two", "three"] {
        assert_eq!(text_of(&next_event(&mut events).await), expected);
    }
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::Transient);
            assert_eq!(e.source, ErrorSource::Fetch);
            assert!(!e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    for expected in ["four", "five"] {
        assert_eq!(text_of(&next_event(&mut events).await), expected);
    }

    h.transport.wait_for_fetches(4).await;
    // The retried fetch reuses the cursor from before the failure.
    assert_eq!(
        h.transport.page_tokens(),
        vec![None, Some("p2".into()), Some("p2".into()), Some("p3".into())]
    );
    assert_eq!(h.engine.cursor().page_token.as_deref(), Some("p3"));
    assert_eq!(h.engine.backoff_state().attempt, 0);
    assert_eq!(h.engine.state(), EngineState::Running);

    assert_eq!(h.engine.stop().await, StopOutcome::Stopped);
    match next_event(&mut events).await {
        Event::ConnectionClosed(closed) => assert_eq!(closed.reason, CloseReason::Requested),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_every_fetch_charges_quota() {
    let h = harness(vec![Ok(page(&[("a", "one")], None, 5))], fast_config());

    h.engine.start().unwrap();
    h.transport.wait_for_fetches(2).await;

    assert_eq!(h.quota.remaining().used, 10);
    // No continuation token on the page: the next fetch repeats the old cursor.
    assert_eq!(h.transport.page_tokens(), vec![None, None]);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_lifecycle_guards() {
    let h = harness(Vec::new(), fast_config());

    h.engine.start().unwrap();
    assert!(matches!(
        h.engine.start(),
        Err(LifecycleError::AlreadyRunning { state: EngineState::Running })
    ));
    assert!(h.engine.reset().is_err());

    assert_eq!(h.engine.stop().await, StopOutcome::Stopped);
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert!(h.engine.reset().is_ok());
}

#[tokio::test]
async fn test_second_stop_publishes_nothing() {
    let h = harness(Vec::new(), fast_config());
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();
    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);

    assert_eq!(h.engine.stop().await, StopOutcome::Stopped);
    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionClosed);

    assert_eq!(h.engine.stop().await, StopOutcome::NotRunning);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_restart_resumes_from_cursor_until_reset() {
    let h = harness(
        vec![
            Ok(page(&[("a", "one")], Some("p2"), 5)),
            Ok(page(&[("b", "two")], Some("p3"), 5)),
        ],
        fast_config(),
    );

    h.engine.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.engine.cursor().page_token.as_deref() != Some("p3") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cursor never advanced");
    h.transport.wait_for_fetches(3).await;
    h.engine.stop().await;

    h.engine.start().unwrap();
    h.transport.wait_for_fetches(4).await;
    h.engine.stop().await;
    assert_eq!(h.transport.page_tokens()[3].as_deref(), Some("p3"));

    h.engine.reset().unwrap();
    assert_eq!(h.engine.cursor().page_token, None);

    h.engine.start().unwrap();
    h.transport.wait_for_fetches(5).await;
    h.engine.stop().await;
    assert_eq!(h.transport.page_tokens()[4], None);
}

#[tokio::test]
async fn test_chat_ended_closes_feed() {
    let mut ended = page(&[("a", "bye")], Some("p2"), 5);
    ended.items.push(chat_ended_item());
    let h = harness(vec![Ok(ended)], fast_config());
    let mut events = collect_events(&h.registry);
    let mut state = h.engine.watch_state();

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    assert_eq!(text_of(&next_event(&mut events).await), "bye");
    match next_event(&mut events).await {
        Event::ConnectionClosed(closed) => assert_eq!(closed.reason, CloseReason::FeedEnded),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }

    state.wait_for(|s| *s == EngineState::Stopped).await.unwrap();
    assert_eq!(h.transport.fetch_count(), 1);
    assert_eq!(h.engine.stop().await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn test_fatal_error_terminates_loop() {
    let h = harness(
        vec![Err(TransportError::Fatal("HTTP 400: invalid liveChatId".into()))],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::Fatal);
            assert!(e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::ConnectionClosed(closed) => {
            assert_eq!(closed.reason, CloseReason::Error(ErrorKind::Fatal));
        }
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_retries() {
    let h = harness(
        vec![
            Err(TransportError::Unauthorized("HTTP 401".into())),
            Ok(page(&[("a", "after refresh")], Some("p2"), 5)),
        ],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::Unauthorized);
            assert!(!e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert_eq!(text_of(&next_event(&mut events).await), "after refresh");

    assert_eq!(h.authorizer.calls(), 1);
    assert_eq!(h.authorizer.refresh_tokens(), vec!["refresh-1".to_string()]);
    let presented = h.transport.access_tokens();
    assert_eq!(presented[0], "initial");
    assert_eq!(presented[1], "refreshed-1");

    h.engine.stop().await;
}

#[tokio::test]
async fn test_repeated_unauthorized_is_fatal() {
    let config = PollConfig {
        max_unauthorized_retries: 2,
        ..fast_config()
    };
    let h = harness(
        (0..3)
            .map(|_| Err(TransportError::Unauthorized("HTTP 401".into())))
            .collect(),
        config,
    );
    let mut events = collect_events(&h.registry);
    let mut state = h.engine.watch_state();

    h.engine.start().unwrap();
    state.wait_for(|s| *s == EngineState::Stopped).await.unwrap();

    let mut closed = None;
    while let Ok(event) = events.try_recv() {
        if let Event::ConnectionClosed(c) = event {
            closed = Some(c.reason);
        }
    }
    assert_eq!(closed, Some(CloseReason::Error(ErrorKind::Unauthorized)));
    assert_eq!(h.authorizer.calls(), 2);
}

#[tokio::test]
async fn test_quota_exhaustion_without_pause_is_fatal() {
    let config = PollConfig {
        pause_on_quota_exhausted: false,
        ..fast_config()
    };
    let h = harness(
        vec![Err(TransportError::QuotaExceeded("HTTP 403 (quotaExceeded)".into()))],
        config,
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::QuotaExceeded);
            assert!(e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionClosed);
}

#[tokio::test]
async fn test_quota_exhaustion_pauses_until_stopped() {
    let h = harness(
        vec![Err(TransportError::QuotaExceeded("HTTP 403 (quotaExceeded)".into()))],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();
    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::QuotaExceeded);
            assert!(!e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }

    // Paused until the next daily boundary; stop must not wait for it.
    tokio::time::timeout(Duration::from_secs(1), h.engine.stop())
        .await
        .expect("stop waited for the quota pause");
    assert_eq!(h.transport.fetch_count(), 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_polling() {
    let h = harness(
        vec![
            Ok(page(&[("a", "explode")], Some("p2"), 5)),
            Ok(page(&[("b", "still here")], Some("p3"), 5)),
        ],
        fast_config(),
    );
    h.registry.subscribe(EventKind::TextMessage, |event| {
        if let Event::TextMessage(msg) = event {
            if msg.text == "explode" {
                panic!("handler bug");
            }
        }
    });
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    // The panic report is published before the remaining handlers run.
    match next_event(&mut events).await {
        Event::EngineError(e) => assert_eq!(e.kind, ErrorKind::HandlerPanic),
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert_eq!(text_of(&next_event(&mut events).await), "explode");
    assert_eq!(text_of(&next_event(&mut events).await), "still here");
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_not_found_and_forbidden_keep_polling() {
    let h = harness(
        vec![
            Err(TransportError::NotFound("HTTP 404 (liveChatNotFound)".into())),
            Err(TransportError::Forbidden("HTTP 403 (forbidden)".into())),
            Ok(page(&[("a", "back again")], Some("p2"), 5)),
        ],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    for expected in [ErrorKind::NotFound, ErrorKind::Forbidden] {
        match next_event(&mut events).await {
            Event::EngineError(e) => {
                assert_eq!(e.kind, expected);
                assert_eq!(e.source, ErrorSource::Fetch);
                assert!(!e.fatal);
            }
            other => panic!("expected an engine error, got {other:?}"),
        }
    }
    assert_eq!(text_of(&next_event(&mut events).await), "back again");

    h.transport.wait_for_fetches(4).await;
    assert_eq!(h.engine.state(), EngineState::Running);
    assert_eq!(h.engine.backoff_state().attempt, 0);
    assert_eq!(h.engine.cursor().page_token.as_deref(), Some("p2"));
    assert_eq!(
        h.transport.page_tokens(),
        vec![None, None, None, Some("p2".into())]
    );

    h.engine.stop().await;
}

#[tokio::test]
async fn test_forbidden_advances_attempt_counter() {
    let h = harness(
        vec![Err(TransportError::Forbidden("HTTP 403 (forbidden)".into()))],
        fast_config(),
    );

    h.engine.start().unwrap();
    h.transport.wait_for_fetches(2).await;

    assert_eq!(h.engine.backoff_state().attempt, 1);
    assert_eq!(h.engine.state(), EngineState::Running);
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_quota_pause_resumes_after_reset_boundary() {
    let h = harness(
        vec![
            Err(TransportError::QuotaExceeded("HTTP 403 (quotaExceeded)".into())),
            Ok(page(&[("a", "new day")], Some("p2"), 5)),
        ],
        fast_config(),
    );
    let mut events = collect_events(&h.registry);
    let until_reset = (h.quota.reset_at() - Utc::now()).to_std().unwrap();
    let started = tokio::time::Instant::now();

    h.engine.start().unwrap();

    // No test-side timers here: the paused clock jumps straight to the reset.
    assert_eq!(events.recv().await.unwrap().kind(), EventKind::ConnectionOpened);
    match events.recv().await.unwrap() {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::QuotaExceeded);
            assert!(!e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert_eq!(text_of(&events.recv().await.unwrap()), "new day");

    assert!(started.elapsed() + Duration::from_secs(1) >= until_reset);
    assert_eq!(h.transport.fetch_count(), 2);
    assert_eq!(h.engine.backoff_state().attempt, 0);
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_feed_end_still_records_progress() {
    let mut ended = page(&[("a", "bye")], Some("p2"), 5);
    ended.items.push(chat_ended_item());
    let h = harness(
        vec![Err(TransportError::Transient("HTTP 503".into())), Ok(ended)],
        fast_config(),
    );
    let mut state = h.engine.watch_state();

    h.engine.start().unwrap();
    h.transport.wait_for_fetches(2).await;
    state.wait_for(|s| *s == EngineState::Stopped).await.unwrap();

    assert_eq!(h.engine.backoff_state().attempt, 0);
    assert_eq!(h.engine.cursor().page_token.as_deref(), Some("p2"));
}

#[tokio::test]
async fn test_inverted_interval_bounds_do_not_kill_loop() {
    let config = PollConfig {
        min_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(5),
        ..fast_config()
    };
    let h = harness(
        vec![
            Ok(page(&[("a", "one")], Some("p2"), 1_000)),
            Ok(page(&[("b", "two")], Some("p3"), 1_000)),
        ],
        config,
    );
    let mut events = collect_events(&h.registry);

    h.engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    assert_eq!(text_of(&next_event(&mut events).await), "one");
    assert_eq!(text_of(&next_event(&mut events).await), "two");
    assert_eq!(h.engine.cursor().next_poll_interval, Duration::from_millis(5));
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
}

struct PanickingTransport;

#[async_trait]
impl Transport for PanickingTransport {
    fn feed_id(&self) -> &str {
        "chat-under-test"
    }

    async fn fetch_page(&self, _page_token: Option<&str>, _credential: &Credential) -> TransportResult<FeedPage> {
        panic!("transport bug");
    }

    async fn mutate(&self, _mutation: &Mutation, _credential: &Credential) -> TransportResult<MutationOutcome> {
        Err(TransportError::Fatal("unused".into()))
    }
}

#[tokio::test]
async fn test_panicking_transport_closes_connection() {
    let registry = HandlerRegistry::shared();
    let tokens = Arc::new(TokenCoordinator::new(
        MockAuthorizer::new(),
        credential(ChronoDuration::hours(1)),
        TokenConfig::default(),
        registry.clone(),
    ));
    let engine = PollEngine::new(
        Arc::new(PanickingTransport),
        tokens,
        Arc::new(QuotaTracker::new(&QuotaConfig::default())),
        registry.clone(),
        fast_config(),
    );
    let mut events = collect_events(&registry);
    let mut state = engine.watch_state();

    engine.start().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), EventKind::ConnectionOpened);
    match next_event(&mut events).await {
        Event::EngineError(e) => {
            assert_eq!(e.kind, ErrorKind::Fatal);
            assert!(e.fatal);
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::ConnectionClosed(closed) => assert_eq!(closed.reason, CloseReason::Aborted),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }

    state.wait_for(|s| *s == EngineState::Stopped).await.unwrap();
    assert_eq!(engine.stop().await, StopOutcome::NotRunning);
    // A dead loop must not leave the engine wedged.
    engine.start().unwrap();
    engine.stop().await;
}
