//! Integration tests for credential refresh scheduling and failure handling

use crate::support::{credential, MockAuthorizer};
use chrono::{Duration as ChronoDuration, Utc};
use livechat_engine::auth::{AuthError, Credential, TokenCoordinator, TokenState};
use livechat_engine::config::TokenConfig;
use livechat_engine::engine::BackoffPolicy;
use livechat_engine::{ErrorKind, ErrorSource, Event, EventKind, HandlerRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn token_config(max_attempts: u32) -> TokenConfig {
    TokenConfig {
        early_refresh_window: Duration::from_secs(300),
        max_refresh_attempts: max_attempts,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 2.0, 0.0),
    }
}

fn transient() -> Result<Credential, AuthError> {
    Err(AuthError::Transient("HTTP 503".into()))
}

fn renewed(token: &str) -> Result<Credential, AuthError> {
    Ok(Credential::new(
        token,
        Utc::now() + ChronoDuration::hours(1),
        "",
        Vec::new(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_refresh_fires_inside_early_window() {
    let authorizer = MockAuthorizer::new();
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::minutes(10)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    tokens.start().unwrap();
    assert_eq!(tokens.state(), TokenState::Active);

    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    assert_eq!(tokens.access_token(), "initial");
    assert_eq!(authorizer.calls(), 0);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(tokens.access_token(), "refreshed-1");
    assert_eq!(authorizer.calls(), 1);
    assert_eq!(tokens.state(), TokenState::Active);

    tokens.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_credential_refreshes_immediately() {
    let authorizer = MockAuthorizer::new();
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::minutes(-1)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    tokens.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(tokens.access_token(), "refreshed-1");
    tokens.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_coalesce() {
    let authorizer = MockAuthorizer::delayed(Duration::from_millis(100));
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::hours(1)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    let (a, b) = tokio::join!(tokens.refresh_now(), tokens.refresh_now());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(authorizer.calls(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.access_token, "refreshed-1");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_and_keep_refresh_token() {
    let authorizer = MockAuthorizer::scripted(vec![transient(), transient(), renewed("third-time")]);
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::hours(1)),
        token_config(5),
        HandlerRegistry::shared(),
    );
    let observed = Arc::new(Mutex::new(Vec::new()));
    let out = observed.clone();
    tokens.on_refreshed(move |credential| out.lock().push(credential.access_token.clone()));

    let fresh = tokens.refresh_now().await.unwrap();

    assert_eq!(authorizer.calls(), 3);
    assert_eq!(fresh.access_token, "third-time");
    // The server omitted a refresh token, so the previous one is kept.
    assert_eq!(fresh.refresh_token, "refresh-1");
    assert_eq!(*observed.lock(), vec!["third-time".to_string()]);
    assert_eq!(tokens.state(), TokenState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_stop_and_publish_fatal_error() {
    let registry = HandlerRegistry::shared();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let out = errors.clone();
    registry.subscribe(EventKind::EngineError, move |event| {
        if let Event::EngineError(e) = event {
            out.lock().push(e.clone());
        }
    });

    let authorizer = MockAuthorizer::scripted(vec![transient(), transient(), transient()]);
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::hours(1)),
        token_config(3),
        registry,
    );

    let err = tokens.refresh_now().await.unwrap_err();
    assert!(matches!(err, AuthError::RefreshExhausted { attempts: 3, .. }));
    assert_eq!(authorizer.calls(), 3);
    assert_eq!(tokens.state(), TokenState::Stopped);
    assert_eq!(tokens.access_token(), "initial");

    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, ErrorSource::TokenRefresh);
        assert_eq!(errors[0].kind, ErrorKind::Unauthorized);
        assert!(errors[0].fatal);
    }

    assert_eq!(tokens.refresh_now().await.unwrap_err(), AuthError::Stopped);
    assert_eq!(authorizer.calls(), 3);
}

#[tokio::test]
async fn test_rejected_refresh_token_is_not_retried() {
    let authorizer =
        MockAuthorizer::scripted(vec![Err(AuthError::Rejected("invalid_grant: revoked".into()))]);
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::hours(1)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    let err = tokens.refresh_now().await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected(_)));
    assert!(!err.is_retryable());
    assert_eq!(authorizer.calls(), 1);
    assert_eq!(tokens.state(), TokenState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_coordinator_never_refreshes() {
    let authorizer = MockAuthorizer::new();
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::minutes(10)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    tokens.start().unwrap();
    tokens.stop().await;
    tokens.stop().await;
    assert_eq!(tokens.state(), TokenState::Stopped);

    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    assert_eq!(authorizer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let authorizer = MockAuthorizer::new();
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::minutes(-1)),
        token_config(5),
        HandlerRegistry::shared(),
    );

    tokens.start().unwrap();
    tokens.stop().await;
    tokens.start().unwrap();
    assert_eq!(tokens.state(), TokenState::Active);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(tokens.access_token(), "refreshed-1");
    tokens.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_window_longer_than_lifetime_does_not_spin() {
    let authorizer = MockAuthorizer::new();
    let config = TokenConfig {
        early_refresh_window: Duration::from_secs(2 * 60 * 60),
        ..token_config(5)
    };
    let tokens = TokenCoordinator::new(
        authorizer.clone(),
        credential(ChronoDuration::minutes(-1)),
        config,
        HandlerRegistry::shared(),
    );

    tokens.start().unwrap();
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    // Renewed credentials live one hour; the next renewal waits half of that.
    assert_eq!(authorizer.calls(), 1);
    assert_eq!(tokens.access_token(), "refreshed-1");
    assert_eq!(tokens.state(), TokenState::Active);
    tokens.stop().await;
}
