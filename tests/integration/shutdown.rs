use std::time::Duration;

use livechat_engine::shutdown::{ShutdownCoordinator, Wait};

#[tokio::test]
async fn shutdown_notifies_waiters() {
    let shutdown = ShutdownCoordinator::shared();
    let waiter = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            true
        })
    };

    // Give the task time to start waiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok());
}

/// Shutdown requested before anyone waits must still release the waiter.
#[tokio::test]
async fn shutdown_before_wait_does_not_deadlock() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let handle = shutdown.clone();
    let waiter = tokio::spawn(async move {
        handle.wait_for_shutdown().await;
        true
    });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "wait_for_shutdown() deadlocked despite shutdown already requested");
}

#[tokio::test]
async fn shutdown_concurrent_waiters_all_notified() {
    let shutdown = ShutdownCoordinator::shared();

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let handle = shutdown.clone();
        waiters.push(tokio::spawn(async move {
            handle.wait_for_shutdown().await;
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(result.is_ok(), "A waiter was not notified of shutdown");
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_cuts_long_sleep_short() {
    let shutdown = ShutdownCoordinator::shared();
    let sleeper = {
        let handle = shutdown.clone();
        tokio::spawn(async move { handle.sleep(Duration::from_secs(3600)).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let start = tokio::time::Instant::now();
    shutdown.request_shutdown();

    assert_eq!(sleeper.await.unwrap(), Wait::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn shutdown_drops_pending_future() {
    let shutdown = ShutdownCoordinator::shared();
    let runner = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle
                .run_until_shutdown(std::future::pending::<()>())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("runner did not observe shutdown")
        .unwrap();
    assert_eq!(result, None);
}
