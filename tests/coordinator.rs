//! End-to-end runs of the lifecycle coordinator.

use std::time::{Duration, Instant};

use service_bootstrap::lifecycle::{
    startup, AnyOf, Coordinator, LifecycleError, Outcome, Phase, Shutdown,
};
use service_bootstrap::ServerError;

mod common;

#[tokio::test]
async fn keeps_serving_until_signalled() {
    let addr = common::free_addr();
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.listener.bind_address = addr.to_string();

    let coordinator = Coordinator::new(config, common::test_router(Duration::ZERO, Duration::ZERO));
    let mut phase = coordinator.phase();
    let shutdown = Shutdown::new();
    let run = tokio::spawn(coordinator.run(shutdown.clone()));

    common::wait_for_phase(&mut phase, Phase::Serving).await;
    for _ in 0..3 {
        let res = common::client()
            .get(format!("http://{addr}/fast"))
            .send()
            .await
            .expect("server unreachable");
        assert_eq!(res.status(), 200);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(*phase.borrow(), Phase::Serving);
    assert!(!run.is_finished());

    shutdown.trigger();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Drained);
    assert_eq!(*phase.borrow(), Phase::Terminated);
}

#[tokio::test]
async fn repeated_signals_start_one_drain() {
    let addr = common::free_addr();
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.listener.bind_address = addr.to_string();

    let coordinator = Coordinator::new(
        config,
        common::test_router(Duration::from_millis(500), Duration::ZERO),
    );
    let mut phase = coordinator.phase();
    let mut transitions = coordinator.phase();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while transitions.changed().await.is_ok() {
            let current = *transitions.borrow_and_update();
            seen.push(current);
            if current == Phase::Terminated {
                break;
            }
        }
        seen
    });

    let first = Shutdown::new();
    let second = Shutdown::new();
    let signals = AnyOf::new().with(first.clone()).with(second.clone());
    let run = tokio::spawn(coordinator.run(signals));

    common::wait_for_phase(&mut phase, Phase::Serving).await;
    // Keeps the drain busy long enough for the later signals to land in it.
    let request = common::spawn_get(addr, "/slow");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(first.trigger());
    common::wait_for_phase(&mut phase, Phase::Draining).await;
    assert!(!first.trigger());
    assert!(second.trigger());

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should finish")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Outcome::Drained);
    assert_eq!(request.await.unwrap().unwrap(), "done");

    let seen = recorder.await.unwrap();
    let draining = seen.iter().filter(|p| **p == Phase::Draining).count();
    assert_eq!(draining, 1, "phases seen: {seen:?}");
    assert_eq!(seen.last(), Some(&Phase::Terminated));
    let serving_at = seen.iter().position(|p| *p == Phase::Serving).unwrap();
    let draining_at = seen.iter().position(|p| *p == Phase::Draining).unwrap();
    assert!(serving_at < draining_at, "phases seen: {seen:?}");
}

#[tokio::test]
async fn in_flight_request_drains_before_exit() {
    let addr = common::free_addr();
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.listener.bind_address = addr.to_string();

    let coordinator = Coordinator::new(
        config,
        common::test_router(Duration::from_secs(1), Duration::ZERO),
    );
    let mut phase = coordinator.phase();
    let shutdown = Shutdown::new();
    let run = tokio::spawn(coordinator.run(shutdown.clone()));

    common::wait_for_phase(&mut phase, Phase::Serving).await;
    let request = common::spawn_get(addr, "/slow");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    shutdown.trigger();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Drained);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(request.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn drain_past_grace_is_reported_not_fatal() {
    let addr = common::free_addr();
    // Grace of 500ms against a body that streams for ~2s.
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.timeouts.shutdown_grace_ms = Some(500);
    config.listener.bind_address = addr.to_string();

    let coordinator = Coordinator::new(
        config,
        common::test_router(Duration::ZERO, Duration::from_millis(400)),
    );
    let mut phase = coordinator.phase();
    let shutdown = Shutdown::new();
    let run = tokio::spawn(coordinator.run(shutdown.clone()));

    common::wait_for_phase(&mut phase, Phase::Serving).await;
    let response = common::client()
        .get(format!("http://{addr}/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let started = Instant::now();
    shutdown.trigger();
    let result = run.await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(startup::exit_status(&result), 0);
    assert_eq!(result.unwrap(), Outcome::TimedOut);

    assert!(response.text().await.is_err(), "body should be cut off");
}

#[tokio::test]
async fn bind_failure_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.listener.bind_address = taken.local_addr().unwrap().to_string();

    let coordinator = Coordinator::new(config, common::test_router(Duration::ZERO, Duration::ZERO));
    let phase = coordinator.phase();

    // Never triggered: a failed start must not wait for a signal.
    let result = tokio::time::timeout(Duration::from_secs(5), coordinator.run(Shutdown::new()))
        .await
        .expect("run should return on bind failure");

    assert!(matches!(
        result,
        Err(LifecycleError::Startup(ServerError::Bind { .. }))
    ));
    assert_eq!(startup::exit_status(&result), 1);
    assert_eq!(*phase.borrow(), Phase::Terminated);
}

#[tokio::test]
async fn oversized_connection_cap_fails_start() {
    let mut config = common::local_config(5_000, 5_000, 5_000);
    config.listener.max_connections = usize::MAX >> 2;

    let coordinator = Coordinator::new(config, common::test_router(Duration::ZERO, Duration::ZERO));
    let phase = coordinator.phase();
    let result = tokio::time::timeout(Duration::from_secs(2), coordinator.run(Shutdown::new()))
        .await
        .expect("run should return when the server cannot start");

    assert!(matches!(
        result,
        Err(LifecycleError::Startup(ServerError::Bind { .. }))
    ));
    assert_eq!(startup::exit_status(&result), 1);
    assert_eq!(*phase.borrow(), Phase::Terminated);
}
