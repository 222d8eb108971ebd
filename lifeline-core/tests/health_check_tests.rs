mod common;

use common::MockEngine;
use lifeline_core::vpn::health_check::{EndpointProbe, HealthChecker, HealthSettings};
use lifeline_core::vpn::{ConnectivityState, HealthState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn running_engine() -> Arc<MockEngine> {
    let engine = MockEngine::new();
    engine.set_running(true);
    engine
}

fn checker(engine: Arc<MockEngine>, settings: HealthSettings) -> HealthChecker {
    HealthChecker::new(engine, &settings).expect("Settings should be valid")
}

fn probed_settings(server: &MockServer) -> HealthSettings {
    HealthSettings {
        probe_endpoint: Some(format!("{}/health", server.uri())),
        probe_timeout_secs: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_running_tunnel_with_fresh_stats_is_good() {
    let checker = checker(running_engine(), HealthSettings::default());

    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Good);
    assert!(report.detail.is_none());
}

#[tokio::test]
async fn test_offline_network_is_disconnected() {
    let checker = checker(running_engine(), HealthSettings::default());

    for state in [
        ConnectivityState::Disconnected,
        ConnectivityState::ConnectedNoInternet,
    ] {
        let report = checker.check(state).await;
        assert_eq!(report.state, HealthState::Disconnected);
    }
}

#[tokio::test]
async fn test_unknown_connectivity_still_checks_the_engine() {
    let checker = checker(running_engine(), HealthSettings::default());

    let report = checker.check(ConnectivityState::Unknown).await;

    assert_eq!(report.state, HealthState::Good);
}

#[tokio::test]
async fn test_stopped_engine_is_disconnected() {
    let checker = checker(MockEngine::new(), HealthSettings::default());

    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Disconnected);
    assert!(report.detail.unwrap().contains("not running"));
}

#[tokio::test]
async fn test_stale_statistics_are_poor() {
    let engine = running_engine();
    engine.set_stats_age(Duration::from_secs(300));
    let checker = checker(engine, HealthSettings::default());

    let report = checker.check(ConnectivityState::ConnectedCellular).await;

    assert_eq!(report.state, HealthState::Poor);
}

#[tokio::test]
async fn test_missing_statistics_are_poor() {
    let engine = running_engine();
    engine.set_silent(true);
    let checker = checker(engine, HealthSettings::default());

    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Poor);
}

/// Test probe success with HTTP 200 response
#[tokio::test]
async fn test_successful_probe_keeps_health_good() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&mock_server)
        .await;

    let checker = checker(running_engine(), probed_settings(&mock_server));
    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Good);
}

/// Test probe failure on 5xx downgrades to poor
#[tokio::test]
async fn test_failed_probe_downgrades_to_poor() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let checker = checker(running_engine(), probed_settings(&mock_server));
    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Poor);
    assert_eq!(report.detail.as_deref(), Some("probe answered 503 Service Unavailable"));
}

/// Test probe is not issued when the tunnel is down
#[tokio::test]
async fn test_probe_skipped_without_tunnel() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let checker = checker(MockEngine::new(), probed_settings(&mock_server));
    let report = checker.check(ConnectivityState::ConnectedWifi).await;

    assert_eq!(report.state, HealthState::Disconnected);
}

/// Test probe fails on timeout
#[tokio::test]
async fn test_probe_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let probe = EndpointProbe::new(
        &format!("{}/health", mock_server.uri()),
        Duration::from_millis(200),
    )
    .unwrap();
    let reason = probe.reach().await.unwrap_err();

    assert!(reason.contains("timed out"), "unexpected reason: {}", reason);
}

#[tokio::test(start_paused = true)]
async fn test_run_reports_every_interval() {
    let settings = HealthSettings {
        interval_secs: 30,
        ..Default::default()
    };
    let checker = checker(running_engine(), settings);
    let (connectivity_tx, connectivity_rx) = watch::channel(ConnectivityState::ConnectedWifi);
    let cancel = CancellationToken::new();
    let reports = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&reports);
    let run_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        checker
            .run(connectivity_rx, run_cancel, move |report| {
                sink.lock().unwrap().push(report.state);
            })
            .await;
    });

    // First verdict after one interval, not immediately
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(reports.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    connectivity_tx.send_replace(ConnectivityState::Disconnected);
    tokio::time::sleep(Duration::from_secs(30)).await;

    cancel.cancel();
    task.await.unwrap();

    assert_eq!(
        *reports.lock().unwrap(),
        vec![HealthState::Good, HealthState::Disconnected]
    );
}
