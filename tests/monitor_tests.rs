// tests/monitor_tests.rs

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{spawn_app, wait_until};
use exam_checkpoint::{
    error::AppError,
    models::sync::{ConnectionQuality, ConnectionStatus, EffectiveType},
    monitor::{ConnectionMonitor, HttpQualityProbe, QualityProbe, classify, ping_server},
};

fn quality(effective_type: EffectiveType, rtt_ms: u32) -> ConnectionQuality {
    ConnectionQuality {
        effective_type,
        downlink_mbps: Some(1.5),
        rtt_ms,
        save_data: false,
    }
}

fn record(monitor: &ConnectionMonitor) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = monitor.subscribe(move |state| sink.lock().unwrap().push(state.status));
    seen
}

#[test]
fn slow_links_are_classified() {
    assert_eq!(classify(&quality(EffectiveType::FourG, 80), 1_000), ConnectionStatus::Online);
    assert_eq!(classify(&quality(EffectiveType::Slow2g, 80), 1_000), ConnectionStatus::Slow);
    assert_eq!(classify(&quality(EffectiveType::ThreeG, 1_001), 1_000), ConnectionStatus::Slow);
    assert_eq!(classify(&quality(EffectiveType::ThreeG, 1_000), 1_000), ConnectionStatus::Online);
}

#[test]
fn subscriber_gets_current_state_then_transitions() {
    let monitor = ConnectionMonitor::new(true, 1_000);
    let seen = record(&monitor);

    monitor.set_offline();
    monitor.set_offline();
    monitor.set_online(Some(quality(EffectiveType::Slow2g, 2_500)));
    monitor.set_online(None);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionStatus::Online,
            ConnectionStatus::Offline,
            ConnectionStatus::Slow,
            ConnectionStatus::Online,
        ]
    );
    assert_eq!(monitor.snapshot().status, ConnectionStatus::Online);
}

#[test]
fn transition_during_replay_reaches_new_subscriber() {
    let monitor = Arc::new(ConnectionMonitor::new(true, 1_000));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let flipped = AtomicBool::new(false);

    let sink = Arc::clone(&seen);
    let weak = Arc::downgrade(&monitor);
    let _subscription = monitor.subscribe(move |state| {
        sink.lock().unwrap().push(state.status);
        // The network drops while the subscriber is still being set up.
        if !flipped.swap(true, Ordering::SeqCst) {
            if let Some(monitor) = weak.upgrade() {
                monitor.set_offline();
            }
        }
    });

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&ConnectionStatus::Offline));
    assert_eq!(monitor.snapshot().status, ConnectionStatus::Offline);
}

#[test]
fn starts_offline_when_platform_reports_unreachable() {
    let monitor = ConnectionMonitor::new(false, 1_000);
    assert_eq!(monitor.snapshot().status, ConnectionStatus::Offline);
    assert!(!monitor.snapshot().status.can_deliver());
    assert!(ConnectionStatus::Slow.can_deliver());
}

#[test]
fn unsubscribe_and_stop_detach_listeners() {
    let monitor = ConnectionMonitor::new(true, 1_000);
    let subscription = monitor.subscribe(|_| {});
    let _other = monitor.subscribe(|_| {});
    assert_eq!(monitor.subscriber_count(), 2);

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert_eq!(monitor.subscriber_count(), 1);

    monitor.stop();
    assert_eq!(monitor.subscriber_count(), 0);
}

struct ToggleProbe {
    up: AtomicBool,
}

#[async_trait]
impl QualityProbe for ToggleProbe {
    async fn sample(&self) -> Result<ConnectionQuality, AppError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(quality(EffectiveType::FourG, 40))
        } else {
            Err(AppError::Network("unreachable".to_string()))
        }
    }
}

#[tokio::test]
async fn quality_poll_follows_probe() {
    let monitor = Arc::new(ConnectionMonitor::new(true, 1_000));
    let probe = Arc::new(ToggleProbe {
        up: AtomicBool::new(false),
    });
    monitor.start_quality_poll(probe.clone(), Duration::from_millis(20));

    let m = Arc::clone(&monitor);
    assert!(wait_until(|| {
        let m = Arc::clone(&m);
        async move { m.snapshot().status == ConnectionStatus::Offline }
    })
    .await);

    probe.up.store(true, Ordering::SeqCst);
    let m = Arc::clone(&monitor);
    assert!(wait_until(|| {
        let m = Arc::clone(&m);
        async move { m.snapshot().status == ConnectionStatus::Online }
    })
    .await);
    assert_eq!(monitor.snapshot().quality.unwrap().rtt_ms, 40);

    monitor.stop();
}

#[tokio::test]
async fn http_probe_and_ping_reach_health_endpoint() {
    let app = spawn_app().await;
    let health = format!("{}/api/v1/health", app.address);

    assert!(ping_server(&health, Duration::from_secs(2)).await);

    let probe = HttpQualityProbe::new(health, Duration::from_secs(2)).unwrap();
    let sample = probe.sample().await.unwrap();
    assert!(sample.rtt_ms < 2_000);
}

#[tokio::test]
async fn ping_fails_against_closed_port() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    assert!(!ping_server(&format!("http://127.0.0.1:{}/", port), Duration::from_millis(500)).await);
}
