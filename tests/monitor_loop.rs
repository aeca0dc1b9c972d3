//! ScaleMonitor end to end on a Tokio runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_policy, MockBackend};
use scalebridge::config::MonitorConfig;
use scalebridge::monitor::ScaleMonitor;
use scalebridge::relay::Relay;
use scalebridge::scale::ScaleManager;
use scalebridge::serial::PortCandidate;
use tokio::sync::{mpsc, watch};

fn quick_monitor() -> ScaleMonitor {
    ScaleMonitor::new(&MonitorConfig {
        poll_interval_ms: 5,
        read_timeout_ms: 20,
        reconnect_interval_secs: 15,
        heartbeat_secs: 30,
        port_scan_ms: 0,
    })
}

#[tokio::test]
async fn monitor_connects_forwards_and_stops() {
    let backend = Arc::new(MockBackend::accepting_all());
    let manager = Arc::new(ScaleManager::new(
        backend.clone(),
        Some("COM3".into()),
        fast_policy(None),
    ));
    backend.feed(b"1.250kg\n1.250kg\n1.300kg\n");

    let (tx, mut rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(quick_monitor().run(manager.clone(), tx, shutdown_rx));

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first reading in time")
        .expect("channel open");
    assert_eq!(first.raw, "1.250kg");

    // Duplicate suppressed until the heartbeat, change forwarded immediately
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("second reading in time")
        .expect("channel open");
    assert_eq!(second.raw, "1.300kg");

    shutdown_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.forwarded, 2);
    assert!(summary.reads >= 3);
    assert_eq!(summary.reconnects, 1);
    assert_eq!(backend.open_count(), 1);
}

#[tokio::test]
async fn monitor_without_port_idles_until_shutdown() {
    let backend = Arc::new(MockBackend::accepting_all());
    let manager = Arc::new(ScaleManager::new(backend.clone(), None, fast_policy(None)));

    let (tx, _rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(quick_monitor().run(manager, tx, shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.forwarded, 0);
    assert_eq!(summary.reconnects, 1);
    assert_eq!(backend.open_count(), 0);
}

#[tokio::test]
async fn port_reports_only_on_change() {
    let backend = Arc::new(MockBackend::accepting_all().with_ports(vec![
        vec![PortCandidate::plain("COM1")],
        vec![PortCandidate::plain("COM1")],
        vec![
            PortCandidate::plain("COM1"),
            PortCandidate::usb("COM4", 0x0483, 0x5740),
        ],
    ]));
    let manager = Arc::new(ScaleManager::new(backend.clone(), None, fast_policy(None)));
    let relay = Arc::new(Relay::new(manager.clone(), backend.clone()));

    let monitor = ScaleMonitor::new(&MonitorConfig {
        poll_interval_ms: 5,
        read_timeout_ms: 20,
        reconnect_interval_secs: 15,
        heartbeat_secs: 30,
        port_scan_ms: 5,
    });
    let (tx, _rx) = mpsc::channel(8);
    let (ports_tx, mut ports_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(
        monitor
            .with_port_reports(relay, ports_tx)
            .run(manager, tx, shutdown_rx),
    );

    let first = tokio::time::timeout(Duration::from_secs(2), ports_rx.recv())
        .await
        .expect("initial report in time")
        .expect("channel open");
    let devices: Vec<_> = first.ports.iter().map(|p| p.device.as_str()).collect();
    assert_eq!(devices, ["COM1"]);
    assert_eq!(first.scale_port, None);
    assert!(!first.scale_connected);

    let second = tokio::time::timeout(Duration::from_secs(2), ports_rx.recv())
        .await
        .expect("change report in time")
        .expect("channel open");
    let devices: Vec<_> = second.ports.iter().map(|p| p.device.as_str()).collect();
    assert_eq!(devices, ["COM1", "COM4"]);

    // Further scans see the same list and stay quiet
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.enumerate_count() < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scans keep running");
    shutdown_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.port_reports, 2);
    assert!(ports_rx.try_recv().is_err());
}
