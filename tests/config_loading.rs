//! Config file loading, defaults, and validation.

use std::time::Duration;

use scalebridge::config::Config;
use scalebridge::serial::DeviceIdentity;

async fn write_and_load(text: &str) -> anyhow::Result<Config> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scalebridge.toml");
    std::fs::write(&path, text).unwrap();
    Config::load(path.to_str().unwrap()).await
}

#[tokio::test]
async fn minimal_file_gets_defaults() {
    let cfg = write_and_load(
        r#"
[agent]
station_id = "packing-02"
cache_file = "cache.json"
lock_file = "agent.lock"

[scale]
port = "COM4"
baud_rate = 9600

[logging]
level = "debug"
"#,
    )
    .await
    .expect("load");

    assert_eq!(cfg.agent.station_id, "packing-02");
    assert_eq!(cfg.scale.port(), Some("COM4".to_string()));
    assert_eq!(cfg.scale.identity().unwrap(), None);
    assert_eq!(cfg.monitor.reconnect_interval_secs, 15);
    assert_eq!(cfg.logging.level_filter(), log::LevelFilter::Debug);
    assert_eq!(cfg.logging.file, None);

    let policy = cfg.scale.policy().unwrap();
    assert_eq!(policy.hardware_id_rounds, 5);
    assert_eq!(policy.throttle, Duration::from_secs(10));
    assert_eq!(policy.teardown_pause, Duration::from_millis(500));
    assert_eq!(policy.worst_case_opens(), 22);
}

#[tokio::test]
async fn tuned_file_builds_matching_policy() {
    let cfg = write_and_load(
        r#"
[agent]
station_id = "recv-01"
cache_file = "cache.json"
lock_file = "agent.lock"

[scale]
port = ""
baud_rate = 115200
device_id = "0x0483:0x5740"
hardware_id_rounds = 3
rescan_backoff_ms = 250
throttle_secs = 4

[monitor]
poll_interval_ms = 200
read_timeout_ms = 500
reconnect_interval_secs = 5
heartbeat_secs = 10

[logging]
level = "warn"
file = "agent.log"
"#,
    )
    .await
    .expect("load");

    assert_eq!(cfg.scale.port(), None);
    let policy = cfg.scale.policy().unwrap();
    assert_eq!(policy.default_baud, 115200);
    assert_eq!(policy.identity, Some(DeviceIdentity::new(0x0483, 0x5740)));
    assert_eq!(policy.hardware_id_rounds, 3);
    assert_eq!(policy.rescan_backoff, Duration::from_millis(250));
    assert_eq!(policy.throttle, Duration::from_secs(4));
    assert_eq!(policy.worst_case_opens(), 1 + 3 * 4 + 21);
    assert_eq!(cfg.monitor.poll_interval_ms, 200);
}

#[tokio::test]
async fn invalid_values_are_rejected() {
    let bad_id = write_and_load(
        r#"
[agent]
station_id = "s"
cache_file = "c.json"
lock_file = "l.lock"

[scale]
port = "COM4"
baud_rate = 9600
device_id = "scale"

[logging]
level = "info"
"#,
    )
    .await;
    let msg = bad_id.unwrap_err().to_string();
    assert!(msg.contains("Invalid config file"), "{}", msg);

    let zero_rounds = write_and_load(
        r#"
[agent]
station_id = "s"
cache_file = "c.json"
lock_file = "l.lock"

[scale]
port = "COM4"
baud_rate = 9600
hardware_id_rounds = 0

[logging]
level = "info"
"#,
    )
    .await;
    assert!(zero_rounds.is_err());
}

#[test]
fn create_default_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scalebridge.toml");
    let path = path.to_str().unwrap();
    tokio_test::block_on(Config::create_default(path)).unwrap();
    let cfg = tokio_test::block_on(Config::load(path)).unwrap();
    assert_eq!(cfg.scale.device_id.as_deref(), Some("0483:5740"));
    assert_eq!(cfg.scale.port(), None);
}

#[tokio::test]
async fn missing_file_reports_path() {
    let err = Config::load("/nonexistent/scalebridge.toml").await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
