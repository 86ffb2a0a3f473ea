use std::time::Duration;

use duplex_watchdog::auth::password_digest;
use duplex_watchdog::config::{GlobalConfig, WatchdogMode};
use duplex_watchdog::AppError;

fn sample_toml() -> String {
    format!(
        r#"
[transport]
host = "127.0.0.1"
port = 9191
http_port = 9192

[channel]
reply_interval_ms = 250
reply_limit = 5
client_count = 3
client_launch_interval_ms = 500
stream_length = 4

[watchdog]
mode = "poll"
poll_interval_ms = 200
stop_after_seconds = 7

[requester]
username = "jay"

[[users]]
username = "jay"
password_sha256 = "{}"
roles = ["ADMIN", "USER"]
"#,
        password_digest("pw")
    )
}

#[test]
fn parses_every_section() {
    let config = GlobalConfig::from_toml_str(&sample_toml()).expect("config parses");

    assert_eq!(config.transport.port, 9191);
    assert_eq!(config.transport.http_port, Some(9192));
    assert_eq!(config.channel.reply_limit, Some(5));
    assert_eq!(config.channel.client_count, 3);
    assert_eq!(config.channel.stream_length, 4);
    assert_eq!(config.watchdog.mode, WatchdogMode::Poll);
    assert_eq!(config.requester.username.as_deref(), Some("jay"));
    assert_eq!(config.users.len(), 1);
    assert_eq!(config.users[0].roles, vec!["ADMIN", "USER"]);
}

#[test]
fn password_is_never_read_from_toml() {
    let raw = r#"
[requester]
username = "jay"
password = "leaked"
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("config parses");
    assert!(config.requester.password.is_none());
    assert!(config.requester_credentials().is_none());
}

#[test]
fn empty_file_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config.transport.host, "127.0.0.1");
    assert_eq!(config.transport.port, 8181);
    assert!(config.transport.http_port.is_none());
    assert_eq!(config.reply_interval(), Duration::from_secs(1));
    assert_eq!(config.client_launch_interval(), Duration::from_secs(1));
    assert_eq!(config.poll_interval(), Duration::from_secs(1));
    assert_eq!(config.stop_after(), Duration::from_secs(3));
    assert_eq!(config.channel.stream_length, 10);
    assert_eq!(config.channel.client_count, 1);
    assert!(config.channel.reply_limit.is_none());
    assert_eq!(config.watchdog.mode, WatchdogMode::Subscribe);
    assert!(config.users.is_empty());
}

#[test]
fn duration_helpers_follow_config() {
    let config = GlobalConfig::from_toml_str(&sample_toml()).expect("config parses");

    assert_eq!(config.reply_interval(), Duration::from_millis(250));
    assert_eq!(config.client_launch_interval(), Duration::from_millis(500));
    assert_eq!(config.poll_interval(), Duration::from_millis(200));
    assert_eq!(config.stop_after(), Duration::from_secs(7));
}

#[test]
fn addresses_resolve() {
    let config = GlobalConfig::from_toml_str(&sample_toml()).expect("config parses");

    let addr = config.transport_addr().expect("transport addr");
    assert_eq!(addr.port(), 9191);
    let probe = config.probe_addr().expect("probe addr").expect("probe enabled");
    assert_eq!(probe.port(), 9192);
}

#[test]
fn probe_disabled_without_http_port() {
    let config = GlobalConfig::default();
    assert!(config.probe_addr().expect("probe addr").is_none());
}

#[test]
fn invalid_host_is_config_error() {
    let raw = r#"
[transport]
host = "not a host"
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("config parses");
    let err = config.transport_addr().expect_err("host is invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_reply_interval_is_rejected() {
    let raw = "[channel]\nreply_interval_ms = 0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("zero interval rejected");
    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("reply_interval_ms")),
        "unexpected error: {err}"
    );
}

#[test]
fn zero_client_count_is_rejected() {
    let raw = "[channel]\nclient_count = 0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("zero clients rejected");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("client_count")));
}

#[test]
fn zero_poll_interval_is_rejected() {
    let raw = "[watchdog]\npoll_interval_ms = 0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("zero poll interval rejected");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("poll_interval_ms")));
}

#[test]
fn unknown_watchdog_mode_is_rejected() {
    let raw = "[watchdog]\nmode = \"sometimes\"\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("bad mode rejected");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn duplicate_users_are_rejected() {
    let digest = password_digest("pw");
    let raw = format!(
        r#"
[[users]]
username = "jay"
password_sha256 = "{digest}"

[[users]]
username = "jay"
password_sha256 = "{digest}"
"#
    );
    let err = GlobalConfig::from_toml_str(&raw).expect_err("duplicates rejected");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("duplicate user")));
}

#[test]
fn malformed_digest_is_rejected() {
    let raw = r#"
[[users]]
username = "jay"
password_sha256 = "pw"
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("digest rejected");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("password_sha256")));
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.transport.port, 9191);
}

#[test]
fn load_from_missing_path_is_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(temp.path().join("absent.toml"))
        .expect_err("missing file rejected");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}
