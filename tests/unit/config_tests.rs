use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tether::ipc::local::intake_name;
use tether::{AppError, ChannelConfig};

fn sample_toml() -> &'static str {
    r#"
ipc_name = "tether-chat-echo"
service_program = "/opt/tether/bin/tether-echo"
service_args = ["--log-format", "json"]
startup_timeout_ms = 2000
connect_retry_ms = 25
"#
}

#[test]
fn parses_valid_config() {
    let config = ChannelConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.ipc_name, "tether-chat-echo");
    assert_eq!(
        config.service_program,
        Some(PathBuf::from("/opt/tether/bin/tether-echo"))
    );
    assert_eq!(config.service_args, vec!["--log-format", "json"]);
    assert_eq!(config.startup_timeout(), Duration::from_millis(2000));
    assert_eq!(config.connect_retry(), Duration::from_millis(25));
}

#[test]
fn empty_file_uses_defaults() {
    let config = ChannelConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config, ChannelConfig::default());
    assert_eq!(config.ipc_name, "tether-echo");
    assert!(config.service_program.is_none());
    assert!(config.service_args.is_empty());
    assert_eq!(config.startup_timeout_ms, 5000);
    assert_eq!(config.connect_retry_ms, 50);
}

#[test]
fn intake_name_appends_suffix() {
    let config = ChannelConfig::default();
    assert_eq!(intake_name(&config.ipc_name), "tether-echo.intake");
}

#[test]
fn rejects_empty_ipc_name() {
    let err = ChannelConfig::from_toml_str(r#"ipc_name = """#).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("ipc_name")));
}

#[test]
fn rejects_ipc_name_with_separators_or_whitespace() {
    for name in ["a/b", r"a\\b", "two words", "tab\\there"] {
        let toml = format!(r#"ipc_name = "{name}""#);
        assert!(
            ChannelConfig::from_toml_str(&toml).is_err(),
            "ipc_name {name:?} should be rejected"
        );
    }
}

#[test]
fn rejects_zero_startup_timeout() {
    let err = ChannelConfig::from_toml_str("startup_timeout_ms = 0").unwrap_err();
    assert!(err.to_string().contains("startup_timeout_ms"));
}

#[test]
fn rejects_retry_outside_timeout() {
    assert!(ChannelConfig::from_toml_str("connect_retry_ms = 0").is_err());
    assert!(
        ChannelConfig::from_toml_str("startup_timeout_ms = 100\nconnect_retry_ms = 101").is_err()
    );
    assert!(
        ChannelConfig::from_toml_str("startup_timeout_ms = 100\nconnect_retry_ms = 100").is_ok()
    );
}

#[test]
fn rejects_invalid_toml() {
    let err = ChannelConfig::from_toml_str("ipc_name = [").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn rejects_wrong_field_type() {
    let err = ChannelConfig::from_toml_str("startup_timeout_ms = \"soon\"").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn with_ipc_name_revalidates() {
    let config = ChannelConfig::default()
        .with_ipc_name("chat-2")
        .expect("valid override");
    assert_eq!(config.ipc_name, "chat-2");

    assert!(ChannelConfig::default().with_ipc_name("").is_err());
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write");

    let config = ChannelConfig::load_from_path(file.path()).expect("config loads");
    assert_eq!(config.ipc_name, "tether-chat-echo");
}

#[test]
fn missing_file_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = ChannelConfig::load_from_path(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}

#[test]
fn explicit_service_program_is_used_verbatim() {
    let config = ChannelConfig::from_toml_str(sample_toml()).expect("config parses");
    assert_eq!(
        config.resolve_service_program().expect("resolves"),
        PathBuf::from("/opt/tether/bin/tether-echo")
    );
}

#[test]
fn default_service_program_sits_next_to_current_exe() {
    let program = ChannelConfig::default()
        .resolve_service_program()
        .expect("resolves");
    let exe = std::env::current_exe().expect("current exe");

    assert_eq!(program.parent(), exe.parent());
    assert!(program
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("tether-echo")));
}
