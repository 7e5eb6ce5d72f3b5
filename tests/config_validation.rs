//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use pipe_messaging::config::{ClientConfig, IpcConfig, LoggingConfig, ServerConfig, TransportConfig};
use pipe_messaging::core::serialization::SerializationFormat;
use pipe_messaging::IpcError;
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = IpcConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_empty_server_endpoint() {
    let mut config = IpcConfig::default();
    config.server.endpoint = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Server endpoint cannot be empty")));
}

#[test]
fn test_overlong_client_endpoint() {
    let mut config = IpcConfig::default();
    config.client.endpoint = "x".repeat(300);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Client endpoint too long")));
}

#[test]
fn test_zero_max_connections() {
    let config = ServerConfig {
        max_connections: 0,
        ..ServerConfig::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_short_shutdown_timeout() {
    let config = ServerConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..ServerConfig::default()
    };

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Shutdown timeout too short")));
}

#[test]
fn test_short_connect_timeout() {
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(5),
        connect_poll_interval: Duration::from_millis(1),
        ..ClientConfig::default()
    };

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_poll_interval_longer_than_timeout() {
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(100),
        connect_poll_interval: Duration::from_secs(1),
        ..ClientConfig::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connect poll interval cannot exceed the connect timeout")));
}

#[test]
fn test_zero_payload_size() {
    let config = TransportConfig {
        max_payload_size: 0,
        ..TransportConfig::default()
    };

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_no_logging_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_collects_all_errors() {
    let config = IpcConfig::default_with_overrides(|c| {
        c.server.max_connections = 0;
        c.transport.max_payload_size = 0;
    });

    match config.validate_strict() {
        Err(IpcError::ConfigError(message)) => {
            assert!(message.contains("Max connections"));
            assert!(message.contains("Max payload size"));
        }
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn test_toml_roundtrip() {
    let text = IpcConfig::example_config();
    let parsed = IpcConfig::from_toml(&text).expect("example config parses");
    assert_eq!(parsed.server.endpoint, IpcConfig::default().server.endpoint);
    assert_eq!(parsed.client.connect_timeout, IpcConfig::default().client.connect_timeout);
}

#[test]
fn test_toml_partial_sections() {
    let text = r#"
        [server]
        endpoint = "orders"
        max_connections = 8
        shutdown_timeout = 2000

        [client]
        endpoint = "orders"
        connect_timeout = 1500
        connect_poll_interval = 25

        [transport]
        max_payload_size = 65536
        serialization_format = "json"

        [logging]
        app_name = "orders"
        log_level = "debug"
        log_to_console = true
        log_to_file = false
        json_format = false
    "#;

    let config = IpcConfig::from_toml(text).expect("parse");
    assert_eq!(config.server.endpoint, "orders");
    assert_eq!(config.server.max_connections, 8);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(1500));
    assert_eq!(config.transport.serialization_format, SerializationFormat::Json);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_save_and_load_file() {
    let path = std::env::temp_dir().join(format!("pipe-messaging-{}.toml", std::process::id()));
    let config = IpcConfig::default_with_overrides(|c| {
        c.server.endpoint = "from-file".into();
        c.server.max_connections = 3;
    });
    config.save_to_file(&path).expect("save");

    let loaded = IpcConfig::from_file(&path).expect("load");
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.server.endpoint, "from-file");
    assert_eq!(loaded.server.max_connections, 3);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let result = IpcConfig::from_toml("[server\nendpoint = ");
    assert!(matches!(result, Err(IpcError::ConfigError(_))));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("PIPE_MESSAGING_ENDPOINT", "env-endpoint");
    std::env::set_var("PIPE_MESSAGING_MAX_CONNECTIONS", "12");
    std::env::set_var("PIPE_MESSAGING_CONNECT_TIMEOUT_MS", "750");

    let config = IpcConfig::from_env().expect("env config");

    std::env::remove_var("PIPE_MESSAGING_ENDPOINT");
    std::env::remove_var("PIPE_MESSAGING_MAX_CONNECTIONS");
    std::env::remove_var("PIPE_MESSAGING_CONNECT_TIMEOUT_MS");

    assert_eq!(config.server.endpoint, "env-endpoint");
    assert_eq!(config.client.endpoint, "env-endpoint");
    assert_eq!(config.server.max_connections, 12);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(750));
}

#[test]
#[serial]
fn test_env_invalid_number() {
    std::env::set_var("PIPE_MESSAGING_MAX_CONNECTIONS", "many");
    let result = IpcConfig::from_env();
    std::env::remove_var("PIPE_MESSAGING_MAX_CONNECTIONS");

    assert!(matches!(result, Err(IpcError::ConfigError(_))));
}
