//! Integration tests for configuration validation and loading

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bdn_relay::config::{
    ConnectionConfig, LoggingConfig, RelayConfig, ServerConfig, TxCacheConfig,
};
use bdn_relay::protocol::message::MessageType;
use std::time::Duration;
use tracing::Level;
use uuid::Uuid;

#[test]
fn test_default_config_validates() {
    let config = RelayConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = RelayConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = RelayConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = RelayConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = RelayConfig::default();
    config.server.max_connections = 150_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_handshake_types_must_include_hello() {
    let mut config = RelayConfig::default();
    config.connection.handshake_message_types = vec![MessageType::Ack];

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Handshake message types must include hello")));
}

#[test]
fn test_short_ping_interval() {
    let mut config = RelayConfig::default();
    config.connection.ping_interval = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Ping interval too short")));
}

#[test]
fn test_long_ping_interval() {
    let mut config = RelayConfig::default();
    config.connection.ping_interval = Duration::from_secs(7200);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Ping interval too long")));
}

#[test]
fn test_pong_timeout_not_shorter_than_ping_interval() {
    let mut config = RelayConfig::default();
    config.connection.ping_interval = Duration::from_secs(5);
    config.connection.pong_timeout = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Pong timeout must be shorter than the ping interval")));
}

#[test]
fn test_zero_max_bad_messages() {
    let mut config = RelayConfig::default();
    config.connection.max_bad_messages = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max bad messages must be greater than 0")));
}

#[test]
fn test_tiny_max_payload_size() {
    let mut config = RelayConfig::default();
    config.connection.max_payload_size = 512; // Less than 1 KB

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too small")));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_max_payload_size_beyond_length_field() {
    let mut config = RelayConfig::default();
    config.connection.max_payload_size = u32::MAX as usize + 1;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_zero_tx_cache_memory_limit() {
    let mut config = RelayConfig::default();
    config.tx_cache.memory_limit_bytes = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("memory limit must be greater than 0")));
}

#[test]
fn test_sid_expire_time_beyond_maximum() {
    let mut config = RelayConfig::default();
    config.tx_cache.sid_expire_time = Duration::MAX;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Short id expire time too long")));
    assert!(config.validate_strict().is_err());
}

#[test]
fn test_cleanup_interval_longer_than_expire_time() {
    let mut config = RelayConfig::default();
    config.tx_cache.sid_expire_time = Duration::from_secs(1);
    config.tx_cache.min_cleanup_interval = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Minimum cleanup interval cannot exceed")));
}

#[test]
fn test_empty_app_name() {
    let mut config = RelayConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = RelayConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = RelayConfig::default();
    config.server.address = String::new();

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        assert!(e.to_string().contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = RelayConfig::default();

    config.server.address = String::new();
    config.server.max_connections = 0;
    config.connection.max_bad_messages = 0;
    config.tx_cache.final_tx_confirmations_count = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let config = RelayConfig {
        server: ServerConfig {
            address: "0.0.0.0:1809".to_string(),
            max_connections: 5000,
            network_num: 5,
            node_id: Some(Uuid::new_v4()),
        },
        connection: ConnectionConfig {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            ..ConnectionConfig::default()
        },
        tx_cache: TxCacheConfig {
            memory_limit_bytes: 512 * 1024 * 1024,
            ..TxCacheConfig::default()
        },
        logging: LoggingConfig {
            app_name: "relay-eu-1".to_string(),
            log_level: Level::DEBUG,
            json_format: true,
        },
    };

    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = RelayConfig::from_toml(
        r#"
        [tx_cache]
        sid_expire_time = 60000
        memory_limit_bytes = 1024
        final_tx_confirmations_count = 6
        min_cleanup_interval = 1000
        "#,
    )
    .unwrap();

    assert_eq!(config.tx_cache.sid_expire_time, Duration::from_secs(60));
    assert_eq!(config.tx_cache.final_tx_confirmations_count, 6);
    assert_eq!(config.server.address, ServerConfig::default().address);
    assert_eq!(config.connection.max_bad_messages, 3);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = RelayConfig::from_toml("[server\naddress = 1").unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");

    let config = RelayConfig::default_with_overrides(|c| {
        c.server.network_num = 7;
        c.connection.handshake_message_types =
            vec![MessageType::Hello, MessageType::Ack, MessageType::Ping];
        c.logging.log_level = Level::WARN;
    });
    config.save_to_file(&path).unwrap();

    let loaded = RelayConfig::from_file(&path).unwrap();
    assert_eq!(loaded.server.network_num, 7);
    assert_eq!(
        loaded.connection.handshake_message_types,
        vec![MessageType::Hello, MessageType::Ack, MessageType::Ping]
    );
    assert_eq!(loaded.logging.log_level, Level::WARN);
    assert_eq!(loaded.connection.ping_interval, Duration::from_secs(60));
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RelayConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}

#[test]
fn test_example_config_parses() {
    let example = RelayConfig::example_config();
    assert!(example.contains("[tx_cache]"));

    let parsed = RelayConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}
