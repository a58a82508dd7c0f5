//! Integration tests for logging configuration

use bridge_traits::time::LogLevel;
use core_runtime::logging::{init_logging, strip_path, LogFormat, LoggingConfig};

#[test]
fn test_logging_config_defaults() {
    let config = LoggingConfig::default();

    assert_eq!(config.level, LogLevel::Info);
    assert!(config.filter.is_none());
    assert!(config.logger_sink.is_none());
    assert!(config.display_target);
}

#[test]
fn test_init_logging_only_once() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    assert!(init_logging(config.clone()).is_ok());
    assert!(init_logging(config).is_err());
}

#[test]
fn test_invalid_filter_rejected() {
    let config = LoggingConfig::default().with_filter("core_sync=[");
    assert!(init_logging(config).is_err());
}

#[test]
fn test_strip_path_keeps_file_name() {
    assert_eq!(strip_path("/data/uploads/body.txt"), "body.txt");
    assert_eq!(strip_path("body.txt"), "body.txt");
}
