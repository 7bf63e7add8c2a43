//! Integration tests for environment-driven configuration.

use fxdeals_loadtest::config::{Config, ConfigError, LogFormat};
use fxdeals_loadtest::config_validation::ValidationError;
use serial_test::serial;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|var| vars.get(var).cloned())
}

#[test]
fn test_defaults_when_nothing_is_set() {
    let config = from_pairs(&[]).unwrap();

    assert_eq!(config.base_url, "http://localhost:8080");
    assert_eq!(config.health_path, "/actuator/health/liveness");
    assert_eq!(config.output_dir, PathBuf::from("results"));
    assert_eq!(config.suite, "mixed");
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.seed_count, 50);

    assert_eq!(config.load_batch.rate, 10.0);
    assert_eq!(config.load_batch.duration, Duration::from_secs(120));
    assert_eq!(config.load_batch.vus, 10);
    assert_eq!(config.load_batch.max_vus, 50);

    assert_eq!(config.batches.rate, 2.0);
    assert_eq!(config.batches.max_vus, 30);
    assert_eq!(config.singles.start_rate, 2.0);
    assert_eq!(config.reads.stage2, 20);

    assert_eq!(config.tick_interval, Duration::from_millis(50));
    assert_eq!(config.graceful_stop, Duration::from_secs(30));
    assert_eq!(config.log_format, LogFormat::Text);
}

#[test]
fn test_values_override_defaults() {
    let config = from_pairs(&[
        ("BASE_URL", "https://deals.example.com"),
        ("BATCH", "25"),
        ("RATE", "2.5"),
        ("DURATION", "30s"),
        ("SINGLES_STAGE2_DURATION", "5m"),
        ("READS_STAGE1", "3"),
        ("TICK_INTERVAL", "100ms"),
        ("LOG_FORMAT", "JSON"),
        ("OUTPUT_DIR", "/tmp/perf"),
    ])
    .unwrap();

    assert_eq!(config.base_url, "https://deals.example.com");
    assert_eq!(config.batch_size, 25);
    assert_eq!(config.load_batch.rate, 2.5);
    assert_eq!(config.load_batch.duration, Duration::from_secs(30));
    assert_eq!(config.singles.stage2_duration, Duration::from_secs(300));
    assert_eq!(config.reads.stage1, 3);
    assert_eq!(config.tick_interval, Duration::from_millis(100));
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.output_dir, PathBuf::from("/tmp/perf"));
}

#[test]
fn test_empty_value_falls_back_to_default() {
    let config = from_pairs(&[("BATCH", "  "), ("BASE_URL", "")]).unwrap();
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.base_url, "http://localhost:8080");
}

#[test]
fn test_unparsable_number_names_the_variable() {
    let err = from_pairs(&[("MAX_VUS", "lots")]).unwrap_err();
    match &err {
        ConfigError::InvalidValue { var, value, .. } => {
            assert_eq!(var, "MAX_VUS");
            assert_eq!(value, "lots");
        }
        other => panic!("expected InvalidValue, got {:?}", other),
    }
    assert!(err.to_string().contains("MAX_VUS"));
}

#[test]
fn test_bad_duration_is_rejected() {
    let err = from_pairs(&[("BATCH_DURATION", "ten minutes")]).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "BATCH_DURATION"));
}

#[test]
fn test_zero_batch_size_is_out_of_range() {
    let err = from_pairs(&[("BATCH", "0")]).unwrap_err();
    match err {
        ConfigError::Validation(ValidationError::OutOfRange { field, .. }) => {
            assert_eq!(field, "BATCH")
        }
        other => panic!("expected OutOfRange, got {:?}", other),
    }
}

#[test]
fn test_overflowing_duration_is_an_invalid_value() {
    let err = from_pairs(&[("DURATION", "300000000000000d")]).unwrap_err();
    match err {
        ConfigError::InvalidValue { var, .. } => assert_eq!(var, "DURATION"),
        other => panic!("expected InvalidValue, got {:?}", other),
    }
}

#[test]
fn test_huge_durations_are_out_of_range() {
    for var in ["DURATION", "BATCH_DURATION", "READS_STAGE2_DURATION", "GRACEFUL_STOP"] {
        let err = from_pairs(&[(var, "18446744073709551615s")]).unwrap_err();
        match err {
            ConfigError::Validation(ValidationError::OutOfRange { field, .. }) => {
                assert_eq!(field, var)
            }
            other => panic!("{}: expected OutOfRange, got {:?}", var, other),
        }
    }
}

#[test]
fn test_thirty_days_is_the_longest_duration() {
    assert!(from_pairs(&[("DURATION", "30d")]).is_ok());
    assert!(from_pairs(&[("DURATION", "31d")]).is_err());
    assert!(from_pairs(&[("GRACEFUL_STOP", "0s")]).is_ok());
    assert!(from_pairs(&[("TICK_INTERVAL", "0ms")]).is_err());
}

#[test]
fn test_base_url_must_be_http() {
    let err = from_pairs(&[("BASE_URL", "ftp://deals")]).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_health_path_must_be_absolute() {
    let err = from_pairs(&[("HEALTH_PATH", "health")]).unwrap_err();
    match err {
        ConfigError::Validation(e) => assert_eq!(e.field(), Some("HEALTH_PATH")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_inverted_amount_range_is_rejected() {
    let err = from_pairs(&[("MIN_AMOUNT", "500"), ("MAX_AMOUNT", "100")]).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_several_problems_are_reported_together() {
    let err = from_pairs(&[("BATCH", "0"), ("SEED_COUNT", "0")]).unwrap_err();
    match err {
        ConfigError::Validation(ValidationError::Multiple(message)) => {
            assert!(message.contains("BATCH"));
            assert!(message.contains("SEED_COUNT"));
        }
        other => panic!("expected Multiple, got {:?}", other),
    }
}

#[test]
fn test_client_and_orchestrator_settings_derive_from_config() {
    let config = from_pairs(&[("REQUEST_TIMEOUT", "5s"), ("TICK_INTERVAL", "20ms")]).unwrap();
    assert_eq!(
        config.to_client_config().request_timeout,
        Duration::from_secs(5)
    );
    assert_eq!(
        config.to_orchestrator_config().tick_interval,
        Duration::from_millis(20)
    );
}

/// Clear every variable these tests set so ordering between them does not matter.
fn clean_env() {
    for var in ["BASE_URL", "BATCH", "SUITE", "LOG_FORMAT"] {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_from_env_reads_process_environment() {
    clean_env();
    env::set_var("BASE_URL", "http://deals-api:9000");
    env::set_var("BATCH", "7");
    env::set_var("SUITE", "smoke");

    let config = Config::from_env().unwrap();
    assert_eq!(config.base_url, "http://deals-api:9000");
    assert_eq!(config.batch_size, 7);
    assert_eq!(config.suite, "smoke");

    clean_env();
}

#[test]
#[serial]
fn test_from_env_propagates_invalid_values() {
    clean_env();
    env::set_var("BATCH", "-3");

    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::InvalidValue { .. })
    ));

    clean_env();
}
