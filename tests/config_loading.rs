use std::io::Write;

use flowcast_core::config::AppConfig;
use flowcast_core::types::NodeType;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[backend]
base_url = "https://studio.example.com/api"
api_key = "fc-test-key"
timeout_secs = 120

[models]
image = "image-model-x"
verify = "verify-model-y"

[retry]
max_attempts = 3
cooldown_secs = 30

[polling]
interval_secs = 5
max_polls = 12

[fanout]
batch_width = 4
verify_fidelity = false
upload_results = true

[video]
inter_clip_delay_secs = 10
ffmpeg = "/usr/local/bin/ffmpeg"

[credits]
initial_balance = 250

[credits.tariff]
video = 25

[engine]
reject_concurrent_triggers = true
history_limit = 10
store_path = "/tmp/flowcast-test/projects.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.backend.base_url, "https://studio.example.com/api");
    assert_eq!(config.backend.api_key, Some("fc-test-key".to_string()));
    assert_eq!(config.backend.timeout_secs, 120);
    assert_eq!(config.models.image, "image-model-x");
    assert_eq!(config.models.verify, "verify-model-y");
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.cooldown_secs, 30);
    assert_eq!(config.polling.interval_secs, 5);
    assert_eq!(config.polling.max_polls, 12);
    assert_eq!(config.fanout.batch_width, 4);
    assert!(!config.fanout.verify_fidelity);
    assert!(config.fanout.upload_results);
    assert_eq!(config.video.inter_clip_delay_secs, 10);
    assert_eq!(config.video.ffmpeg, "/usr/local/bin/ffmpeg");
    assert_eq!(config.credits.initial_balance, 250);
    assert_eq!(config.credits.tariff.cost(NodeType::VideoGen), 25);
    assert_eq!(config.credits.tariff.cost(NodeType::ImageGen), 2);
    assert!(config.engine.reject_concurrent_triggers);
    assert_eq!(config.engine.history_limit, 10);
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/tmp/flowcast-test/projects.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWCAST_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[backend]
api_key = "${FLOWCAST_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.backend.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("FLOWCAST_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[backend]
base_url = "http://localhost:8080"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.cooldown_secs, 60);
    assert_eq!(config.polling.interval_secs, 10);
    assert_eq!(config.polling.overload_interval_secs, 20);
    assert_eq!(config.fanout.batch_width, 2);
    assert!(config.fanout.verify_fidelity);
    assert!(!config.fanout.upload_results);
    assert_eq!(config.video.inter_clip_delay_secs, 30);
    assert_eq!(config.credits.initial_balance, 100);
    assert_eq!(config.engine.persist_debounce_ms, 1500);
    assert!(config.engine.store_path.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/flowcast.toml")).unwrap_err();
    assert!(matches!(
        err,
        flowcast_core::error::FlowError::ConfigNotFound(_)
    ));
}

#[test]
fn test_malformed_config_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[retry]\nmax_attempts = \"many\"\n")
        .expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, flowcast_core::error::FlowError::Config(_)));
}
