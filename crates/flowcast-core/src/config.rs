use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::NodeType;

/// Top-level Flowcast configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub fanout: FanOutConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Generation collaborator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Transport-level timeout applied to every request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String { "http://127.0.0.1:3000/api".to_string() }
fn default_timeout_secs() -> u64 { 300 }

/// Model ids sent with each request, per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_text_model")]
    pub text: String,
    #[serde(default = "default_image_model")]
    pub image: String,
    #[serde(default = "default_video_model")]
    pub video: String,
    #[serde(default = "default_analysis_model")]
    pub analysis: String,
    /// Fast model used for the fidelity yes/no check.
    #[serde(default = "default_verify_model")]
    pub verify: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text: default_text_model(),
            image: default_image_model(),
            video: default_video_model(),
            analysis: default_analysis_model(),
            verify: default_verify_model(),
        }
    }
}

fn default_text_model() -> String { "gemini-2.5-flash".to_string() }
fn default_image_model() -> String { "gemini-2.5-flash-image".to_string() }
fn default_video_model() -> String { "veo-3.0-generate-001".to_string() }
fn default_analysis_model() -> String { "gemini-2.5-pro".to_string() }
fn default_verify_model() -> String { "gemini-2.5-flash-lite".to_string() }

/// Quota retry policy. The cool-down is fixed, not exponential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl RetryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_cooldown_secs() -> u64 { 60 }

/// Long-running operation polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Wait used after the collaborator reports overload.
    #[serde(default = "default_overload_interval")]
    pub overload_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            overload_interval_secs: default_overload_interval(),
            max_polls: default_max_polls(),
        }
    }
}

fn default_poll_interval() -> u64 { 10 }
fn default_overload_interval() -> u64 { 20 }
fn default_max_polls() -> u32 { 180 }

/// Multi-output fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Requests in flight per batch. Batches run one after another.
    #[serde(default = "default_batch_width")]
    pub batch_width: usize,
    #[serde(default = "default_verify_fidelity")]
    pub verify_fidelity: bool,
    /// Upload resized results instead of keeping inline data URIs.
    #[serde(default)]
    pub upload_results: bool,
    /// Relative aspect-ratio difference under which results are cropped instead of letterboxed.
    #[serde(default = "default_fit_tolerance")]
    pub fit_tolerance: f64,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            batch_width: default_batch_width(),
            verify_fidelity: default_verify_fidelity(),
            upload_results: false,
            fit_tolerance: default_fit_tolerance(),
        }
    }
}

fn default_batch_width() -> usize { 2 }
fn default_verify_fidelity() -> bool { true }
fn default_fit_tolerance() -> f64 { 0.25 }

/// Video clip generation and stitching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_inter_clip_delay")]
    pub inter_clip_delay_secs: u64,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            inter_clip_delay_secs: default_inter_clip_delay(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

fn default_inter_clip_delay() -> u64 { 30 }
fn default_ffmpeg() -> String { "ffmpeg".to_string() }

/// Credit admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: u64,
    #[serde(default)]
    pub tariff: TariffConfig,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            tariff: TariffConfig::default(),
        }
    }
}

fn default_initial_balance() -> u64 { 100 }

/// Fixed per-node-type cost, known before any network activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    #[serde(default = "default_text_cost")]
    pub text: u64,
    #[serde(default = "default_image_cost")]
    pub image: u64,
    #[serde(default = "default_video_cost")]
    pub video: u64,
    #[serde(default = "default_analysis_cost")]
    pub analysis: u64,
    #[serde(default = "default_ad_formats_cost")]
    pub ad_formats: u64,
    #[serde(default = "default_vertical_suite_cost")]
    pub vertical_suite: u64,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            text: default_text_cost(),
            image: default_image_cost(),
            video: default_video_cost(),
            analysis: default_analysis_cost(),
            ad_formats: default_ad_formats_cost(),
            vertical_suite: default_vertical_suite_cost(),
        }
    }
}

impl TariffConfig {
    /// Cost of one dispatch of a node of this type. Non-generation nodes are free.
    pub fn cost(&self, node_type: NodeType) -> u64 {
        match node_type {
            NodeType::TextInput | NodeType::ImageSource => 0,
            NodeType::TextGen => self.text,
            NodeType::ImageGen => self.image,
            NodeType::VideoGen => self.video,
            NodeType::ImageAnalysis => self.analysis,
            NodeType::AdFormats => self.ad_formats,
            NodeType::VerticalSuite => self.vertical_suite,
        }
    }
}

fn default_text_cost() -> u64 { 1 }
fn default_image_cost() -> u64 { 2 }
fn default_video_cost() -> u64 { 10 }
fn default_analysis_cost() -> u64 { 1 }
fn default_ad_formats_cost() -> u64 { 8 }
fn default_vertical_suite_cost() -> u64 { 12 }

/// Engine behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reject a trigger for a node that already has a dispatch in flight.
    /// When off, the last write to the graph wins.
    #[serde(default)]
    pub reject_concurrent_triggers: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
    /// SQLite project store. Default: ~/.flowcast/projects.db
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reject_concurrent_triggers: false,
            history_limit: default_history_limit(),
            persist_debounce_ms: default_persist_debounce_ms(),
            store_path: None,
        }
    }
}

fn default_history_limit() -> usize { 50 }
fn default_persist_debounce_ms() -> u64 { 1500 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the project store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let raw = self
            .engine
            .store_path
            .as_deref()
            .unwrap_or("~/.flowcast/projects.db");
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWCAST_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWCAST_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWCAST_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWCAST_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWCAST_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.cooldown(), Duration::from_secs(60));
        assert_eq!(config.fanout.batch_width, 2);
        assert!(config.fanout.verify_fidelity);
        assert!((config.fanout.fit_tolerance - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.polling.interval_secs, 10);
        assert!(!config.engine.reject_concurrent_triggers);
        assert_eq!(config.engine.history_limit, 50);
    }

    #[test]
    fn test_tariff_is_free_for_source_nodes() {
        let tariff = TariffConfig::default();
        assert_eq!(tariff.cost(NodeType::TextInput), 0);
        assert_eq!(tariff.cost(NodeType::ImageSource), 0);
        assert_eq!(tariff.cost(NodeType::ImageGen), 2);
        assert_eq!(tariff.cost(NodeType::VideoGen), 10);
    }

    #[test]
    fn test_partial_tariff_override() {
        let toml_str = r#"
[credits]
initial_balance = 7

[credits.tariff]
image = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.credits.initial_balance, 7);
        assert_eq!(config.credits.tariff.image, 5);
        assert_eq!(config.credits.tariff.text, 1);
    }
}
