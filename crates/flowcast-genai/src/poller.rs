use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use flowcast_core::config::PollingConfig;
use flowcast_core::error::{is_overload_message, FlowError, Result};
use flowcast_core::event::EventBus;
use flowcast_core::traits::GenerationClient;
use flowcast_core::types::*;

/// Where a long-running operation stands after one status check.
#[derive(Debug)]
pub enum PollState {
    /// Keep polling. `overloaded` selects the longer back-off interval.
    Pending { overloaded: bool },
    Done(String),
    Failed(FlowError),
}

/// Drives asynchronous (video) jobs to completion.
pub struct OperationPoller {
    client: Arc<dyn GenerationClient>,
    config: PollingConfig,
    events: Option<Arc<EventBus>>,
}

impl OperationPoller {
    pub fn new(client: Arc<dyn GenerationClient>, config: PollingConfig) -> Self {
        Self {
            client,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Poll until the operation resolves to a result URL or fails.
    pub async fn wait(&self, operation_id: &str) -> Result<String> {
        let mut delay = Duration::from_secs(self.config.interval_secs);

        for poll in 1..=self.config.max_polls {
            tokio::time::sleep(delay).await;

            let status = self.client.operation_status(operation_id.to_string()).await;
            let state = classify(status);

            if let Some(ref events) = self.events {
                events.publish(EngineEvent::OperationPolled {
                    operation_id: operation_id.to_string(),
                    poll,
                    done: !matches!(state, PollState::Pending { .. }),
                });
            }

            match state {
                PollState::Pending { overloaded } => {
                    delay = if overloaded {
                        warn!(operation_id, poll, "Collaborator overloaded, backing off");
                        Duration::from_secs(self.config.overload_interval_secs)
                    } else {
                        debug!(operation_id, poll, "Operation pending");
                        Duration::from_secs(self.config.interval_secs)
                    };
                }
                PollState::Done(url) => {
                    info!(operation_id, polls = poll, "Operation complete");
                    return Ok(url);
                }
                PollState::Failed(e) => {
                    warn!(operation_id, poll, error = %e, "Operation failed");
                    return Err(e);
                }
            }
        }

        Err(FlowError::Transport(format!(
            "operation {} still pending after {} polls",
            operation_id, self.config.max_polls
        )))
    }
}

/// Interpret one status check.
pub fn classify(status: Result<OperationStatus>) -> PollState {
    let status = match status {
        Ok(s) => s,
        Err(e) if e.is_overload() => return PollState::Pending { overloaded: true },
        Err(e) => return PollState::Failed(e),
    };

    if let Some(err) = status.error {
        let overloaded = matches!(err.code, Some(429) | Some(503))
            || is_overload_message(&err.message);
        if overloaded {
            return PollState::Pending { overloaded: true };
        }
        return PollState::Failed(FlowError::Transport(format!(
            "operation failed: {}",
            err.message
        )));
    }

    if !status.done {
        return PollState::Pending { overloaded: false };
    }

    let response = status.response.unwrap_or(Value::Null);

    if let Some(reason) = find_safety_flag(&response) {
        return PollState::Failed(FlowError::SafetyFiltered(reason));
    }

    match find_result_url(&response) {
        Some(url) => PollState::Done(url),
        None => PollState::Failed(FlowError::Transport(format!(
            "operation finished without a result URL; response keys: [{}]",
            top_level_keys(&response)
        ))),
    }
}

const URL_KEYS: &[&str] = &["uri", "url", "videoUri", "video_uri", "gcsUri", "output"];

/// Depth-first search of the whole response for a playable asset reference.
pub fn find_result_url(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in URL_KEYS {
                if let Some(Value::String(s)) = map.get(*key) {
                    if looks_like_asset(s) {
                        return Some(s.clone());
                    }
                }
            }
            if let (Some(Value::String(data)), Some(Value::String(mime))) =
                (map.get("bytesBase64Encoded"), map.get("mimeType"))
            {
                return Some(format!("data:{};base64,{}", mime, data));
            }
            map.values().find_map(find_result_url)
        }
        Value::Array(items) => items.iter().find_map(find_result_url),
        _ => None,
    }
}

fn looks_like_asset(s: &str) -> bool {
    s.starts_with("https://")
        || s.starts_with("http://")
        || s.starts_with("gs://")
        || s.starts_with("data:")
}

/// Content-safety markers anywhere in the response.
pub fn find_safety_flag(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(count) = map.get("raiMediaFilteredCount").and_then(Value::as_u64) {
                if count > 0 {
                    let reasons = map
                        .get("raiMediaFilteredReasons")
                        .and_then(Value::as_array)
                        .map(|r| {
                            r.iter()
                                .filter_map(Value::as_str)
                                .collect::<Vec<_>>()
                                .join("; ")
                        })
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| format!("{} result(s) filtered", count));
                    return Some(reasons);
                }
            }
            if let Some(reasons) = map.get("raiMediaFilteredReasons").and_then(Value::as_array) {
                let joined = reasons
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ");
                if !joined.is_empty() {
                    return Some(joined);
                }
            }
            for key in ["safetyFiltered", "filtered", "blocked"] {
                if map.get(key).and_then(Value::as_bool) == Some(true) {
                    return Some(format!("response flagged '{}'", key));
                }
            }
            map.values().find_map(find_safety_flag)
        }
        Value::Array(items) => items.iter().find_map(find_safety_flag),
        _ => None,
    }
}

fn top_level_keys(value: &Value) -> String {
    value
        .as_object()
        .map(|m| m.keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default()
}
