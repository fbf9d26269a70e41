use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowcast_core::config::BackendConfig;
use flowcast_core::error::{reports_status, FlowError, Result};
use flowcast_core::traits::GenerationClient;
use flowcast_core::types::*;

use crate::asset::{is_data_uri, parse_data_uri, sniff_mime, to_data_uri};

/// HTTP client for the generation collaborator (`generate`, `operation`, `upload`).
pub struct HttpGenerationClient {
    http: Client,
    config: BackendConfig,
}

impl HttpGenerationClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Image payloads must be data URIs; remote references are fetched and inlined.
    async fn inline_images(&self, images: Vec<String>) -> Result<Vec<String>> {
        let mut inlined = Vec::with_capacity(images.len());
        for image in images {
            if is_data_uri(&image) {
                inlined.push(image);
                continue;
            }
            let bytes = self.fetch_remote(&image).await?;
            inlined.push(to_data_uri(sniff_mime(&bytes), &bytes));
        }
        Ok(inlined)
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FlowError::Transport(format!(
                "HTTP {} fetching asset {}",
                response.status(),
                url
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Serialize)]
struct WireGenerate<'a> {
    #[serde(flatten)]
    request: &'a GenerateRequest,
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ── Error classification ─────────────────────────────────────────

fn quota_pattern() -> &'static Regex {
    static QUOTA: OnceLock<Regex> = OnceLock::new();
    QUOTA.get_or_init(|| {
        Regex::new(r"(?i)\b(?:resource_exhausted|quotas?|rate[ _-]?limit(?:ed)?)\b")
            .expect("valid quota pattern")
    })
}

fn safety_pattern() -> &'static Regex {
    static SAFETY: OnceLock<Regex> = OnceLock::new();
    SAFETY.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:safety|responsible ai|content polic(?:y|ies)|blocked (?:by|for|due to) (?:the )?(?:safety|content|policy))\b",
        )
        .expect("valid safety pattern")
    })
}

fn is_quota_message(msg: &str) -> bool {
    quota_pattern().is_match(msg) || reports_status(msg, &[429])
}

fn is_safety_message(msg: &str) -> bool {
    safety_pattern().is_match(msg)
}

/// Map a collaborator-reported error string onto the taxonomy.
pub fn classify_error(message: &str) -> FlowError {
    if is_quota_message(message) {
        FlowError::Quota {
            attempts: 1,
            message: message.to_string(),
        }
    } else if is_safety_message(message) {
        FlowError::SafetyFiltered(message.to_string())
    } else {
        FlowError::Transport(message.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> FlowError {
    if status == StatusCode::TOO_MANY_REQUESTS || is_quota_message(body) {
        return FlowError::Quota {
            attempts: 1,
            message: format!("HTTP {}: {}", status, body),
        };
    }
    FlowError::Transport(format!("HTTP {}: {}", status, body))
}

impl GenerationClient for HttpGenerationClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<GenerateResponse>> {
        Box::pin(async move {
            let mut request = request;
            request.images = self.inline_images(std::mem::take(&mut request.images)).await?;

            debug!(
                model = %request.model,
                images = request.images.len(),
                aspect_ratio = ?request.aspect_ratio,
                "Submitting generate request"
            );

            let body = WireGenerate {
                request: &request,
                api_key: self.config.api_key.as_deref(),
            };

            let response = self
                .http
                .post(self.endpoint("generate"))
                .json(&body)
                .send()
                .await
                .map_err(|e| FlowError::Transport(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            if !status.is_success() {
                return Err(classify_status(status, &text));
            }

            let parsed: GenerateResponse = serde_json::from_str(&text)
                .map_err(|e| FlowError::Transport(format!("malformed generate response: {}", e)))?;

            if let Some(ref err) = parsed.error {
                return Err(classify_error(err));
            }
            Ok(parsed)
        })
    }

    fn operation_status(&self, operation_id: String) -> BoxFuture<'_, Result<OperationStatus>> {
        Box::pin(async move {
            let mut query = vec![("id", operation_id.as_str())];
            if let Some(key) = self.config.api_key.as_deref() {
                query.push(("key", key));
            }

            let response = self
                .http
                .get(self.endpoint("operation"))
                .query(&query)
                .send()
                .await
                .map_err(|e| FlowError::Transport(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            if !status.is_success() {
                // 429/503 stay Transport so the poller reads them as overload, not quota.
                return Err(FlowError::Transport(format!("HTTP {}: {}", status, text)));
            }

            serde_json::from_str(&text)
                .map_err(|e| FlowError::Transport(format!("malformed operation response: {}", e)))
        })
    }

    fn upload(
        &self,
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(&mime)
                .map_err(|e| FlowError::Transport(e.to_string()))?;
            let form = reqwest::multipart::Form::new().part("file", part);

            let response = self
                .http
                .post(self.endpoint("upload"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| FlowError::Transport(e.to_string()))?;

            let status = response.status();
            let parsed: UploadResponse = response
                .json()
                .await
                .map_err(|e| FlowError::Transport(format!("malformed upload response: {}", e)))?;

            match (status.is_success(), parsed.url, parsed.error) {
                (true, Some(url), _) => Ok(url),
                (_, _, Some(err)) => Err(FlowError::Transport(format!("upload rejected: {}", err))),
                _ => {
                    warn!(status = %status, "Upload returned no URL");
                    Err(FlowError::Transport(format!("HTTP {}: upload returned no URL", status)))
                }
            }
        })
    }

    fn fetch_asset(&self, uri: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            if is_data_uri(&uri) {
                return parse_data_uri(&uri).map(|d| d.bytes);
            }
            self.fetch_remote(&uri).await
        })
    }
}
