//! Per-node-type generation strategies.
//!
//! Each generation node type maps to one stateless strategy that validates
//! the resolved inputs, builds the collaborator request and interprets the
//! response. Multi-step behaviour (clips, fan-out) is described by a [`Plan`]
//! and driven by the dispatcher.

use serde_json::Value;

use flowcast_core::config::ModelsConfig;
use flowcast_core::error::{FlowError, Result};
use flowcast_core::types::*;
use flowcast_genai::client::classify_error;

use super::formats::formats_for;
use super::DispatchInput;

const DEFAULT_ANALYSIS_INSTRUCTION: &str = "Analyze the image. Describe the subject, composition, \
colour palette, typography and any product details. Respond with a JSON object that has a \
\"summary\" string field plus any structured fields you find useful.";

const DEFAULT_FANOUT_INSTRUCTION: &str =
    "Recompose the reference image for a new placement without changing its content.";

/// A collaborator response reduced to what the node cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpreted {
    /// Image or video URL / data URI.
    Asset(String),
    Text(String),
    Analysis { analysis: Value, text: String },
    /// Asynchronous job token; the poller resolves it to an asset.
    Operation(String),
}

/// How many collaborator round-trips a node needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Single,
    /// Sequential video clips, stitched afterwards when more than one.
    Clips(u32),
    /// One request per format, in bounded batches.
    FanOut {
        formats: Vec<AdFormat>,
        high_fidelity: bool,
    },
}

pub trait GenerationStrategy: Send + Sync {
    /// Fail fast on inputs the collaborator cannot work with.
    fn validate(&self, input: &DispatchInput) -> Result<()> {
        require_any_input(input)
    }

    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest;

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted>;

    fn plan(&self, _node: &WorkflowNode) -> Plan {
        Plan::Single
    }
}

/// Strategy table. Non-generation types have none.
pub fn strategy_for(node_type: NodeType) -> Option<&'static dyn GenerationStrategy> {
    match node_type {
        NodeType::TextGen => Some(&TextStrategy),
        NodeType::ImageGen => Some(&ImageStrategy),
        NodeType::VideoGen => Some(&VideoStrategy),
        NodeType::ImageAnalysis => Some(&AnalysisStrategy),
        NodeType::AdFormats | NodeType::VerticalSuite => Some(&FanOutStrategy),
        NodeType::TextInput | NodeType::ImageSource => None,
    }
}

fn require_any_input(input: &DispatchInput) -> Result<()> {
    let ctx = &input.context;
    if input.has_instruction()
        || !ctx.texts.is_empty()
        || ctx.has_images()
        || !ctx.videos.is_empty()
        || ctx.analysis.is_some()
    {
        return Ok(());
    }
    Err(FlowError::MissingInput(
        "add a prompt or connect a text or image node".into(),
    ))
}

fn require_image(input: &DispatchInput, purpose: &str) -> Result<()> {
    if input.context.has_images() {
        return Ok(());
    }
    if !input.context.videos.is_empty() {
        return Err(FlowError::MissingInput(format!(
            "the connected video has no still image to {}; connect an image node",
            purpose
        )));
    }
    if input.context.direct_inputs == 0 {
        Err(FlowError::MissingInput(format!(
            "connect an image node to {}",
            purpose
        )))
    } else {
        Err(FlowError::MissingInput(format!(
            "the connected nodes have not produced an image to {} yet; run them first",
            purpose
        )))
    }
}

/// Reject `error` payloads and operation tokens the strategy cannot use.
fn check_error(response: &GenerateResponse) -> Result<()> {
    match response.error.as_deref() {
        Some(message) if !message.trim().is_empty() => Err(classify_error(message)),
        _ => Ok(()),
    }
}

fn expect_asset(response: GenerateResponse, what: &str) -> Result<Interpreted> {
    check_error(&response)?;
    if let Some(id) = response.operation_token() {
        return Ok(Interpreted::Operation(id.to_string()));
    }
    match response.output.filter(|o| !o.is_empty()) {
        Some(output) => Ok(Interpreted::Asset(output)),
        None => Err(FlowError::Transport(format!(
            "response carried no {}{}",
            what,
            response
                .text
                .map(|t| format!(" (collaborator said: {})", truncate(&t, 200)))
                .unwrap_or_default()
        ))),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct TextStrategy;

impl GenerationStrategy for TextStrategy {
    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest {
        GenerateRequest {
            prompt: input.prompt(),
            model: models.text.clone(),
            images: input.context.image_uris(),
            aspect_ratio: None,
            temperature: input.node.data.temperature,
            prefer_text: true,
        }
    }

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted> {
        check_error(&response)?;
        match response.text.filter(|t| !t.trim().is_empty()) {
            Some(text) => Ok(Interpreted::Text(text.trim().to_string())),
            None => Err(FlowError::Transport("response carried no text".into())),
        }
    }
}

pub struct ImageStrategy;

impl GenerationStrategy for ImageStrategy {
    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest {
        GenerateRequest {
            prompt: input.prompt(),
            model: models.image.clone(),
            images: input.context.image_uris(),
            aspect_ratio: input.node.data.aspect_ratio.clone(),
            temperature: input.node.data.temperature,
            prefer_text: false,
        }
    }

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted> {
        expect_asset(response, "image")
    }
}

pub struct VideoStrategy;

impl GenerationStrategy for VideoStrategy {
    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest {
        // One reference conditions the clip: the top image, else the last
        // frame of an upstream video, else the nearest upstream clip itself.
        let still = input
            .context
            .images
            .first()
            .map(|i| i.image.clone())
            .or_else(|| input.context.frames.last().cloned())
            .or_else(|| input.context.videos.first().map(|v| v.image.clone()));
        GenerateRequest {
            prompt: input.prompt(),
            model: models.video.clone(),
            images: still.into_iter().collect(),
            aspect_ratio: Some(
                input
                    .node
                    .data
                    .aspect_ratio
                    .clone()
                    .unwrap_or_else(|| "16:9".to_string()),
            ),
            temperature: None,
            prefer_text: false,
        }
    }

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted> {
        expect_asset(response, "video")
    }

    fn plan(&self, node: &WorkflowNode) -> Plan {
        Plan::Clips(node.data.clip_count.unwrap_or(1).max(1))
    }
}

pub struct AnalysisStrategy;

impl GenerationStrategy for AnalysisStrategy {
    fn validate(&self, input: &DispatchInput) -> Result<()> {
        require_image(input, "analyze")
    }

    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest {
        let instruction = input
            .instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_ANALYSIS_INSTRUCTION);
        GenerateRequest {
            prompt: input.context.compose_prompt(Some(instruction)),
            model: models.analysis.clone(),
            images: input.context.image_uris(),
            aspect_ratio: None,
            temperature: input.node.data.temperature,
            prefer_text: true,
        }
    }

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted> {
        check_error(&response)?;
        let raw = response
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FlowError::Transport("analysis response carried no text".into()))?;
        Ok(parse_analysis(&raw))
    }
}

/// Parse an analysis answer. JSON (optionally fenced) is kept structured;
/// prose becomes `{"description": ...}`.
pub fn parse_analysis(raw: &str) -> Interpreted {
    let body = strip_fence(raw.trim());
    match serde_json::from_str::<Value>(body) {
        Ok(analysis @ Value::Object(_)) => {
            let text = analysis
                .get("summary")
                .or_else(|| analysis.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            Interpreted::Analysis { analysis, text }
        }
        _ => Interpreted::Analysis {
            analysis: serde_json::json!({ "description": raw.trim() }),
            text: raw.trim().to_string(),
        },
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Ad-format and vertical-suite nodes. `build_request` produces the shared
/// base request; the fan-out driver specialises it per format.
pub struct FanOutStrategy;

impl GenerationStrategy for FanOutStrategy {
    fn validate(&self, input: &DispatchInput) -> Result<()> {
        require_image(input, "adapt")
    }

    fn build_request(&self, input: &DispatchInput, models: &ModelsConfig) -> GenerateRequest {
        let instruction = input
            .instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_FANOUT_INSTRUCTION);
        GenerateRequest {
            prompt: input.context.compose_prompt(Some(instruction)),
            model: models.image.clone(),
            images: input
                .context
                .images
                .first()
                .map(|i| i.image.clone())
                .into_iter()
                .collect(),
            aspect_ratio: None,
            temperature: input.node.data.temperature,
            prefer_text: false,
        }
    }

    fn interpret_response(&self, response: GenerateResponse) -> Result<Interpreted> {
        match expect_asset(response, "image")? {
            Interpreted::Operation(id) => Err(FlowError::Transport(format!(
                "unexpected long-running operation {} for a format adaptation",
                id
            ))),
            other => Ok(other),
        }
    }

    fn plan(&self, node: &WorkflowNode) -> Plan {
        Plan::FanOut {
            formats: formats_for(node.node_type, &node.data.formats),
            high_fidelity: node.node_type == NodeType::VerticalSuite,
        }
    }
}
