//! Generation Dispatcher: runs one node against the generation collaborator.
//!
//! The dispatcher looks up the node type's strategy, validates the resolved
//! inputs, and drives the request through quota retry, operation polling,
//! clip stitching or format fan-out as the strategy's plan requires. It never
//! touches the graph; the caller commits the returned [`NodeOutcome`].

pub mod fanout;
pub mod formats;
pub mod resize;
pub mod strategy;
mod video;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use flowcast_core::config::{AppConfig, FanOutConfig, ModelsConfig, VideoConfig};
use flowcast_core::error::{FlowError, Result};
use flowcast_core::event::EventBus;
use flowcast_core::traits::{GenerationClient, Stitcher};
use flowcast_core::types::*;
use flowcast_genai::{OperationPoller, QuotaRetry, RetryingClient};

use crate::graph::UpstreamContext;
use strategy::{strategy_for, GenerationStrategy, Interpreted, Plan};

/// Previous outputs kept per node.
const MAX_OUTPUT_HISTORY: usize = 20;

/// Everything a strategy needs to run one node.
#[derive(Debug, Clone)]
pub struct DispatchInput {
    pub node: WorkflowNode,
    /// Custom prompt for this trigger, else the node's own prompt.
    pub instruction: Option<String>,
    pub context: UpstreamContext,
}

impl DispatchInput {
    pub fn has_instruction(&self) -> bool {
        self.instruction
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// Upstream texts followed by the instruction.
    pub fn prompt(&self) -> String {
        self.context.compose_prompt(self.instruction.as_deref())
    }
}

/// Intermediate progress reported while a node runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Status(String),
    /// Live operation handle, or `None` once it resolved.
    Operation(Option<String>),
}

pub type ProgressFn<'a> = &'a (dyn Fn(Progress) + Send + Sync);

/// The result of a successful dispatch, ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Text(String),
    Image(String),
    Analysis {
        analysis: Value,
        text: String,
    },
    Video {
        output: String,
        clips: Vec<String>,
        /// Set when stitching failed and the first clip stands in.
        stitch_error: Option<String>,
    },
    Formats(Vec<FormatOutput>),
}

impl NodeOutcome {
    /// Write this outcome into a node payload, replacing stale results.
    pub fn apply(self, data: &mut NodeData) {
        let previous = data.output.take();
        data.clear_results();
        data.error = None;
        data.status = None;

        match self {
            NodeOutcome::Text(text) => data.text = Some(text),
            NodeOutcome::Image(output) => {
                remember(data, previous);
                data.output = Some(output);
            }
            NodeOutcome::Analysis { analysis, text } => {
                data.analysis = Some(analysis);
                data.text = Some(text);
            }
            NodeOutcome::Video {
                output,
                clips,
                stitch_error,
            } => {
                remember(data, previous);
                data.output = Some(output);
                data.clips = clips;
                if let Some(err) = stitch_error {
                    data.status = Some(format!("Stitching failed, showing the first clip: {}", err));
                }
            }
            NodeOutcome::Formats(outputs) => data.outputs = outputs,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeOutcome::Text(_) => "text",
            NodeOutcome::Image(_) => "image",
            NodeOutcome::Analysis { .. } => "analysis",
            NodeOutcome::Video { .. } => "video",
            NodeOutcome::Formats(_) => "formats",
        }
    }
}

fn remember(data: &mut NodeData, previous: Option<String>) {
    if let Some(previous) = previous.filter(|p| !p.is_empty()) {
        data.history.push(previous);
        let overflow = data.history.len().saturating_sub(MAX_OUTPUT_HISTORY);
        data.history.drain(..overflow);
    }
}

pub struct Dispatcher {
    client: Arc<dyn GenerationClient>,
    poller: OperationPoller,
    stitcher: Arc<dyn Stitcher>,
    models: ModelsConfig,
    fanout: FanOutConfig,
    video: VideoConfig,
    events: Arc<EventBus>,
}

impl Dispatcher {
    /// Wrap `client` in quota retry and wire the poller to the same collaborator.
    pub fn new(
        client: Arc<dyn GenerationClient>,
        stitcher: Arc<dyn Stitcher>,
        config: &AppConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let retry = QuotaRetry::new(config.retry.clone()).with_events(events.clone());
        let poller = OperationPoller::new(client.clone(), config.polling.clone())
            .with_events(events.clone());
        Self {
            client: Arc::new(RetryingClient::new(client, retry)),
            poller,
            stitcher,
            models: config.models.clone(),
            fanout: config.fanout.clone(),
            video: config.video.clone(),
            events,
        }
    }

    /// Run one node. Errors are returned untouched; resetting the node is the caller's job.
    pub async fn dispatch(&self, input: DispatchInput, progress: ProgressFn<'_>) -> Result<NodeOutcome> {
        let node_type = input.node.node_type;
        let strategy = strategy_for(node_type)
            .ok_or_else(|| FlowError::UnsupportedNode(input.node.id.clone()))?;
        strategy.validate(&input)?;

        let plan = strategy.plan(&input.node);
        debug!(node_id = %input.node.id, %node_type, ?plan, "Dispatching node");

        let outcome = match plan {
            Plan::Single => {
                progress(Progress::Status("Generating...".into()));
                let request = strategy.build_request(&input, &self.models);
                match self.request(strategy, request, progress).await? {
                    Interpreted::Text(text) => NodeOutcome::Text(text),
                    Interpreted::Asset(output) => NodeOutcome::Image(output),
                    Interpreted::Analysis { analysis, text } => {
                        NodeOutcome::Analysis { analysis, text }
                    }
                    Interpreted::Operation(id) => {
                        return Err(FlowError::Transport(format!("unresolved operation {}", id)))
                    }
                }
            }
            Plan::Clips(count) => self.run_clips(strategy, &input, count, progress).await?,
            Plan::FanOut {
                formats,
                high_fidelity,
            } => {
                let base = strategy.build_request(&input, &self.models);
                let verify = high_fidelity && self.fanout.verify_fidelity;
                let outputs = self
                    .run_fanout(strategy, &input, base, formats, verify, progress)
                    .await?;
                NodeOutcome::Formats(outputs)
            }
        };

        info!(node_id = %input.node.id, kind = outcome.kind(), "Dispatch succeeded");
        Ok(outcome)
    }

    /// One collaborator round-trip. Operation tokens are polled to completion.
    async fn request(
        &self,
        strategy: &dyn GenerationStrategy,
        request: GenerateRequest,
        progress: ProgressFn<'_>,
    ) -> Result<Interpreted> {
        let response = self.client.generate(request).await?;
        match strategy.interpret_response(response)? {
            Interpreted::Operation(operation_id) => {
                progress(Progress::Operation(Some(operation_id.clone())));
                progress(Progress::Status("Rendering...".into()));
                let result = self.poller.wait(&operation_id).await;
                progress(Progress::Operation(None));
                Ok(Interpreted::Asset(result?))
            }
            other => Ok(other),
        }
    }
}
