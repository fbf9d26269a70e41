use serde::{Deserialize, Serialize};

/// Node identifier as it appears on the canvas.
pub type NodeId = String;

/// Closed set of node kinds on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// User-authored text. Never dispatched.
    TextInput,
    /// Uploaded image asset. Never dispatched.
    ImageSource,
    TextGen,
    ImageGen,
    VideoGen,
    ImageAnalysis,
    /// Multi-format ad adaptation fan-out.
    AdFormats,
    /// High-fidelity vertical fan-out with a verification pass.
    VerticalSuite,
}

impl NodeType {
    /// Whether running this node calls the generation collaborator.
    pub fn is_generation(self) -> bool {
        !matches!(self, NodeType::TextInput | NodeType::ImageSource)
    }

    /// Whether this node's semantic role is producing prompt text.
    pub fn is_text_producing(self) -> bool {
        matches!(
            self,
            NodeType::TextInput | NodeType::TextGen | NodeType::ImageAnalysis
        )
    }

    /// Whether this node produces one result per target format.
    pub fn is_fan_out(self) -> bool {
        matches!(self, NodeType::AdFormats | NodeType::VerticalSuite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::TextInput => "text_input",
            NodeType::ImageSource => "image_source",
            NodeType::TextGen => "text_gen",
            NodeType::ImageGen => "image_gen",
            NodeType::VideoGen => "video_gen",
            NodeType::ImageAnalysis => "image_analysis",
            NodeType::AdFormats => "ad_formats",
            NodeType::VerticalSuite => "vertical_suite",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canvas position. Only `y` matters to the engine (image numbering).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A target placement size for fan-out nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdFormat {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl AdFormat {
    pub fn new(id: impl Into<String>, label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            width,
            height,
        }
    }

    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}

/// One filled fan-out result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatOutput {
    pub format_id: String,
    pub width: u32,
    pub height: u32,
    /// Data URI or uploaded URL of the resized image.
    pub image: String,
    /// Outcome of the fidelity check, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// Polymorphic node payload. Which result field is authoritative depends on the node type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // Result fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<FormatOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clips: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Previous single-asset outputs, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,

    // Settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<AdFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Upstream image source ids, in prompt numbering order. Derived by the aggregator.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<NodeId>,
    /// Live operation handle while a long-running job is polled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl NodeData {
    /// Drop every generated result field. Settings and the prompt are kept.
    pub fn clear_results(&mut self) {
        self.output = None;
        self.outputs.clear();
        self.clips.clear();
        self.frames.clear();
        self.analysis = None;
        self.text = None;
        self.operation_id = None;
    }
}

/// A unit of work on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: NodeData,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            position: Position::default(),
            data: NodeData::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.data.prompt = Some(prompt.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.data.text = Some(text.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.data.output = Some(output.into());
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Whether the authoritative result field for this type is populated.
    pub fn has_result(&self) -> bool {
        let d = &self.data;
        match self.node_type {
            NodeType::TextInput | NodeType::TextGen => {
                d.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            }
            NodeType::ImageSource | NodeType::ImageGen | NodeType::VideoGen => {
                d.output.as_deref().is_some_and(|o| !o.is_empty())
            }
            NodeType::ImageAnalysis => d.analysis.is_some(),
            NodeType::AdFormats | NodeType::VerticalSuite => !d.outputs.is_empty(),
        }
    }

    /// Whether the last dispatch of this node failed.
    pub fn is_errored(&self) -> bool {
        self.data.error.is_some()
    }

    /// The image or video asset this node exposes to downstream nodes.
    pub fn asset(&self) -> Option<&str> {
        if self.data.loading {
            return None;
        }
        let asset = match self.node_type {
            NodeType::ImageSource | NodeType::ImageGen | NodeType::VideoGen => {
                self.data.output.as_deref()
            }
            NodeType::AdFormats | NodeType::VerticalSuite => {
                self.data.outputs.first().map(|o| o.image.as_str())
            }
            _ => None,
        };
        asset.filter(|a| !a.is_empty())
    }

    /// The prompt text this node exposes downstream. Only text-producing types have one.
    pub fn text_value(&self) -> Option<&str> {
        if self.data.loading || !self.node_type.is_text_producing() {
            return None;
        }
        self.data.text.as_deref()
    }
}

/// A directed dependency: `target` consumes `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyLink {
    pub source: NodeId,
    pub target: NodeId,
}

impl DependencyLink {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Deep copy of the whole graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<DependencyLink>,
}

impl GraphSnapshot {
    /// Copy with transient fields removed, ready for persistence.
    pub fn stripped(&self) -> Self {
        let mut copy = self.clone();
        for node in &mut copy.nodes {
            node.data.loading = false;
            node.data.status = None;
            node.data.operation_id = None;
        }
        copy
    }
}

// ── Collaborator wire shapes ─────────────────────────────────────

/// `POST generate` body. The API key is attached by the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub prefer_text: bool,
}

/// `POST generate` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerateResponse {
    pub fn image(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn operation(id: impl Into<String>) -> Self {
        Self {
            kind: Some("operation".to_string()),
            operation_id: Some(id.into()),
            ..Default::default()
        }
    }

    /// The asynchronous job token, if this response is one.
    pub fn operation_token(&self) -> Option<&str> {
        match (self.kind.as_deref(), self.operation_id.as_deref()) {
            (Some("operation"), Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

/// `GET operation` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Engine progress broadcast to all subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A node dispatch was admitted and started.
    NodeStarted { node_id: NodeId },
    /// Human-readable progress for a node.
    NodeStatus { node_id: NodeId, status: String },
    /// A node's result was committed to the graph.
    NodeCompleted { node_id: NodeId, elapsed_ms: u64 },
    /// A node dispatch failed; the node was reset.
    NodeFailed { node_id: NodeId, error: String },
    /// A quota error triggered a fixed cool-down before the next attempt.
    QuotaCooldown { attempt: u32, max_attempts: u32, cooldown_secs: u64 },
    /// A long-running operation was checked.
    OperationPolled { operation_id: String, poll: u32, done: bool },
    /// A fan-out batch started.
    BatchStarted { batch: usize, batches: usize, size: usize },
    /// Credits were debited after a successful dispatch.
    CreditsDebited { node_id: NodeId, amount: u64, balance: u64 },
    /// A cascade stopped early.
    ChainAborted { node_id: NodeId, error: String },
    /// A snapshot reached the persistence collaborator.
    SnapshotPersisted { nodes: usize, edges: usize },
}

impl EngineEvent {
    /// The node this event is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineEvent::NodeStarted { node_id }
            | EngineEvent::NodeStatus { node_id, .. }
            | EngineEvent::NodeCompleted { node_id, .. }
            | EngineEvent::NodeFailed { node_id, .. }
            | EngineEvent::CreditsDebited { node_id, .. }
            | EngineEvent::ChainAborted { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}
