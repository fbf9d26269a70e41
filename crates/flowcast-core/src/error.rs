use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::types::FormatOutput;

#[derive(Debug, Error)]
pub enum FlowError {
    // Input errors
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Upstream node '{node}' is still generating")]
    UpstreamNotReady { node: String },

    // Collaborator errors
    #[error("Quota exhausted after {attempts} attempt(s): {message}")]
    Quota { attempts: u32, message: String },

    #[error("Blocked by content safety filter: {0}")]
    SafetyFiltered(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stitching failed: {0}")]
    Stitch(String),

    #[error("Partial failure: {completed}/{total} results generated: {reason}")]
    PartialFailure {
        completed: usize,
        total: usize,
        outputs: Vec<FormatOutput>,
        reason: String,
    },

    // Admission errors
    #[error("Insufficient credits: {required} required, {balance} available")]
    InsufficientCredits { required: u64, balance: u64 },

    // Graph errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node '{0}' is not a generation node")]
    UnsupportedNode(String),

    #[error("Node '{0}' already has a dispatch in flight")]
    AlreadyRunning(String),

    #[error("Chain aborted at node '{node}': {source}")]
    ChainAborted {
        node: String,
        #[source]
        source: Box<FlowError>,
    },

    // Post-processing
    #[error("Image processing error: {0}")]
    Image(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether this error signals quota or rate-limit exhaustion.
    pub fn is_quota(&self) -> bool {
        matches!(self, FlowError::Quota { .. })
    }

    /// Transient collaborator overload (HTTP 429/503 or an "overloaded" message).
    pub fn is_overload(&self) -> bool {
        match self {
            FlowError::Quota { .. } => true,
            FlowError::Transport(msg) => is_overload_message(msg),
            _ => false,
        }
    }

    /// Errors the user can fix by editing the graph.
    pub fn is_user_fixable(&self) -> bool {
        matches!(
            self,
            FlowError::MissingInput(_)
                | FlowError::UpstreamNotReady { .. }
                | FlowError::InsufficientCredits { .. }
        )
    }

    /// The innermost error of a chain abort.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::ChainAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn status_pattern() -> &'static Regex {
    static STATUS: OnceLock<Regex> = OnceLock::new();
    STATUS.get_or_init(|| {
        Regex::new(r"(?i)(?:^\W*|\b(?:http|status|code)\W{0,3})(\d{3})\b")
            .expect("valid status pattern")
    })
}

fn overload_pattern() -> &'static Regex {
    static OVERLOAD: OnceLock<Regex> = OnceLock::new();
    OVERLOAD.get_or_init(|| {
        Regex::new(r"(?i)\b(?:overloaded|unavailable|too many requests)\b")
            .expect("valid overload pattern")
    })
}

/// Whether `msg` reports one of `codes` as an HTTP status, e.g. `HTTP 429`,
/// `"code": 503` or a message that opens with the code. Ids and other
/// numbers that merely contain the digits do not count.
pub fn reports_status(msg: &str, codes: &[u16]) -> bool {
    status_pattern()
        .captures_iter(msg)
        .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        .any(|code| codes.contains(&code))
}

/// Classify a status code / message pair as transient overload.
pub fn is_overload_message(msg: &str) -> bool {
    reports_status(msg, &[429, 503]) || overload_pattern().is_match(msg)
}

pub type Result<T> = std::result::Result<T, FlowError>;
