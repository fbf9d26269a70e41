use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use tracing::debug;

use flowcast_core::error::{FlowError, Result};
use flowcast_core::types::*;

use super::store::GraphStore;

/// Texts shorter than this are treated as empty.
const MIN_TEXT_LEN: usize = 3;

/// Copy the canvas shows in empty text fields.
const PLACEHOLDERS: &[&str] = &[
    "enter a prompt",
    "enter a prompt...",
    "type your prompt here",
    "type your prompt here...",
    "generated text will appear here",
    "waiting for input",
    "waiting for input...",
    "no output yet",
    "untitled",
];

/// One image reachable upstream, keyed by the node that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamImage {
    pub id: NodeId,
    pub image: String,
}

/// Everything a node can consume from its transitive dependencies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamContext {
    /// Ordered top-to-bottom by canvas position, one per source node.
    pub images: Vec<UpstreamImage>,
    /// Most distant ancestor first, nearest last. No duplicates.
    pub texts: Vec<String>,
    /// Structured analysis of the nearest analysis node.
    pub analysis: Option<Value>,
    /// Still frames extracted by upstream video nodes.
    pub frames: Vec<String>,
    /// Finished upstream clips, nearest first. Never part of `images`.
    pub videos: Vec<UpstreamImage>,
    /// Number of links pointing directly at the node.
    pub direct_inputs: usize,
}

impl UpstreamContext {
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    pub fn image_uris(&self) -> Vec<String> {
        self.images.iter().map(|i| i.image.clone()).collect()
    }

    /// Source ids in prompt numbering order ("image 1", "image 2", ...).
    pub fn reference_ids(&self) -> Vec<NodeId> {
        self.images.iter().map(|i| i.id.clone()).collect()
    }

    /// Upstream texts followed by `instruction`, nearest context last.
    pub fn compose_prompt(&self, instruction: Option<&str>) -> String {
        let mut parts: Vec<&str> = self.texts.iter().map(String::as_str).collect();
        if let Some(instruction) = instruction.map(str::trim).filter(|s| !s.is_empty()) {
            if !parts.contains(&instruction) {
                parts.push(instruction);
            }
        }
        parts.join("\n\n")
    }
}

/// Whether `text` carries real content rather than empty-field copy.
pub fn is_meaningful_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_TEXT_LEN {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !PLACEHOLDERS.contains(&lower.as_str())
}

struct Found<'a> {
    node: &'a WorkflowNode,
    depth: usize,
}

/// Gather the upstream context of `node_id`.
///
/// Breadth-first over incoming links, so each ancestor is recorded at its
/// shortest distance and visited once even when reachable along several
/// paths. Any ancestor still loading aborts the collection: its result
/// fields are not trusted.
pub fn collect(store: &GraphStore, node_id: &str) -> Result<UpstreamContext> {
    let target = store.require(node_id)?;

    let mut visited: HashSet<&str> = HashSet::from([target.id.as_str()]);
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
    let mut found: Vec<Found<'_>> = Vec::new();

    for source in store.incoming(&target.id) {
        if visited.insert(source) {
            queue.push_back((source, 1));
        }
    }
    let direct_inputs = store.incoming(&target.id).count();

    while let Some((id, depth)) = queue.pop_front() {
        let Some(node) = store.node(id) else { continue };
        if node.data.loading {
            debug!(node_id, upstream = id, "Upstream node still loading");
            return Err(FlowError::UpstreamNotReady {
                node: id.to_string(),
            });
        }
        found.push(Found { node, depth });
        for source in store.incoming(id) {
            if visited.insert(source) {
                queue.push_back((source, depth + 1));
            }
        }
    }

    let mut ctx = UpstreamContext {
        direct_inputs,
        ..Default::default()
    };

    let mut images: Vec<(&WorkflowNode, String)> = Vec::new();
    let mut texts: Vec<(usize, String)> = Vec::new();
    let mut seen_texts: HashSet<&str> = HashSet::new();

    // `found` is nearest-first, so the first occurrence of anything is the nearest.
    for f in &found {
        let (node, depth) = (f.node, f.depth);
        if let Some(asset) = node.asset() {
            if node.node_type == NodeType::VideoGen {
                ctx.videos.push(UpstreamImage {
                    id: node.id.clone(),
                    image: asset.to_string(),
                });
            } else {
                images.push((node, asset.to_string()));
            }
        }
        if let Some(text) = node.text_value() {
            let text = text.trim();
            if is_meaningful_text(text) && seen_texts.insert(text) {
                texts.push((depth, text.to_string()));
            }
        }
        if node.node_type == NodeType::ImageAnalysis && ctx.analysis.is_none() {
            ctx.analysis = node.data.analysis.clone();
        }
        if node.node_type == NodeType::VideoGen {
            for frame in &node.data.frames {
                if !ctx.frames.contains(frame) {
                    ctx.frames.push(frame.clone());
                }
            }
        }
    }

    texts.sort_by_key(|(depth, _)| Reverse(*depth));
    ctx.texts = texts.into_iter().map(|(_, t)| t).collect();

    images.sort_by(|(a, _), (b, _)| {
        a.position
            .y
            .total_cmp(&b.position.y)
            .then(a.position.x.total_cmp(&b.position.x))
    });
    ctx.images = images
        .into_iter()
        .map(|(node, image)| UpstreamImage {
            id: node.id.clone(),
            image,
        })
        .collect();

    debug!(
        node_id,
        ancestors = found.len(),
        images = ctx.images.len(),
        videos = ctx.videos.len(),
        texts = ctx.texts.len(),
        "Collected upstream context"
    );
    Ok(ctx)
}
