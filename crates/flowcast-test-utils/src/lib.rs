//! Test doubles and fixtures shared by the Flowcast crates.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use image::{ImageFormat, Rgba, RgbaImage};

use flowcast_core::error::{FlowError, Result};
use flowcast_core::traits::{GenerationClient, SnapshotSink, Stitcher};
use flowcast_core::types::*;

pub type Responder = Arc<dyn Fn(&GenerateRequest) -> Result<GenerateResponse> + Send + Sync>;

/// Scripted generation collaborator.
///
/// `generate` pops queued responses first, then falls back to the responder,
/// then to a default: `"YES"` for text requests, a 64x64 PNG otherwise.
/// Operation statuses are queued per id; an empty queue reports done with a
/// video URL.
pub struct MockGenerationClient {
    scripted: Mutex<VecDeque<Result<GenerateResponse>>>,
    responder: Mutex<Option<Responder>>,
    operations: Mutex<HashMap<String, VecDeque<Result<OperationStatus>>>>,
    latency: Duration,
    calls: Mutex<Vec<GenerateRequest>>,
    polls: AtomicUsize,
    uploads: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGenerationClient {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
            operations: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulated time each `generate` call stays in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_response(&self, response: Result<GenerateResponse>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&GenerateRequest) -> Result<GenerateResponse> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn push_operation(&self, operation_id: &str, status: Result<OperationStatus>) {
        self.operations
            .lock()
            .unwrap()
            .entry(operation_id.to_string())
            .or_default()
            .push_back(status);
    }

    pub fn generate_calls(&self) -> Vec<GenerateRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Prompts of all `generate` calls, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.prompt.clone())
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
            return scripted;
        }
        let responder = self.responder.lock().unwrap().clone();
        if let Some(responder) = responder {
            return responder(request);
        }
        if request.prefer_text {
            Ok(GenerateResponse::text("YES"))
        } else {
            Ok(GenerateResponse::image(png_data_uri(64, 64, [200, 30, 30, 255])))
        }
    }
}

impl Default for MockGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClient for MockGenerationClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<GenerateResponse>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let response = self.next_response(&request);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            response
        })
    }

    fn operation_status(&self, operation_id: String) -> BoxFuture<'_, Result<OperationStatus>> {
        Box::pin(async move {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let queued = self
                .operations
                .lock()
                .unwrap()
                .get_mut(&operation_id)
                .and_then(|q| q.pop_front());
            queued.unwrap_or_else(|| {
                Ok(OperationStatus {
                    done: true,
                    response: Some(serde_json::json!({
                        "video": { "uri": format!("https://cdn.test/{}.mp4", operation_id) }
                    })),
                    error: None,
                })
            })
        })
    }

    fn upload(
        &self,
        file_name: String,
        _mime: String,
        _bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut uploads = self.uploads.lock().unwrap();
            let url = format!("https://cdn.test/uploads/{}-{}", uploads.len(), file_name);
            uploads.push(url.clone());
            Ok(url)
        })
    }

    fn fetch_asset(&self, uri: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let payload = uri
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(";base64,"))
                .map(|(_, payload)| payload)
                .ok_or_else(|| FlowError::Transport(format!("mock cannot fetch {}", uri)))?;
            STANDARD
                .decode(payload)
                .map_err(|e| FlowError::Transport(e.to_string()))
        })
    }
}

/// Stitcher that joins clip URLs, or fails on demand.
pub struct MockStitcher {
    fail: bool,
    calls: AtomicUsize,
}

impl MockStitcher {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Stitcher for MockStitcher {
    fn stitch(&self, clips: Vec<String>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FlowError::Stitch("mock stitcher failure".into()));
            }
            Ok(format!("https://cdn.test/stitched-{}-clips.mp4", clips.len()))
        })
    }
}

/// Snapshot sink that records everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    snapshots: Mutex<Vec<GraphSnapshot>>,
    balances: Mutex<Vec<u64>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<GraphSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn balances(&self) -> Vec<u64> {
        self.balances.lock().unwrap().clone()
    }
}

impl SnapshotSink for RecordingSink {
    fn persist(&self, snapshot: GraphSnapshot) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.snapshots.lock().unwrap().push(snapshot);
            Ok(())
        })
    }

    fn persist_credits(&self, balance: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.balances.lock().unwrap().push(balance);
            Ok(())
        })
    }
}

/// Solid-colour PNG encoded as a data URI.
pub fn png_data_uri(width: u32, height: u32, rgba: [u8; 4]) -> String {
    let img = RgbaImage::from_pixel(width, height, Rgba(rgba));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("encode test png");
    format!("data:image/png;base64,{}", STANDARD.encode(buf.into_inner()))
}

/// Decode a PNG data URI back into an image.
pub fn decode_data_uri(uri: &str) -> image::DynamicImage {
    let payload = uri
        .split_once(";base64,")
        .map(|(_, p)| p)
        .expect("base64 data URI");
    let bytes = STANDARD.decode(payload).expect("valid base64");
    image::load_from_memory(&bytes).expect("decodable image")
}

/// Graph fixtures.
pub mod fixtures {
    use super::*;

    /// `A(image source) -> B(analysis) -> C(image gen)`.
    pub fn analysis_chain() -> GraphSnapshot {
        GraphSnapshot {
            nodes: vec![
                WorkflowNode::new("A", NodeType::ImageSource)
                    .with_output(png_data_uri(32, 32, [10, 120, 200, 255]))
                    .at(0.0, 0.0),
                WorkflowNode::new("B", NodeType::ImageAnalysis)
                    .with_prompt("Describe the product")
                    .at(300.0, 0.0),
                WorkflowNode::new("C", NodeType::ImageGen)
                    .with_prompt("Hero shot on a beach")
                    .at(600.0, 0.0),
            ],
            edges: vec![DependencyLink::new("A", "B"), DependencyLink::new("B", "C")],
        }
    }

    /// An image source feeding an ad-format node with `count` square-ish formats.
    pub fn ad_fanout(count: usize) -> GraphSnapshot {
        let mut fanout = WorkflowNode::new("ads", NodeType::AdFormats)
            .with_prompt("Adapt the key visual")
            .at(300.0, 0.0);
        fanout.data.formats = (0..count)
            .map(|i| AdFormat::new(format!("f{}", i), format!("Format {}", i), 100, 100 + i as u32))
            .collect();
        GraphSnapshot {
            nodes: vec![
                WorkflowNode::new("master", NodeType::ImageSource)
                    .with_output(png_data_uri(64, 64, [0, 0, 0, 255])),
                fanout,
            ],
            edges: vec![DependencyLink::new("master", "ads")],
        }
    }
}
