use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Generation collaborator: the external AI service behind `generate`, `operation` and `upload`.
pub trait GenerationClient: Send + Sync + 'static {
    /// Submit a generation request. Returns either a terminal result or an operation token.
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<GenerateResponse>>;

    /// Check the status of a long-running operation.
    fn operation_status(&self, operation_id: String) -> BoxFuture<'_, Result<OperationStatus>>;

    /// Upload a file and return its public URL.
    fn upload(
        &self,
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String>>;

    /// Resolve an asset reference (URL or data URI) to raw bytes.
    fn fetch_asset(&self, uri: String) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Joins per-clip video results into a single asset.
pub trait Stitcher: Send + Sync + 'static {
    fn stitch(&self, clips: Vec<String>) -> BoxFuture<'_, Result<String>>;
}

/// Persistence collaborator for graph snapshots.
pub trait SnapshotSink: Send + Sync + 'static {
    /// Store a stripped `{nodes, edges}` snapshot.
    fn persist(&self, snapshot: GraphSnapshot) -> BoxFuture<'_, Result<()>>;

    /// Store the credit balance.
    fn persist_credits(&self, balance: u64) -> BoxFuture<'_, Result<()>> {
        let _ = balance;
        Box::pin(async { Ok(()) })
    }
}
