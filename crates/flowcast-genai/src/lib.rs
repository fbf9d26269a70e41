pub mod asset;
pub mod client;
pub mod poller;
pub mod retry;
pub mod stitch;

use std::sync::Arc;

use flowcast_core::config::AppConfig;
use flowcast_core::error::Result;
use flowcast_core::traits::GenerationClient;

pub use client::HttpGenerationClient;
pub use poller::{OperationPoller, PollState};
pub use retry::{QuotaRetry, RetryingClient};
pub use stitch::FfmpegStitcher;

/// Create the HTTP generation client described by the config.
pub fn create_client(config: &AppConfig) -> Result<Arc<dyn GenerationClient>> {
    Ok(Arc::new(HttpGenerationClient::new(config.backend.clone())?))
}
