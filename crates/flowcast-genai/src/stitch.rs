use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info};

use flowcast_core::error::{FlowError, Result};
use flowcast_core::traits::{GenerationClient, Stitcher};

/// Concatenates clips with `ffmpeg -f concat` and uploads the result.
pub struct FfmpegStitcher {
    client: Arc<dyn GenerationClient>,
    ffmpeg: String,
}

impl FfmpegStitcher {
    pub fn new(client: Arc<dyn GenerationClient>, ffmpeg: impl Into<String>) -> Self {
        Self {
            client,
            ffmpeg: ffmpeg.into(),
        }
    }

    async fn stitch_in(&self, dir: &Path, clips: Vec<String>) -> Result<String> {
        let mut list = String::new();
        for (i, clip) in clips.into_iter().enumerate() {
            let bytes = self
                .client
                .fetch_asset(clip)
                .await
                .map_err(|e| FlowError::Stitch(format!("fetching clip {}: {}", i + 1, e)))?;
            let path = dir.join(format!("clip-{:03}.mp4", i));
            tokio::fs::write(&path, bytes).await?;
            list.push_str(&format!("file '{}'\n", path.display()));
        }

        let list_path = dir.join("clips.txt");
        tokio::fs::write(&list_path, list).await?;
        let out_path = dir.join("stitched.mp4");

        let output = Command::new(&self.ffmpeg)
            .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(&out_path)
            .output()
            .await
            .map_err(|e| FlowError::Stitch(format!("failed to spawn {}: {}", self.ffmpeg, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Stitch(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::read(&out_path).await?;
        debug!(bytes = bytes.len(), "Stitched video ready");

        self.client
            .upload("stitched.mp4".into(), "video/mp4".into(), bytes)
            .await
            .map_err(|e| FlowError::Stitch(format!("uploading stitched video: {}", e)))
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("flowcast-stitch-{}", uuid::Uuid::new_v4()))
}

impl Stitcher for FfmpegStitcher {
    fn stitch(&self, clips: Vec<String>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let count = clips.len();
            let dir = scratch_dir();
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| FlowError::Stitch(format!("creating scratch dir: {}", e)))?;

            let result = self.stitch_in(&dir, clips).await;
            let _ = tokio::fs::remove_dir_all(&dir).await;

            let url = result.map_err(|e| match e {
                FlowError::Stitch(_) => e,
                other => FlowError::Stitch(other.to_string()),
            })?;
            info!(clips = count, "Clips stitched");
            Ok(url)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_test_utils::MockGenerationClient;

    #[tokio::test]
    async fn test_missing_binary_is_stitch_error() {
        let mock = Arc::new(MockGenerationClient::new());
        let stitcher = FfmpegStitcher::new(mock, "/nonexistent/ffmpeg-binary");
        let err = stitcher
            .stitch(vec![
                "data:video/mp4;base64,AAAA".into(),
                "data:video/mp4;base64,AAAA".into(),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Stitch(_)));
    }
}
