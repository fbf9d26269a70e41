use std::time::Duration;

use tracing::{info, warn};

use flowcast_core::error::{FlowError, Result};

use super::strategy::{GenerationStrategy, Interpreted};
use super::{DispatchInput, Dispatcher, NodeOutcome, Progress, ProgressFn};

impl Dispatcher {
    /// Generate `count` clips one after another, then stitch them.
    ///
    /// Clips are spaced by the inter-clip delay to stay under the
    /// collaborator's rate window. A stitch failure keeps the clips and
    /// promotes the first one to the node output.
    pub(super) async fn run_clips(
        &self,
        strategy: &dyn GenerationStrategy,
        input: &DispatchInput,
        count: u32,
        progress: ProgressFn<'_>,
    ) -> Result<NodeOutcome> {
        let base = strategy.build_request(input, &self.models);
        let mut clips = Vec::with_capacity(count as usize);

        for index in 1..=count {
            if index > 1 {
                let delay = Duration::from_secs(self.video.inter_clip_delay_secs);
                progress(Progress::Status(format!(
                    "Waiting {}s before clip {}/{}",
                    delay.as_secs(),
                    index,
                    count
                )));
                tokio::time::sleep(delay).await;
            }

            progress(Progress::Status(format!("Generating clip {}/{}", index, count)));
            let mut request = base.clone();
            if count > 1 {
                request.prompt = format!("{}\n\n(Part {} of {} of a continuous sequence.)", base.prompt, index, count);
            }

            match self.request(strategy, request, progress).await? {
                Interpreted::Asset(url) => clips.push(url),
                other => {
                    return Err(FlowError::Transport(format!(
                        "video request returned {:?} instead of a clip",
                        other
                    )))
                }
            }
        }

        let first = clips
            .first()
            .cloned()
            .ok_or_else(|| FlowError::Transport("no clips generated".into()))?;
        if clips.len() == 1 {
            return Ok(NodeOutcome::Video {
                output: first,
                clips,
                stitch_error: None,
            });
        }

        progress(Progress::Status(format!("Stitching {} clips", clips.len())));
        match self.stitcher.stitch(clips.clone()).await {
            Ok(output) => {
                info!(node_id = %input.node.id, clips = clips.len(), "Clips stitched");
                Ok(NodeOutcome::Video {
                    output,
                    clips,
                    stitch_error: None,
                })
            }
            Err(e) => {
                warn!(node_id = %input.node.id, error = %e, "Stitching failed, keeping individual clips");
                Ok(NodeOutcome::Video {
                    output: first,
                    clips,
                    stitch_error: Some(e.to_string()),
                })
            }
        }
    }
}
