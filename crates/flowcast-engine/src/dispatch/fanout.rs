use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use flowcast_core::error::{FlowError, Result};
use flowcast_core::types::*;
use flowcast_genai::asset::to_data_uri;

use super::formats::closest_aspect_ratio;
use super::resize::fit_to_target;
use super::strategy::{GenerationStrategy, Interpreted};
use super::{DispatchInput, Dispatcher, Progress, ProgressFn};

const VERIFY_INSTRUCTION: &str = "Image 1 is the approved master visual. Image 2 is an \
adaptation of it for a different placement. Answer strictly YES or NO: does image 2 keep the same \
model identity, the same typography and text, and the same product as image 1?";

fn verdict() -> &'static Regex {
    static VERDICT: OnceLock<Regex> = OnceLock::new();
    VERDICT.get_or_init(|| Regex::new(r"(?i)^\W*(yes|no)\b").expect("valid verdict pattern"))
}

/// Whether a fidelity answer accepts the candidate. Only the leading word
/// counts; anything that does not open with yes is a rejection.
pub fn accepts(answer: &str) -> bool {
    verdict()
        .captures(answer)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str().eq_ignore_ascii_case("yes"))
}

/// Shared per-node state of one fan-out run.
struct FanOutJob<'a> {
    node_id: &'a str,
    strategy: &'a dyn GenerationStrategy,
    base: GenerateRequest,
    master: Option<String>,
    verify: bool,
}

impl Dispatcher {
    /// Fill one result slot per format.
    ///
    /// Formats are split into batches of `batch_width`; members of a batch
    /// run concurrently and batches run one after another. Quota exhaustion
    /// in any slot stops the run with a `PartialFailure` that carries every
    /// slot completed so far.
    pub(super) async fn run_fanout(
        &self,
        strategy: &dyn GenerationStrategy,
        input: &DispatchInput,
        base: GenerateRequest,
        formats: Vec<AdFormat>,
        verify: bool,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<FormatOutput>> {
        let job = FanOutJob {
            node_id: &input.node.id,
            strategy,
            master: base.images.first().cloned(),
            base,
            verify,
        };

        let total = formats.len();
        let width = self.fanout.batch_width.max(1);
        let batches: Vec<&[AdFormat]> = formats.chunks(width).collect();
        let mut outputs: Vec<FormatOutput> = Vec::with_capacity(total);

        for (index, batch) in batches.iter().enumerate() {
            info!(
                node_id = %input.node.id,
                batch = index + 1,
                batches = batches.len(),
                size = batch.len(),
                "Starting fan-out batch"
            );
            self.events.publish(EngineEvent::BatchStarted {
                batch: index + 1,
                batches: batches.len(),
                size: batch.len(),
            });
            progress(Progress::Status(format!(
                "Batch {}/{} ({} of {} done)",
                index + 1,
                batches.len(),
                outputs.len(),
                total
            )));

            let results = futures::future::join_all(
                batch.iter().map(|format| self.render_format(&job, format)),
            )
            .await;

            let mut failure = None;
            for result in results {
                match result {
                    Ok(output) => outputs.push(output),
                    Err(e) if failure.is_none() => failure = Some(e),
                    Err(e) => debug!(error = %e, "Additional failure in batch"),
                }
            }

            if let Some(e) = failure {
                if e.is_quota() {
                    warn!(
                        node_id = %input.node.id,
                        completed = outputs.len(),
                        total,
                        "Quota exhausted mid fan-out"
                    );
                    return Err(FlowError::PartialFailure {
                        completed: outputs.len(),
                        total,
                        outputs,
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        }

        Ok(outputs)
    }

    async fn render_format(&self, job: &FanOutJob<'_>, format: &AdFormat) -> Result<FormatOutput> {
        let mut request = job.base.clone();
        request.aspect_ratio = Some(closest_aspect_ratio(format.width, format.height).to_string());
        request.prompt = format!(
            "{}\n\nTarget placement: {} ({}x{} px). Keep every product, person and line of text \
             from the reference; extend or recompose the background to fit.",
            job.base.prompt,
            if format.label.is_empty() { &format.id } else { &format.label },
            format.width,
            format.height
        );

        let mut candidate = self.generate_asset(job.strategy, request.clone()).await?;
        let mut verified = None;

        if job.verify {
            if let Some(master) = job.master.as_deref() {
                let first = self.verify_fidelity(master, &candidate).await;
                verified = first;
                if first == Some(false) {
                    info!(node_id = job.node_id, format = %format.id, "Fidelity check rejected candidate, regenerating once");
                    candidate = self.generate_asset(job.strategy, request).await?;
                    verified = self.verify_fidelity(master, &candidate).await;
                }
            }
        }

        let bytes = self.client.fetch_asset(candidate).await?;
        let png = fit_to_target(&bytes, format.width, format.height, self.fanout.fit_tolerance)?;

        let image = if self.fanout.upload_results {
            self.client
                .upload(
                    format!("{}-{}.png", job.node_id, format.id),
                    "image/png".into(),
                    png,
                )
                .await?
        } else {
            to_data_uri("image/png", &png)
        };

        debug!(node_id = job.node_id, format = %format.id, "Format slot filled");
        Ok(FormatOutput {
            format_id: format.id.clone(),
            width: format.width,
            height: format.height,
            image,
            verified,
        })
    }

    async fn generate_asset(
        &self,
        strategy: &dyn GenerationStrategy,
        request: GenerateRequest,
    ) -> Result<String> {
        let response = self.client.generate(request).await?;
        match strategy.interpret_response(response)? {
            Interpreted::Asset(url) => Ok(url),
            other => Err(FlowError::Transport(format!(
                "expected an image for a format slot, got {:?}",
                other
            ))),
        }
    }

    /// Strict yes/no comparison of master and candidate. `None` when the
    /// check itself could not run; the candidate is then accepted unverified.
    async fn verify_fidelity(&self, master: &str, candidate: &str) -> Option<bool> {
        let request = GenerateRequest {
            prompt: VERIFY_INSTRUCTION.to_string(),
            model: self.models.verify.clone(),
            images: vec![master.to_string(), candidate.to_string()],
            aspect_ratio: None,
            temperature: Some(0.0),
            prefer_text: true,
        };
        match self.client.generate(request).await {
            Ok(response) => {
                let answer = response.text.unwrap_or_default();
                Some(accepts(&answer))
            }
            Err(e) => {
                warn!(error = %e, "Fidelity check failed, accepting candidate unverified");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use image::GenericImageView;

    use flowcast_core::config::AppConfig;
    use flowcast_core::event::EventBus;
    use flowcast_test_utils::{decode_data_uri, png_data_uri, MockGenerationClient, MockStitcher};

    use super::*;
    use crate::dispatch::NodeOutcome;
    use crate::graph::{UpstreamContext, UpstreamImage};

    fn fanout_input(node_type: NodeType, formats: Vec<AdFormat>) -> DispatchInput {
        let mut node = WorkflowNode::new("ads", node_type).with_prompt("Adapt the key visual");
        node.data.formats = formats;
        DispatchInput {
            instruction: node.data.prompt.clone(),
            node,
            context: UpstreamContext {
                images: vec![UpstreamImage {
                    id: "master".into(),
                    image: png_data_uri(64, 64, [0, 0, 0, 255]),
                }],
                direct_inputs: 1,
                ..Default::default()
            },
        }
    }

    fn formats(count: usize) -> Vec<AdFormat> {
        (0..count)
            .map(|i| AdFormat::new(format!("f{}", i), "", 100, 100 + 50 * i as u32))
            .collect()
    }

    fn dispatcher(mock: Arc<MockGenerationClient>, config: &AppConfig, events: Arc<EventBus>) -> Dispatcher {
        Dispatcher::new(mock, Arc::new(MockStitcher::ok()), config, events)
    }

    fn ignore(_: Progress) {}

    fn quota() -> FlowError {
        FlowError::Quota {
            attempts: 1,
            message: "RESOURCE_EXHAUSTED".into(),
        }
    }

    #[test]
    fn test_verdicts() {
        assert!(accepts("YES"));
        assert!(accepts("Yes, identical."));
        assert!(accepts("YES - no differences in the product."));
        assert!(accepts("**Yes**, nothing changed"));
        assert!(!accepts("No"));
        assert!(!accepts("No."));
        assert!(!accepts("  no, the typography differs"));
        assert!(!accepts("Yesterday's version matched"));
        assert!(!accepts("unclear"));
        assert!(!accepts(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_formats_in_five_batches_of_two() {
        let mock = Arc::new(MockGenerationClient::new().with_latency(Duration::from_millis(500)));
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let d = dispatcher(mock.clone(), &AppConfig::default(), events);

        let out = d
            .dispatch(fanout_input(NodeType::AdFormats, formats(10)), &ignore)
            .await
            .unwrap();

        let NodeOutcome::Formats(outputs) = out else {
            panic!("expected formats");
        };
        assert_eq!(outputs.len(), 10);
        assert_eq!(mock.generate_calls().len(), 10);
        assert!(mock.max_in_flight() <= 2);

        let mut batches = 0;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::BatchStarted { size, .. } = event {
                assert_eq!(size, 2);
                batches += 1;
            }
        }
        assert_eq!(batches, 5);

        for (slot, format) in outputs.iter().zip(formats(10)) {
            assert_eq!(slot.format_id, format.id);
            assert_eq!(
                decode_data_uri(&slot.image).dimensions(),
                (format.width, format.height)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_keeps_completed_slots() {
        let mock = Arc::new(MockGenerationClient::new());
        // First batch succeeds; the second batch's first slot exhausts quota.
        mock.push_response(Ok(GenerateResponse::image(png_data_uri(32, 32, [9, 9, 9, 255]))));
        mock.push_response(Ok(GenerateResponse::image(png_data_uri(32, 32, [9, 9, 9, 255]))));
        for _ in 0..10 {
            mock.push_response(Err(quota()));
        }
        let mut config = AppConfig::default();
        config.retry.max_attempts = 2;
        config.retry.cooldown_secs = 1;
        let d = dispatcher(mock.clone(), &config, Arc::new(EventBus::default()));

        let err = d
            .dispatch(fanout_input(NodeType::AdFormats, formats(4)), &ignore)
            .await
            .unwrap_err();
        match err {
            FlowError::PartialFailure {
                completed,
                total,
                outputs,
                ..
            } => {
                assert_eq!(completed, 2);
                assert_eq!(total, 4);
                assert_eq!(outputs.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_candidate_regenerates_once() {
        let mock = Arc::new(MockGenerationClient::new());
        let verdicts = Arc::new(std::sync::Mutex::new(vec!["YES", "NO"]));
        let v = verdicts.clone();
        mock.respond_with(move |req| {
            if req.prefer_text {
                let answer = v.lock().unwrap().pop().unwrap_or("YES");
                Ok(GenerateResponse::text(answer))
            } else {
                Ok(GenerateResponse::image(png_data_uri(40, 80, [5, 5, 5, 255])))
            }
        });
        let d = dispatcher(mock.clone(), &AppConfig::default(), Arc::new(EventBus::default()));

        let out = d
            .dispatch(
                fanout_input(NodeType::VerticalSuite, vec![AdFormat::new("story", "Story", 90, 160)]),
                &ignore,
            )
            .await
            .unwrap();

        let NodeOutcome::Formats(outputs) = out else {
            panic!("expected formats");
        };
        assert_eq!(outputs[0].verified, Some(true));
        let calls = mock.generate_calls();
        let images = calls.iter().filter(|c| !c.prefer_text).count();
        let checks = calls.iter().filter(|c| c.prefer_text).count();
        assert_eq!(images, 2);
        assert_eq!(checks, 2);
        assert_eq!(calls[1].images.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_results_when_configured() {
        let mock = Arc::new(MockGenerationClient::new());
        let mut config = AppConfig::default();
        config.fanout.upload_results = true;
        let d = dispatcher(mock.clone(), &config, Arc::new(EventBus::default()));

        let out = d
            .dispatch(fanout_input(NodeType::AdFormats, formats(1)), &ignore)
            .await
            .unwrap();
        let NodeOutcome::Formats(outputs) = out else {
            panic!("expected formats");
        };
        assert_eq!(outputs[0].image, "https://cdn.test/uploads/0-ads-f0.png");
        assert_eq!(mock.uploads().len(), 1);
    }
}
