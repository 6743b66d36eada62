use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::generator::{
    EmptyReplyTemplateSnafu, GeneratorResult, GeneratorWorker, ReplyEvent, ReplyEventPayload,
    ReplyGenerator, ReplyHandle, ReplyRequest, ReplyTarget, make_event_stream,
};

pub const DEFAULT_REPLY_TEMPLATE: &str = "This is a simulated Gemini AI reply!";

/// Produces a canned reply after a fixed delay. Stands in for a real model
/// backend behind the same generate seam.
#[derive(Debug, Clone)]
pub struct SimulatedReplyGenerator {
    delay: Duration,
    template: String,
}

impl SimulatedReplyGenerator {
    pub fn new(delay: Duration, template: impl Into<String>) -> GeneratorResult<Self> {
        let template = template.into();
        ensure!(
            !template.trim().is_empty(),
            EmptyReplyTemplateSnafu {
                stage: "simulated-generator-new",
            }
        );

        Ok(Self { delay, template })
    }

    pub fn with_default_template(delay: Duration) -> Self {
        Self {
            delay,
            template: DEFAULT_REPLY_TEMPLATE.to_string(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    async fn run_reply_worker(
        delay: Duration,
        template: String,
        target: ReplyTarget,
        event_tx: mpsc::UnboundedSender<ReplyEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "reply generation cancelled before delivery");
            }
            _ = tokio::time::sleep(delay) => {
                let _ = event_tx.send(ReplyEvent {
                    target,
                    payload: ReplyEventPayload::Reply(template),
                });
            }
        }
    }
}

impl ReplyGenerator for SimulatedReplyGenerator {
    fn generate(&self, request: ReplyRequest) -> GeneratorResult<ReplyHandle> {
        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: GeneratorWorker = Box::pin(Self::run_reply_worker(
            self.delay,
            self.template.clone(),
            request.target,
            event_tx,
            cancel_rx,
        ));

        Ok(ReplyHandle { stream, worker })
    }
}
