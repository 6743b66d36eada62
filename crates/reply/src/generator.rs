use std::future::Future;
use std::pin::Pin;

use parley_storage::ChatroomId;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Session-scoped sequence number distinguishing one reply attempt from the
/// next within the same chatroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyTicket(pub u64);

impl std::fmt::Display for ReplyTicket {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identity a reply event carries back so consumers can tell whether it still
/// belongs to the conversation they are showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub chatroom_id: ChatroomId,
    pub ticket: ReplyTicket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub target: ReplyTarget,
    pub trigger_content: String,
}

impl ReplyRequest {
    pub fn new(target: ReplyTarget, trigger_content: impl Into<String>) -> Self {
        Self {
            target,
            trigger_content: trigger_content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEventPayload {
    Reply(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEvent {
    pub target: ReplyTarget,
    pub payload: ReplyEventPayload,
}

pub type GeneratorWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type GeneratorResult<T> = Result<T, GeneratorError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GeneratorError {
    #[snafu(display("reply template is blank"))]
    EmptyReplyTemplate { stage: &'static str },
}

pub struct ReplyEventStream {
    target: ReplyTarget,
    events: mpsc::UnboundedReceiver<ReplyEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A stream of reply events plus the worker future that produces them. The
/// caller decides where the worker runs.
pub struct ReplyHandle {
    pub stream: ReplyEventStream,
    pub worker: GeneratorWorker,
}

impl ReplyEventStream {
    pub(crate) fn new(
        target: ReplyTarget,
        events: mpsc::UnboundedReceiver<ReplyEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> ReplyTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<ReplyEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReplyEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ReplyEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait ReplyGenerator: Send + Sync {
    fn generate(&self, request: ReplyRequest) -> GeneratorResult<ReplyHandle>;
}

pub(crate) fn make_event_stream(
    target: ReplyTarget,
) -> (
    mpsc::UnboundedSender<ReplyEvent>,
    ReplyEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ReplyEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
