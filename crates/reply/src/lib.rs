mod generator;
mod simulated;

pub use generator::{
    GeneratorError, GeneratorResult, GeneratorWorker, ReplyEvent, ReplyEventPayload,
    ReplyEventStream, ReplyGenerator, ReplyHandle, ReplyRequest, ReplyTarget, ReplyTicket,
};
pub use simulated::{DEFAULT_REPLY_TEMPLATE, SimulatedReplyGenerator};
