pub mod attachment;
pub mod message;
pub mod pagination;
pub mod session;

pub use attachment::{encode_image_bytes, encode_image_file};
pub use message::{
    ImageAttachment, Message, MessageId, ReplyState, ReplyTransition, ReplyTransitionRejection,
    ReplyTransitionResult, Sender, decode_log, encode_log,
};
pub use pagination::{HistoryWindow, LoadMoreRejection, PageTicket};
pub use session::{ChatSession, SessionConfig, SessionError, SessionEvent, SubmitRejection};
