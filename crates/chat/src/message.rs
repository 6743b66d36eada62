use parley_reply::ReplyTarget;
use serde::{Deserialize, Serialize};

/// Chat speaker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "ai")]
    Agent,
}

/// Stable identifier for one message, derived from its submission instant in
/// unix milliseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

/// Inline image payload carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub base64_data: String,
}

impl ImageAttachment {
    /// Renders the attachment as a `data:` URL suitable for inline display.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_data)
    }
}

/// Core immutable message model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<ImageAttachment>,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender: Sender,
        content: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            timestamp_ms,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: ImageAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Serializes a full message log for durable storage.
pub fn encode_log(messages: &[Message]) -> serde_json::Result<String> {
    serde_json::to_string(messages)
}

/// Deserializes a stored message log. Callers decide how to handle a
/// malformed payload.
pub fn decode_log(log: &str) -> serde_json::Result<Vec<Message>> {
    serde_json::from_str(log)
}

/// Reply lifecycle boundary for session orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyState {
    #[default]
    Idle,
    Pending(ReplyTarget),
    Delivered(ReplyTarget),
    Failed {
        target: ReplyTarget,
        message: String,
    },
    Cancelled(ReplyTarget),
}

/// State transition input for the reply lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTransition {
    Begin(ReplyTarget),
    Deliver(ReplyTarget),
    Fail {
        target: ReplyTarget,
        message: String,
    },
    Cancel(ReplyTarget),
    ResetToIdle,
}

/// Rejection reason for illegal reply transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTransitionRejection {
    AlreadyPending {
        active: ReplyTarget,
        attempted: ReplyTarget,
    },
    NoPendingReply,
    TicketMismatch {
        active: ReplyTarget,
        attempted: ReplyTarget,
    },
}

/// Result type for reply transition application.
pub type ReplyTransitionResult = Result<ReplyState, ReplyTransitionRejection>;

impl ReplyState {
    /// Returns the active target if and only if a reply is pending.
    pub fn active_target(&self) -> Option<ReplyTarget> {
        match self {
            Self::Pending(target) => Some(*target),
            Self::Idle | Self::Delivered(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    /// Returns true when an incoming reply event matches the pending ticket.
    pub fn accepts_reply_event(&self, target: ReplyTarget) -> bool {
        matches!(self, Self::Pending(active) if *active == target)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-pending states may begin a new reply directly. Any terminal
    /// transition (`Deliver`/`Fail`/`Cancel`) must match the pending ticket
    /// exactly.
    pub fn apply(&self, transition: ReplyTransition) -> ReplyTransitionResult {
        match transition {
            ReplyTransition::Begin(target) => self.apply_begin(target),
            ReplyTransition::Deliver(target) => self.apply_deliver(target),
            ReplyTransition::Fail { target, message } => self.apply_fail(target, message),
            ReplyTransition::Cancel(target) => self.apply_cancel(target),
            ReplyTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_begin(&self, target: ReplyTarget) -> ReplyTransitionResult {
        match self {
            Self::Pending(active) if *active != target => {
                Err(ReplyTransitionRejection::AlreadyPending {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Pending(_) => Ok(self.clone()),
            Self::Idle | Self::Delivered(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Ok(Self::Pending(target))
            }
        }
    }

    fn apply_deliver(&self, target: ReplyTarget) -> ReplyTransitionResult {
        match self {
            Self::Pending(active) if *active == target => Ok(Self::Delivered(target)),
            Self::Pending(active) => Err(ReplyTransitionRejection::TicketMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Delivered(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(ReplyTransitionRejection::NoPendingReply)
            }
        }
    }

    fn apply_fail(&self, target: ReplyTarget, message: String) -> ReplyTransitionResult {
        match self {
            Self::Pending(active) if *active == target => Ok(Self::Failed { target, message }),
            Self::Pending(active) => Err(ReplyTransitionRejection::TicketMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Delivered(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(ReplyTransitionRejection::NoPendingReply)
            }
        }
    }

    fn apply_cancel(&self, target: ReplyTarget) -> ReplyTransitionResult {
        match self {
            Self::Pending(active) if *active == target => Ok(Self::Cancelled(target)),
            Self::Pending(active) => Err(ReplyTransitionRejection::TicketMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Delivered(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(ReplyTransitionRejection::NoPendingReply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_reply::ReplyTicket;
    use parley_storage::ChatroomId;

    fn target(ticket: u64) -> ReplyTarget {
        ReplyTarget {
            chatroom_id: ChatroomId::new_v7(),
            ticket: ReplyTicket(ticket),
        }
    }

    #[test]
    fn log_round_trips_with_attachment() {
        let messages = vec![
            Message::new(MessageId::new(1_700_000_000_000), Sender::User, "hi", 1_700_000_000_000),
            Message::new(
                MessageId::new(1_700_000_001_200),
                Sender::Agent,
                "hello back",
                1_700_000_001_200,
            )
            .with_attachment(ImageAttachment {
                mime_type: "image/png".to_string(),
                base64_data: "aGVsbG8=".to_string(),
            }),
        ];

        let encoded = encode_log(&messages).expect("encode");
        let decoded = decode_log(&encoded).expect("decode");
        assert_eq!(decoded, messages);
    }

    #[test]
    fn sender_uses_compact_wire_names() {
        let encoded = serde_json::to_string(&Sender::Agent).expect("encode");
        assert_eq!(encoded, "\"ai\"");
        let decoded: Sender = serde_json::from_str("\"user\"").expect("decode");
        assert_eq!(decoded, Sender::User);
    }

    #[test]
    fn malformed_log_is_an_error() {
        assert!(decode_log("not json").is_err());
        assert!(decode_log("{\"id\":1}").is_err());
    }

    #[test]
    fn attachment_renders_data_url() {
        let attachment = ImageAttachment {
            mime_type: "image/png".to_string(),
            base64_data: "aGVsbG8=".to_string(),
        };
        assert_eq!(attachment.data_url(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn begin_from_idle_then_deliver() {
        let first = target(1);
        let state = ReplyState::Idle
            .apply(ReplyTransition::Begin(first))
            .expect("begin");
        assert_eq!(state, ReplyState::Pending(first));
        assert!(state.accepts_reply_event(first));

        let delivered = state
            .apply(ReplyTransition::Deliver(first))
            .expect("deliver");
        assert_eq!(delivered, ReplyState::Delivered(first));
        assert_eq!(delivered.active_target(), None);
    }

    #[test]
    fn begin_while_pending_is_rejected() {
        let first = target(1);
        let second = target(2);
        let state = ReplyState::Pending(first);

        let rejection = state
            .apply(ReplyTransition::Begin(second))
            .expect_err("distinct begin must be rejected");
        assert_eq!(
            rejection,
            ReplyTransitionRejection::AlreadyPending {
                active: first,
                attempted: second,
            }
        );

        // Re-beginning the same target is a no-op.
        assert_eq!(
            state.apply(ReplyTransition::Begin(first)).expect("same"),
            ReplyState::Pending(first)
        );
    }

    #[test]
    fn stale_terminal_transitions_are_rejected() {
        let active = target(2);
        let stale = target(1);
        let state = ReplyState::Pending(active);

        assert_eq!(
            state
                .apply(ReplyTransition::Deliver(stale))
                .expect_err("stale deliver"),
            ReplyTransitionRejection::TicketMismatch {
                active,
                attempted: stale,
            }
        );
        assert!(!state.accepts_reply_event(stale));

        assert_eq!(
            ReplyState::Idle
                .apply(ReplyTransition::Deliver(stale))
                .expect_err("deliver without pending"),
            ReplyTransitionRejection::NoPendingReply
        );
    }

    #[test]
    fn cancel_and_fail_are_terminal() {
        let active = target(3);
        let cancelled = ReplyState::Pending(active)
            .apply(ReplyTransition::Cancel(active))
            .expect("cancel");
        assert_eq!(cancelled, ReplyState::Cancelled(active));

        let failed = ReplyState::Pending(active)
            .apply(ReplyTransition::Fail {
                target: active,
                message: "boom".to_string(),
            })
            .expect("fail");
        assert!(matches!(failed, ReplyState::Failed { .. }));

        // Terminal states reset to idle and accept a fresh begin.
        let reset = failed.apply(ReplyTransition::ResetToIdle).expect("reset");
        assert_eq!(reset, ReplyState::Idle);
    }
}
