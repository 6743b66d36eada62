use super::ids::ChatroomId;

/// Default chatroom title used when callers pass a blank one.
pub const DEFAULT_CHATROOM_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatroomRecord {
    pub id: ChatroomId,
    pub title: String,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatroom {
    pub title: String,
}

impl NewChatroom {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}
