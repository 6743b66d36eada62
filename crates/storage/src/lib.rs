pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::ChatroomId;
pub use sqlite::SqliteStorage;
pub use types::{ChatroomRecord, DEFAULT_CHATROOM_TITLE, NewChatroom};

pub trait ChatroomStore: Send + Sync {
    fn create_chatroom(&self, input: NewChatroom) -> StorageResult<ChatroomRecord>;
    fn list_chatrooms(&self) -> StorageResult<Vec<ChatroomRecord>>;
    fn get_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<Option<ChatroomRecord>>;
    fn rename_chatroom(&self, chatroom_id: ChatroomId, title: &str)
    -> StorageResult<ChatroomRecord>;
    /// Removes the chatroom and its persisted log. Idempotent: deleting an
    /// unknown id is a no-op.
    fn delete_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<()>;
}

/// Key-value access to the serialized message log, one record per chatroom.
///
/// The store never interprets the log payload; (de)serialization belongs to
/// the session layer.
pub trait MessageLogStore: Send + Sync {
    fn load_log(&self, chatroom_id: ChatroomId) -> StorageResult<Option<String>>;
    fn save_log(&self, chatroom_id: ChatroomId, log: &str) -> StorageResult<()>;
    fn delete_log(&self, chatroom_id: ChatroomId) -> StorageResult<()>;
}

pub trait ChatStorage: ChatroomStore + MessageLogStore {}

impl<T> ChatStorage for T where T: ChatroomStore + MessageLogStore {}
