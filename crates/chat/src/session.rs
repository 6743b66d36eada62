use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_reply::{
    ReplyEvent, ReplyEventPayload, ReplyGenerator, ReplyHandle, ReplyRequest, ReplyTarget,
    ReplyTicket,
};
use parley_storage::{ChatStorage, ChatroomId};

use crate::message::{
    ImageAttachment, Message, MessageId, ReplyState, ReplyTransition, Sender, decode_log,
    encode_log,
};
use crate::pagination::{HistoryWindow, LoadMoreRejection, PageTicket};

/// Tunables for one chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub page_size: usize,
    pub page_delay: Duration,
    pub seed_pages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            page_delay: Duration::from_millis(800),
            seed_pages: 5,
        }
    }
}

/// Asynchronous work completions routed back into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PageDelayElapsed {
        chatroom_id: ChatroomId,
        ticket: PageTicket,
    },
    Reply(ReplyEvent),
}

/// Rejection reason for a message submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    EmptyMessage,
    ReplyPending,
    NoActiveChatroom,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("no chatroom is open"))]
    NoActiveChatroom { stage: &'static str },
    #[snafu(display("history load rejected: {rejection:?}"))]
    LoadMoreRejected {
        stage: &'static str,
        rejection: LoadMoreRejection,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

struct ActiveChatroom {
    id: ChatroomId,
    window: HistoryWindow,
    reply_state: ReplyState,
}

/// Orchestrates one open chatroom: paginated history, optimistic submission,
/// delayed reply delivery, and durable log persistence.
///
/// All mutation happens on the owning task; background work communicates
/// exclusively through the session event channel, and every completion
/// carries enough identity to be dropped if the session has moved on.
pub struct ChatSession {
    store: Arc<dyn ChatStorage>,
    generator: Arc<dyn ReplyGenerator>,
    config: SessionConfig,
    active: Option<ActiveChatroom>,
    next_reply_ticket: u64,
    next_page_ticket: u64,
    last_message_id_ms: i64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    reply_worker: Option<JoinHandle<()>>,
    reply_reader: Option<JoinHandle<()>>,
    page_task: Option<JoinHandle<()>>,
    persistence_degraded: bool,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn ChatStorage>,
        generator: Arc<dyn ReplyGenerator>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            generator,
            config,
            active: None,
            next_reply_ticket: 0,
            next_page_ticket: 0,
            last_message_id_ms: 0,
            events_tx,
            events_rx,
            reply_worker: None,
            reply_reader: None,
            page_task: None,
            persistence_degraded: false,
        }
    }

    /// Makes `chatroom_id` the active room, abandoning whatever the previous
    /// room still had in flight.
    ///
    /// A missing, malformed, or unreadable stored log is reported and
    /// replaced; an empty room is seeded with placeholder history so the
    /// window has something to page through. Nothing is visible until the
    /// first [`ChatSession::load_more`] round completes.
    pub fn open_chatroom(&mut self, chatroom_id: ChatroomId) {
        self.cancel_pending_work();

        let mut log = match self.store.load_log(chatroom_id) {
            Ok(Some(raw)) => match decode_log(&raw) {
                Ok(messages) => messages,
                Err(error) => {
                    tracing::warn!(
                        chatroom_id = %chatroom_id,
                        error = %error,
                        "stored message log is malformed; starting over"
                    );
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(
                    chatroom_id = %chatroom_id,
                    error = %error,
                    "failed to load message log; starting over"
                );
                Vec::new()
            }
        };

        let mut needs_persist = false;
        if log.is_empty() {
            log = seed_log(now_millis(), self.config.seed_pages * self.config.page_size);
            needs_persist = true;
        }

        if let Some(last) = log.last() {
            self.last_message_id_ms = self.last_message_id_ms.max(last.id.as_millis());
        }

        let window = HistoryWindow::new(log, self.config.page_size);
        self.active = Some(ActiveChatroom {
            id: chatroom_id,
            window,
            reply_state: ReplyState::Idle,
        });

        if needs_persist {
            self.persist_active_log();
        }
    }

    /// Closes the active room and abandons its in-flight work.
    pub fn close(&mut self) {
        self.cancel_pending_work();
        self.active = None;
    }

    pub fn active_chatroom(&self) -> Option<ChatroomId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// The visible suffix of the active room's history, oldest-first.
    pub fn visible(&self) -> &[Message] {
        self.active
            .as_ref()
            .map(|active| active.window.visible())
            .unwrap_or_default()
    }

    pub fn has_more(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.window.has_more())
    }

    pub fn is_loading(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.window.is_loading())
    }

    pub fn reply_pending(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.reply_state.active_target().is_some())
    }

    /// True once a log write has failed and the in-memory history is ahead of
    /// the stored one. Cleared by the next successful write.
    pub fn persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    /// Appends a user message and kicks off reply generation for it.
    ///
    /// The message lands in the visible history and the durable log before
    /// this returns. Submission is refused while a reply is still pending,
    /// and a message needs either non-blank text or an attachment.
    pub fn submit(
        &mut self,
        content: &str,
        attachment: Option<ImageAttachment>,
    ) -> Result<MessageId, SubmitRejection> {
        let Some(active) = &self.active else {
            return Err(SubmitRejection::NoActiveChatroom);
        };
        if active.reply_state.active_target().is_some() {
            return Err(SubmitRejection::ReplyPending);
        }
        if content.trim().is_empty() && attachment.is_none() {
            return Err(SubmitRejection::EmptyMessage);
        }
        let chatroom_id = active.id;

        let id = self.alloc_message_id();
        // Blankness is judged on the trimmed text, but the message keeps the
        // text exactly as typed.
        let mut message = Message::new(id, Sender::User, content, id.as_millis());
        if let Some(attachment) = attachment {
            message = message.with_attachment(attachment);
        }

        if let Some(active) = &mut self.active {
            active.window.append_live(message);
        }
        self.persist_active_log();

        self.next_reply_ticket += 1;
        let target = ReplyTarget {
            chatroom_id,
            ticket: ReplyTicket(self.next_reply_ticket),
        };
        self.transition_reply(ReplyTransition::Begin(target));

        match self.generator.generate(ReplyRequest::new(target, content)) {
            Ok(ReplyHandle { stream, worker }) => {
                self.reply_worker = Some(tokio::spawn(worker));
                let events_tx = self.events_tx.clone();
                self.reply_reader = Some(tokio::spawn(async move {
                    let mut stream = stream;
                    while let Some(event) = stream.recv().await {
                        if events_tx.send(SessionEvent::Reply(event)).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(error) => {
                tracing::warn!(
                    chatroom_id = %chatroom_id,
                    error = %error,
                    "reply generation failed to start"
                );
                self.transition_reply(ReplyTransition::Fail {
                    target,
                    message: error.to_string(),
                });
            }
        }

        Ok(id)
    }

    /// Requests one more page of older history. The reveal happens when the
    /// matching [`SessionEvent::PageDelayElapsed`] is applied.
    pub fn load_more(&mut self) -> SessionResult<PageTicket> {
        let Some(active) = &mut self.active else {
            return NoActiveChatroomSnafu { stage: "load-more" }.fail();
        };

        self.next_page_ticket += 1;
        let ticket = PageTicket(self.next_page_ticket);
        if let Err(rejection) = active.window.begin_load_more(ticket) {
            return LoadMoreRejectedSnafu {
                stage: "load-more-begin",
                rejection,
            }
            .fail();
        }

        let chatroom_id = active.id;
        let delay = self.config.page_delay;
        let events_tx = self.events_tx.clone();
        self.page_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(SessionEvent::PageDelayElapsed {
                chatroom_id,
                ticket,
            });
        }));

        Ok(ticket)
    }

    /// Waits for the next background completion. Only call while work is in
    /// flight; use [`ChatSession::settle`] to drain until quiescent.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Applies one completion. Events whose identity no longer matches the
    /// session are dropped without touching state.
    pub fn apply_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PageDelayElapsed {
                chatroom_id,
                ticket,
            } => {
                let Some(active) = &mut self.active else {
                    return;
                };
                if chatroom_id != active.id {
                    tracing::debug!(
                        chatroom_id = %chatroom_id,
                        "dropping page completion for inactive chatroom"
                    );
                    return;
                }
                match active.window.complete_load_more(ticket) {
                    Ok(revealed) => {
                        tracing::debug!(chatroom_id = %chatroom_id, revealed, "older history revealed");
                    }
                    Err(rejection) => {
                        tracing::debug!(?rejection, "dropping stale page completion");
                    }
                }
            }
            SessionEvent::Reply(reply) => self.apply_reply_event(reply),
        }
    }

    /// Drains events until no page load or reply remains in flight.
    pub async fn settle(&mut self) {
        while self.is_loading() || self.reply_pending() {
            match self.events_rx.recv().await {
                Some(event) => self.apply_event(event),
                None => break,
            }
        }
    }

    /// Applies any already-queued events without waiting.
    pub fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
        }
    }

    fn apply_reply_event(&mut self, event: ReplyEvent) {
        let Some(active) = &self.active else {
            return;
        };
        if event.target.chatroom_id != active.id {
            tracing::debug!(
                chatroom_id = %event.target.chatroom_id,
                ticket = %event.target.ticket,
                "dropping reply event for inactive chatroom"
            );
            return;
        }
        if !active.reply_state.accepts_reply_event(event.target) {
            tracing::debug!(
                ticket = %event.target.ticket,
                "dropping stale reply event"
            );
            return;
        }

        match event.payload {
            ReplyEventPayload::Reply(text) => {
                self.transition_reply(ReplyTransition::Deliver(event.target));
                let id = self.alloc_message_id();
                if let Some(active) = &mut self.active {
                    active
                        .window
                        .append_live(Message::new(id, Sender::Agent, text, id.as_millis()));
                }
                self.persist_active_log();
            }
            ReplyEventPayload::Error(message) => {
                tracing::warn!(
                    chatroom_id = %event.target.chatroom_id,
                    error = %message,
                    "reply generation failed"
                );
                self.transition_reply(ReplyTransition::Fail {
                    target: event.target,
                    message,
                });
            }
        }
    }

    fn transition_reply(&mut self, transition: ReplyTransition) {
        let Some(active) = &mut self.active else {
            return;
        };
        match active.reply_state.apply(transition) {
            Ok(next) => active.reply_state = next,
            Err(rejection) => {
                tracing::debug!(?rejection, "reply transition rejected");
            }
        }
    }

    fn cancel_pending_work(&mut self) {
        // Aborting the reader drops its event stream, which signals the
        // generator worker to stop.
        if let Some(reader) = self.reply_reader.take() {
            reader.abort();
        }
        if let Some(worker) = self.reply_worker.take() {
            worker.abort();
        }
        if let Some(page_task) = self.page_task.take() {
            page_task.abort();
        }
    }

    fn persist_active_log(&mut self) {
        let Some(active) = &self.active else {
            return;
        };

        let encoded = match encode_log(active.window.full_log()) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(
                    chatroom_id = %active.id,
                    error = %error,
                    "failed to serialize message log"
                );
                self.persistence_degraded = true;
                return;
            }
        };

        match self.store.save_log(active.id, &encoded) {
            Ok(()) => self.persistence_degraded = false,
            Err(error) => {
                tracing::warn!(
                    chatroom_id = %active.id,
                    error = %error,
                    "failed to persist message log; history will be behind on reload"
                );
                self.persistence_degraded = true;
            }
        }
    }

    /// Mints a message id from the current instant, nudged forward when two
    /// submissions land in the same millisecond.
    fn alloc_message_id(&mut self) -> MessageId {
        let id = now_millis().max(self.last_message_id_ms + 1);
        self.last_message_id_ms = id;
        MessageId::new(id)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel_pending_work();
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

/// Placeholder history for a room that has never been written to, newest
/// entries at the tail.
fn seed_log(now_ms: i64, count: usize) -> Vec<Message> {
    let mut messages: Vec<Message> = (0..count)
        .map(|i| {
            let sender = if i % 2 == 0 { Sender::Agent } else { Sender::User };
            let timestamp = now_ms - ((i as i64 + 1) * 60_000);
            Message::new(
                MessageId::new(timestamp),
                sender,
                format!("Dummy message {}", i + 1),
                timestamp,
            )
        })
        .collect();
    messages.reverse();
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_reply::SimulatedReplyGenerator;
    use parley_storage::{
        ChatroomRecord, ChatroomStore, MessageLogStore, NewChatroom, StorageError, StorageResult,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MemoryStore {
        rooms: Mutex<HashMap<ChatroomId, ChatroomRecord>>,
        logs: Mutex<HashMap<ChatroomId, String>>,
        fail_saves: AtomicBool,
    }

    impl MemoryStore {
        fn set_fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }

        fn stored_log(&self, chatroom_id: ChatroomId) -> Option<String> {
            self.logs.lock().unwrap().get(&chatroom_id).cloned()
        }

        fn put_log(&self, chatroom_id: ChatroomId, log: &str) {
            self.logs
                .lock()
                .unwrap()
                .insert(chatroom_id, log.to_string());
        }
    }

    impl ChatroomStore for MemoryStore {
        fn create_chatroom(&self, input: NewChatroom) -> StorageResult<ChatroomRecord> {
            let record = ChatroomRecord {
                id: ChatroomId::new_v7(),
                title: input.title,
                created_at_unix_seconds: 0,
                updated_at_unix_seconds: 0,
            };
            self.rooms.lock().unwrap().insert(record.id, record.clone());
            Ok(record)
        }

        fn list_chatrooms(&self) -> StorageResult<Vec<ChatroomRecord>> {
            Ok(self.rooms.lock().unwrap().values().cloned().collect())
        }

        fn get_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<Option<ChatroomRecord>> {
            Ok(self.rooms.lock().unwrap().get(&chatroom_id).cloned())
        }

        fn rename_chatroom(
            &self,
            chatroom_id: ChatroomId,
            title: &str,
        ) -> StorageResult<ChatroomRecord> {
            let mut rooms = self.rooms.lock().unwrap();
            let record = rooms
                .get_mut(&chatroom_id)
                .ok_or_else(|| StorageError::NotFound {
                    stage: "memory-rename",
                    entity: "chatroom",
                    id: chatroom_id.to_string(),
                })?;
            record.title = title.to_string();
            Ok(record.clone())
        }

        fn delete_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<()> {
            self.rooms.lock().unwrap().remove(&chatroom_id);
            self.logs.lock().unwrap().remove(&chatroom_id);
            Ok(())
        }
    }

    impl MessageLogStore for MemoryStore {
        fn load_log(&self, chatroom_id: ChatroomId) -> StorageResult<Option<String>> {
            Ok(self.logs.lock().unwrap().get(&chatroom_id).cloned())
        }

        fn save_log(&self, chatroom_id: ChatroomId, log: &str) -> StorageResult<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StorageError::InvariantViolation {
                    stage: "memory-save-log",
                    details: "injected save failure".to_string(),
                });
            }
            self.put_log(chatroom_id, log);
            Ok(())
        }

        fn delete_log(&self, chatroom_id: ChatroomId) -> StorageResult<()> {
            self.logs.lock().unwrap().remove(&chatroom_id);
            Ok(())
        }
    }

    const REPLY_DELAY: Duration = Duration::from_millis(20);

    async fn load_first_page(session: &mut ChatSession) {
        session.load_more().expect("first page load");
        session.settle().await;
    }

    fn test_session(store: Arc<MemoryStore>) -> ChatSession {
        let generator = SimulatedReplyGenerator::new(REPLY_DELAY, "canned reply").expect("generator");
        ChatSession::new(
            store,
            Arc::new(generator),
            SessionConfig {
                page_size: 20,
                page_delay: Duration::from_millis(10),
                seed_pages: 5,
            },
        )
    }

    #[tokio::test]
    async fn opening_an_empty_room_seeds_and_persists_history() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store.clone());
        let room = ChatroomId::new_v7();

        session.open_chatroom(room);

        assert!(session.visible().is_empty());
        assert!(session.has_more());
        load_first_page(&mut session).await;
        assert_eq!(session.visible().len(), 20);

        let stored = store.stored_log(room).expect("seed persisted");
        let log = decode_log(&stored).expect("seed decodes");
        assert_eq!(log.len(), 100);
        // Oldest first: timestamps ascend and senders alternate.
        assert!(log.windows(2).all(|pair| pair[0].timestamp_ms < pair[1].timestamp_ms));
        assert_eq!(log[0].content, "Dummy message 100");
        assert_eq!(log[99].content, "Dummy message 1");
        assert_ne!(log[0].sender, log[1].sender);
    }

    #[tokio::test]
    async fn opening_a_room_with_history_restores_it() {
        let store = Arc::new(MemoryStore::default());
        let room = ChatroomId::new_v7();
        let existing = vec![
            Message::new(MessageId::new(1), Sender::User, "hi", 1),
            Message::new(MessageId::new(2), Sender::Agent, "hello", 2),
            Message::new(MessageId::new(3), Sender::User, "how are you", 3),
        ];
        store.put_log(room, &encode_log(&existing).expect("encode"));

        let mut session = test_session(store.clone());
        session.open_chatroom(room);
        load_first_page(&mut session).await;

        assert_eq!(session.visible(), existing.as_slice());
        assert!(!session.has_more());
        // No seeding on top of real history.
        let stored = store.stored_log(room).expect("log kept");
        assert_eq!(decode_log(&stored).expect("decode").len(), 3);
    }

    #[tokio::test]
    async fn malformed_stored_log_is_replaced_by_seed() {
        let store = Arc::new(MemoryStore::default());
        let room = ChatroomId::new_v7();
        store.put_log(room, "{definitely not a log");

        let mut session = test_session(store.clone());
        session.open_chatroom(room);
        load_first_page(&mut session).await;

        assert_eq!(session.visible().len(), 20);
        let stored = store.stored_log(room).expect("replacement persisted");
        assert_eq!(decode_log(&stored).expect("decode").len(), 100);
    }

    #[tokio::test]
    async fn history_stays_hidden_until_explicitly_loaded() {
        let store = Arc::new(MemoryStore::default());
        let room = ChatroomId::new_v7();
        let one_page: Vec<Message> = (0..20)
            .map(|i| Message::new(MessageId::new(i), Sender::User, format!("m{i}"), i))
            .collect();
        store.put_log(room, &encode_log(&one_page).expect("encode"));

        let mut session = test_session(store);
        session.open_chatroom(room);

        // Even a single-page log waits for the first load round.
        assert!(session.visible().is_empty());
        assert!(session.has_more());
        assert!(!session.is_loading());

        load_first_page(&mut session).await;
        assert_eq!(session.visible().len(), 20);
        assert!(!session.has_more());
    }

    #[tokio::test]
    async fn submit_appends_persists_and_delivers_a_reply() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store.clone());
        let room = ChatroomId::new_v7();
        session.open_chatroom(room);

        let user_id = session.submit("  hello there  ", None).expect("submit");
        assert!(session.reply_pending());

        // The user message is visible and durable before the reply lands,
        // with the text preserved exactly as typed.
        let last = session.visible().last().expect("user message");
        assert_eq!(last.id, user_id);
        assert_eq!(last.sender, Sender::User);
        assert_eq!(last.content, "  hello there  ");
        let stored = decode_log(&store.stored_log(room).expect("log")).expect("decode");
        assert_eq!(stored.len(), 101);

        session.settle().await;

        assert!(!session.reply_pending());
        let reply = session.visible().last().expect("reply message");
        assert_eq!(reply.sender, Sender::Agent);
        assert_eq!(reply.content, "canned reply");
        assert!(reply.id > user_id);
        let stored = decode_log(&store.stored_log(room).expect("log")).expect("decode");
        assert_eq!(stored.len(), 102);
    }

    #[tokio::test]
    async fn message_ids_stay_strictly_increasing() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        session.open_chatroom(ChatroomId::new_v7());

        let first = session.submit("one", None).expect("first");
        session.settle().await;
        let second = session.submit("two", None).expect("second");
        session.settle().await;

        let ids: Vec<MessageId> = session.visible().iter().map(|m| m.id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(second > first);
    }

    #[tokio::test]
    async fn blank_submissions_are_rejected_unless_attached() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        session.open_chatroom(ChatroomId::new_v7());

        assert_eq!(session.submit("", None), Err(SubmitRejection::EmptyMessage));
        assert_eq!(
            session.submit("   \n", None),
            Err(SubmitRejection::EmptyMessage)
        );

        let attachment = ImageAttachment {
            mime_type: "image/png".to_string(),
            base64_data: "aGVsbG8=".to_string(),
        };
        let id = session
            .submit("", Some(attachment.clone()))
            .expect("attachment-only submit");
        let message = session.visible().last().expect("message");
        assert_eq!(message.id, id);
        assert_eq!(message.attachment.as_ref(), Some(&attachment));
        session.settle().await;
    }

    #[tokio::test]
    async fn submissions_are_refused_while_a_reply_is_pending() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        session.open_chatroom(ChatroomId::new_v7());

        session.submit("first", None).expect("first");
        assert_eq!(
            session.submit("second", None),
            Err(SubmitRejection::ReplyPending)
        );

        session.settle().await;
        session.submit("second", None).expect("after settle");
        session.settle().await;
    }

    #[tokio::test]
    async fn submit_without_an_open_room_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        assert_eq!(
            session.submit("hello", None),
            Err(SubmitRejection::NoActiveChatroom)
        );
        assert!(matches!(
            session.load_more(),
            Err(SessionError::NoActiveChatroom { .. })
        ));
    }

    #[tokio::test]
    async fn load_more_reveals_older_pages_after_the_delay() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        session.open_chatroom(ChatroomId::new_v7());
        assert!(session.visible().is_empty());

        session.load_more().expect("begin load");
        assert!(session.is_loading());
        assert!(matches!(
            session.load_more(),
            Err(SessionError::LoadMoreRejected {
                rejection: LoadMoreRejection::AlreadyLoading { .. },
                ..
            })
        ));

        session.settle().await;
        assert_eq!(session.visible().len(), 20);

        for expected in [40, 60, 80, 100] {
            session.load_more().expect("begin load");
            session.settle().await;
            assert_eq!(session.visible().len(), expected);
        }

        assert!(!session.has_more());
        assert!(matches!(
            session.load_more(),
            Err(SessionError::LoadMoreRejected {
                rejection: LoadMoreRejection::Exhausted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn switching_rooms_suppresses_the_in_flight_reply() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store.clone());
        let room_a = ChatroomId::new_v7();
        let room_b = ChatroomId::new_v7();

        session.open_chatroom(room_a);
        session.submit("trigger", None).expect("submit");
        session.open_chatroom(room_b);
        assert!(!session.reply_pending());

        // Wait out the reply delay, then drain whatever arrived.
        tokio::time::sleep(REPLY_DELAY * 4).await;
        session.pump();

        assert!(
            session
                .visible()
                .iter()
                .all(|message| message.content != "canned reply")
        );
        // Room A keeps the user message but never gains the reply.
        let stored_a = decode_log(&store.stored_log(room_a).expect("log a")).expect("decode");
        assert_eq!(stored_a.len(), 101);
        assert!(stored_a.iter().all(|message| message.content != "canned reply"));
    }

    #[tokio::test]
    async fn reopening_the_same_room_discards_the_stale_reply() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store.clone());
        let room = ChatroomId::new_v7();

        session.open_chatroom(room);
        session.submit("trigger", None).expect("submit");
        session.open_chatroom(room);

        tokio::time::sleep(REPLY_DELAY * 4).await;
        session.pump();

        assert!(!session.reply_pending());
        let stored = decode_log(&store.stored_log(room).expect("log")).expect("decode");
        assert!(stored.iter().all(|message| message.content != "canned reply"));
    }

    #[tokio::test]
    async fn failed_persistence_degrades_and_recovers() {
        let store = Arc::new(MemoryStore::default());
        store.set_fail_saves(true);
        let mut session = test_session(store.clone());
        let room = ChatroomId::new_v7();

        session.open_chatroom(room);
        // Seed write failed, but the room is still usable in memory.
        assert!(session.persistence_degraded());
        load_first_page(&mut session).await;
        assert_eq!(session.visible().len(), 20);

        let id = session.submit("still works", None).expect("submit");
        assert!(session.persistence_degraded());
        assert_eq!(session.visible().last().map(|m| m.id), Some(id));

        store.set_fail_saves(false);
        session.settle().await;
        // The reply delivery persisted the full log and cleared the flag.
        assert!(!session.persistence_degraded());
        let stored = decode_log(&store.stored_log(room).expect("log")).expect("decode");
        assert_eq!(stored.len(), 102);
    }

    #[tokio::test]
    async fn close_clears_the_active_room() {
        let store = Arc::new(MemoryStore::default());
        let mut session = test_session(store);
        session.open_chatroom(ChatroomId::new_v7());
        assert!(session.active_chatroom().is_some());

        session.close();
        assert!(session.active_chatroom().is_none());
        assert!(session.visible().is_empty());
        assert!(!session.has_more());
    }
}
