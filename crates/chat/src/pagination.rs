use crate::message::Message;

/// Identifier for one in-flight page load.
///
/// A fresh ticket is minted per load request so a completion arriving after
/// the window was rebuilt can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadPhase {
    Idle,
    Loading(PageTicket),
}

/// Rejection reason for illegal page-load requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreRejection {
    AlreadyLoading { active: PageTicket },
    Exhausted,
    NotLoading,
    StaleTicket {
        active: PageTicket,
        attempted: PageTicket,
    },
}

/// Suffix view over the full in-memory message log.
///
/// The log always holds every message oldest-first; the window exposes the
/// visible tail and grows it backwards one page at a time. Live appends land
/// on the tail and are visible immediately regardless of how far back the
/// window has been extended.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    full_log: Vec<Message>,
    visible_start: usize,
    pages_loaded: usize,
    page_size: usize,
    phase: LoadPhase,
}

impl HistoryWindow {
    /// Builds a window over the given log with nothing visible yet. History
    /// materializes only through explicit load rounds, the first of which
    /// reveals the newest page.
    pub fn new(full_log: Vec<Message>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let visible_start = full_log.len();
        Self {
            full_log,
            visible_start,
            pages_loaded: 0,
            page_size,
            phase: LoadPhase::Idle,
        }
    }

    /// The currently visible suffix, oldest-first.
    pub fn visible(&self) -> &[Message] {
        &self.full_log[self.visible_start..]
    }

    /// The complete log backing the window, oldest-first.
    pub fn full_log(&self) -> &[Message] {
        &self.full_log
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True while older history remains hidden above the window.
    pub fn has_more(&self) -> bool {
        self.visible_start > 0
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, LoadPhase::Loading(_))
    }

    /// Starts a page load under the caller-minted `ticket`. At most one load
    /// may be in flight, and requests past the top of history are refused.
    ///
    /// Tickets come from the session so they stay unique even when the same
    /// chatroom is reopened with a fresh window.
    pub fn begin_load_more(&mut self, ticket: PageTicket) -> Result<(), LoadMoreRejection> {
        if let LoadPhase::Loading(active) = self.phase {
            return Err(LoadMoreRejection::AlreadyLoading { active });
        }
        if !self.has_more() {
            return Err(LoadMoreRejection::Exhausted);
        }

        self.phase = LoadPhase::Loading(ticket);
        Ok(())
    }

    /// Finishes the load identified by `ticket`, revealing up to one more
    /// page of older messages. Returns how many messages became visible.
    ///
    /// A ticket from a superseded load leaves the window untouched.
    pub fn complete_load_more(&mut self, ticket: PageTicket) -> Result<usize, LoadMoreRejection> {
        let active = match self.phase {
            LoadPhase::Idle => return Err(LoadMoreRejection::NotLoading),
            LoadPhase::Loading(active) => active,
        };
        if active != ticket {
            return Err(LoadMoreRejection::StaleTicket {
                active,
                attempted: ticket,
            });
        }

        let revealed = self.page_size.min(self.visible_start);
        self.visible_start -= revealed;
        self.pages_loaded += 1;
        self.phase = LoadPhase::Idle;
        Ok(revealed)
    }

    /// Abandons the load identified by `ticket`, if it is still the active
    /// one. Used when the in-flight delay is cancelled.
    pub fn abandon_load(&mut self, ticket: PageTicket) {
        if self.phase == LoadPhase::Loading(ticket) {
            self.phase = LoadPhase::Idle;
        }
    }

    /// Appends a freshly submitted or delivered message to the tail.
    pub fn append_live(&mut self, message: Message) {
        self.full_log.push(message);
    }
}
