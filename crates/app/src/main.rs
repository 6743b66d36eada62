use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use parley_chat::{ChatSession, Message, Sender, SessionError, SubmitRejection, encode_image_file};
use parley_reply::{GeneratorError, SimulatedReplyGenerator};
use parley_storage::{ChatroomId, ChatroomRecord, ChatroomStore, NewChatroom, SqliteStorage, StorageError};

mod settings;

use settings::SettingsStore;

const DATABASE_FILE_NAME: &str = "parley.db";

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open chat storage: {source}"))]
    StorageInit {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("storage operation failed: {source}"))]
    StorageCall {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to build reply generator: {source}"))]
    GeneratorInit {
        stage: &'static str,
        source: GeneratorError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    TerminalIo {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let database_path = settings.data_dir().join(DATABASE_FILE_NAME);
    let storage = Arc::new(
        SqliteStorage::open(&database_path.to_string_lossy())
            .await
            .context(StorageInitSnafu {
                stage: "app-open-storage",
            })?,
    );

    let generator = SimulatedReplyGenerator::new(settings.reply_delay(), &settings.reply_template)
        .context(GeneratorInitSnafu {
            stage: "app-build-generator",
        })?;

    let session = ChatSession::new(
        storage.clone(),
        Arc::new(generator),
        settings.session_config(),
    );

    let mut app = App {
        storage,
        session,
        rooms: Vec::new(),
    };
    app.refresh_rooms()?;
    if let Some(first) = app.rooms.first() {
        let first_id = first.id;
        app.activate_room(first_id).await;
    }

    app.print_help().await?;
    app.print_view().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt().await?;
        let Some(line) = lines.next_line().await.context(TerminalIoSnafu {
            stage: "repl-read-line",
        })?
        else {
            break;
        };

        if !app.handle_line(line.trim()).await? {
            break;
        }
    }

    Ok(())
}

struct App {
    storage: Arc<SqliteStorage>,
    session: ChatSession,
    rooms: Vec<ChatroomRecord>,
}

impl App {
    /// Dispatches one REPL line. Returns false when the app should exit.
    async fn handle_line(&mut self, line: &str) -> AppResult<bool> {
        match line {
            "" => {}
            ":quit" | ":q" => return Ok(false),
            ":help" => self.print_help().await?,
            ":rooms" => self.print_rooms().await?,
            ":show" => self.print_view().await?,
            ":more" => self.load_more().await?,
            ":new" => self.create_room(None).await?,
            ":delete" => self.delete_active_room().await?,
            _ if line.starts_with(":new ") => {
                self.create_room(Some(line[5..].trim())).await?;
            }
            _ if line.starts_with(":open ") => self.open_room(line[6..].trim()).await?,
            _ if line.starts_with(":rename ") => self.rename_active_room(line[8..].trim()).await?,
            _ if line.starts_with(":attach ") => self.send_attachment(line[8..].trim()).await?,
            _ if line.starts_with(':') => {
                println_out(&format!("unknown command '{line}', try :help")).await?;
            }
            text => self.send_text(text).await?,
        }

        Ok(true)
    }

    /// Opens a room and materializes its newest page so there is something
    /// on screen before the first command.
    async fn activate_room(&mut self, chatroom_id: ChatroomId) {
        self.session.open_chatroom(chatroom_id);
        if self.session.load_more().is_ok() {
            self.session.settle().await;
        }
    }

    fn refresh_rooms(&mut self) -> AppResult<()> {
        self.rooms = self
            .storage
            .list_chatrooms()
            .context(StorageCallSnafu {
                stage: "app-list-rooms",
            })?;
        Ok(())
    }

    /// Resolves a `:open` argument as a 1-based listing index or a full id.
    fn resolve_room(&self, raw: &str) -> Option<ChatroomId> {
        if let Ok(index) = raw.parse::<usize>() {
            return self
                .rooms
                .get(index.checked_sub(1)?)
                .map(|record| record.id);
        }
        raw.parse::<ChatroomId>().ok()
    }

    async fn create_room(&mut self, title: Option<&str>) -> AppResult<()> {
        let title = match title {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => format!("New Chat {}", self.rooms.len() + 1),
        };

        let record = self
            .storage
            .create_chatroom(NewChatroom::new(title))
            .context(StorageCallSnafu {
                stage: "app-create-room",
            })?;
        println_out(&format!("created '{}' ({})", record.title, record.id)).await?;

        self.refresh_rooms()?;
        self.activate_room(record.id).await;
        self.print_view().await
    }

    async fn open_room(&mut self, raw: &str) -> AppResult<()> {
        self.refresh_rooms()?;
        let Some(chatroom_id) = self.resolve_room(raw) else {
            println_out(&format!("no room matches '{raw}'")).await?;
            return Ok(());
        };

        self.activate_room(chatroom_id).await;
        self.print_view().await
    }

    async fn rename_active_room(&mut self, title: &str) -> AppResult<()> {
        let Some(chatroom_id) = self.session.active_chatroom() else {
            println_out("no room is open").await?;
            return Ok(());
        };
        if title.is_empty() {
            println_out("usage: :rename <title>").await?;
            return Ok(());
        }

        match self.storage.rename_chatroom(chatroom_id, title) {
            Ok(record) => {
                println_out(&format!("renamed to '{}'", record.title)).await?;
                self.refresh_rooms()?;
            }
            Err(error) => println_out(&format!("rename failed: {error}")).await?,
        }
        Ok(())
    }

    async fn delete_active_room(&mut self) -> AppResult<()> {
        let Some(chatroom_id) = self.session.active_chatroom() else {
            println_out("no room is open").await?;
            return Ok(());
        };

        self.session.close();
        self.storage
            .delete_chatroom(chatroom_id)
            .context(StorageCallSnafu {
                stage: "app-delete-room",
            })?;
        println_out(&format!("deleted {chatroom_id}")).await?;

        self.refresh_rooms()?;
        if let Some(first) = self.rooms.first() {
            let first_id = first.id;
            self.activate_room(first_id).await;
        }
        self.print_view().await
    }

    async fn send_text(&mut self, text: &str) -> AppResult<()> {
        self.submit(text, None).await
    }

    async fn send_attachment(&mut self, raw: &str) -> AppResult<()> {
        let (path, caption) = match raw.split_once(' ') {
            Some((path, caption)) => (path, caption.trim()),
            None => (raw, ""),
        };
        if path.is_empty() {
            println_out("usage: :attach <path> [caption]").await?;
            return Ok(());
        }

        let Some(attachment) = encode_image_file(path).await else {
            println_out(&format!("could not read '{path}'")).await?;
            return Ok(());
        };
        self.submit(caption, Some(attachment)).await
    }

    async fn submit(
        &mut self,
        text: &str,
        attachment: Option<parley_chat::ImageAttachment>,
    ) -> AppResult<()> {
        match self.session.submit(text, attachment) {
            Ok(_) => {
                // Input stays blocked until the reply lands, so wait it out.
                self.session.settle().await;
                self.print_view().await
            }
            Err(SubmitRejection::EmptyMessage) => {
                println_out("nothing to send").await
            }
            Err(SubmitRejection::ReplyPending) => {
                println_out("a reply is still pending").await
            }
            Err(SubmitRejection::NoActiveChatroom) => {
                println_out("no room is open, use :new or :open").await
            }
        }
    }

    async fn load_more(&mut self) -> AppResult<()> {
        match self.session.load_more() {
            Ok(_) => {
                self.session.settle().await;
                self.print_view().await
            }
            Err(SessionError::NoActiveChatroom { .. }) => {
                println_out("no room is open").await
            }
            Err(SessionError::LoadMoreRejected { rejection, .. }) => {
                println_out(&format!("cannot load more: {rejection:?}")).await
            }
        }
    }

    async fn print_rooms(&mut self) -> AppResult<()> {
        self.refresh_rooms()?;
        if self.rooms.is_empty() {
            return println_out("no rooms yet, use :new").await;
        }

        let active = self.session.active_chatroom();
        for (index, record) in self.rooms.iter().enumerate() {
            let marker = if active == Some(record.id) { "*" } else { " " };
            println_out(&format!(
                "{marker} {}. {} ({})",
                index + 1,
                record.title,
                record.id
            ))
            .await?;
        }
        Ok(())
    }

    async fn print_view(&mut self) -> AppResult<()> {
        let Some(chatroom_id) = self.session.active_chatroom() else {
            return println_out("no room is open, use :new or :open").await;
        };

        let title = self
            .rooms
            .iter()
            .find(|record| record.id == chatroom_id)
            .map(|record| record.title.clone())
            .unwrap_or_else(|| chatroom_id.to_string());
        println_out(&format!("--- {title} ---")).await?;

        if self.session.has_more() {
            println_out("  (older history available, :more to load)").await?;
        }
        for message in self.session.visible() {
            println_out(&format_message(message)).await?;
        }
        if self.session.persistence_degraded() {
            println_out("  (warning: recent messages could not be saved)").await?;
        }
        Ok(())
    }

    async fn print_help(&self) -> AppResult<()> {
        println_out(
            "commands: :rooms :new [title] :open <n|id> :rename <title> :delete \
             :more :show :attach <path> [caption] :quit  (anything else is sent as a message)",
        )
        .await
    }
}

fn format_message(message: &Message) -> String {
    let speaker = match message.sender {
        Sender::User => "you",
        Sender::Agent => "ai",
    };
    match &message.attachment {
        Some(attachment) => format!(
            "  [{speaker}] {} <image {}>",
            message.content, attachment.mime_type
        ),
        None => format!("  [{speaker}] {}", message.content),
    }
}

async fn prompt() -> AppResult<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await.context(TerminalIoSnafu {
        stage: "repl-write-prompt",
    })?;
    stdout.flush().await.context(TerminalIoSnafu {
        stage: "repl-flush-prompt",
    })
}

async fn println_out(line: &str) -> AppResult<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{line}\n").as_bytes())
        .await
        .context(TerminalIoSnafu {
            stage: "repl-write-line",
        })
}
