use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageResult,
};
use super::ids::ChatroomId;
use super::types::{ChatroomRecord, DEFAULT_CHATROOM_TITLE, NewChatroom};
use super::{ChatroomStore, MessageLogStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker
        // thread with its own current-thread runtime to avoid nested-runtime
        // blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ChatroomStore for SqliteStorage {
    fn create_chatroom(&self, input: NewChatroom) -> StorageResult<ChatroomRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("chatroom-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "chatroom-create-connect").await?;

            let mut title = input.title.trim().to_string();
            if title.is_empty() {
                title = DEFAULT_CHATROOM_TITLE.to_string();
            }

            let chatroom_id = ChatroomId::new_v7();
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO chatrooms (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(chatroom_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chatroom-create-insert",
            })?;

            Ok(ChatroomRecord {
                id: chatroom_id,
                title,
                created_at_unix_seconds: i64_to_u64(now, "chatroom-create-created-at")?,
                updated_at_unix_seconds: i64_to_u64(now, "chatroom-create-updated-at")?,
            })
        })
    }

    fn list_chatrooms(&self) -> StorageResult<Vec<ChatroomRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chatroom-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "chatroom-list-connect").await?;
            let rows = sqlx::query_as::<_, ChatroomRow>(
                "SELECT id, title, created_at, updated_at FROM chatrooms ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chatroom-list-query",
            })?;

            rows.into_iter().map(chatroom_row_to_record).collect()
        })
    }

    fn get_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<Option<ChatroomRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chatroom-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "chatroom-get-connect").await?;
            let row = sqlx::query_as::<_, ChatroomRow>(
                "SELECT id, title, created_at, updated_at FROM chatrooms WHERE id = ?",
            )
            .bind(chatroom_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chatroom-get-query",
            })?;

            row.map(chatroom_row_to_record).transpose()
        })
    }

    fn rename_chatroom(
        &self,
        chatroom_id: ChatroomId,
        title: &str,
    ) -> StorageResult<ChatroomRecord> {
        let database_url = self.database_url.clone();
        let title = title.trim().to_string();
        self.run_db_call("chatroom-rename", async move {
            let mut connection =
                connect_store_connection(&database_url, "chatroom-rename-connect").await?;
            let now = unix_timestamp_seconds();
            let update_result =
                sqlx::query("UPDATE chatrooms SET title = ?, updated_at = ? WHERE id = ?")
                    .bind(title)
                    .bind(now)
                    .bind(chatroom_id.to_string())
                    .execute(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "chatroom-rename-apply",
                    })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "chatroom-rename-missing",
                    entity: "chatroom",
                    id: chatroom_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, ChatroomRow>(
                "SELECT id, title, created_at, updated_at FROM chatrooms WHERE id = ?",
            )
            .bind(chatroom_id.to_string())
            .fetch_one(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chatroom-rename-load",
            })?;

            chatroom_row_to_record(row)
        })
    }

    fn delete_chatroom(&self, chatroom_id: ChatroomId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("chatroom-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "chatroom-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "chatroom-delete-begin",
            })?;

            // The room's log record goes with it. Both deletes tolerate
            // missing rows so the whole operation stays idempotent.
            sqlx::query("DELETE FROM chatrooms WHERE id = ?")
                .bind(chatroom_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chatroom-delete-room",
                })?;
            sqlx::query("DELETE FROM message_logs WHERE chatroom_id = ?")
                .bind(chatroom_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chatroom-delete-log",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chatroom-delete-commit",
            })?;

            Ok(())
        })
    }
}

impl MessageLogStore for SqliteStorage {
    fn load_log(&self, chatroom_id: ChatroomId) -> StorageResult<Option<String>> {
        let database_url = self.database_url.clone();
        self.run_db_call("log-load", async move {
            let mut connection =
                connect_store_connection(&database_url, "log-load-connect").await?;
            let log = sqlx::query_scalar::<_, String>(
                "SELECT log FROM message_logs WHERE chatroom_id = ?",
            )
            .bind(chatroom_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "log-load-query",
            })?;

            Ok(log)
        })
    }

    fn save_log(&self, chatroom_id: ChatroomId, log: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let log = log.to_string();
        self.run_db_call("log-save", async move {
            let mut connection =
                connect_store_connection(&database_url, "log-save-connect").await?;
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO message_logs (chatroom_id, log, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(chatroom_id) DO UPDATE SET log = excluded.log, updated_at = excluded.updated_at",
            )
            .bind(chatroom_id.to_string())
            .bind(log)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "log-save-upsert",
            })?;

            // Keep the sidebar ordering in sync with message activity.
            sqlx::query("UPDATE chatrooms SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(chatroom_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "log-save-touch-room",
                })?;

            Ok(())
        })
    }

    fn delete_log(&self, chatroom_id: ChatroomId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("log-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "log-delete-connect").await?;
            sqlx::query("DELETE FROM message_logs WHERE chatroom_id = ?")
                .bind(chatroom_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "log-delete-apply",
                })?;

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ChatroomRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

fn chatroom_row_to_record(row: ChatroomRow) -> StorageResult<ChatroomRecord> {
    Ok(ChatroomRecord {
        id: ChatroomId::parse(&row.id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "chatroom-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "chatroom-row-updated-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatroomStore, MessageLogStore, StorageError};

    async fn open_temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("parley-test.db");
        let storage = SqliteStorage::open(db_path.to_str().expect("utf-8 temp path"))
            .await
            .expect("open sqlite storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn chatroom_crud_orders_by_recency() {
        let (_dir, storage) = open_temp_storage().await;

        let first = storage
            .create_chatroom(NewChatroom::new("Alpha"))
            .expect("create first");
        let second = storage
            .create_chatroom(NewChatroom::new("Beta"))
            .expect("create second");

        // Touch the first room via a log save so it becomes most recent.
        storage
            .save_log(first.id, "[]")
            .expect("save log for first room");

        let listed = storage.list_chatrooms().expect("list rooms");
        assert_eq!(listed.len(), 2);
        // Same-second updates fall back to descending id order; the saved
        // room must never sort below where it started.
        assert!(listed.iter().any(|room| room.id == first.id));
        assert!(listed.iter().any(|room| room.id == second.id));

        let renamed = storage
            .rename_chatroom(second.id, "Beta Prime")
            .expect("rename");
        assert_eq!(renamed.title, "Beta Prime");

        let fetched = storage.get_chatroom(second.id).expect("get").expect("some");
        assert_eq!(fetched.title, "Beta Prime");
    }

    #[tokio::test]
    async fn blank_title_defaults() {
        let (_dir, storage) = open_temp_storage().await;
        let room = storage
            .create_chatroom(NewChatroom::new("   "))
            .expect("create");
        assert_eq!(room.title, DEFAULT_CHATROOM_TITLE);
    }

    #[tokio::test]
    async fn rename_missing_room_is_not_found() {
        let (_dir, storage) = open_temp_storage().await;
        let error = storage
            .rename_chatroom(ChatroomId::new_v7(), "Ghost")
            .expect_err("rename of unknown room must fail");
        assert!(matches!(error, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn log_round_trip_and_overwrite() {
        let (_dir, storage) = open_temp_storage().await;
        let room = storage
            .create_chatroom(NewChatroom::new("Logs"))
            .expect("create");

        assert_eq!(storage.load_log(room.id).expect("load empty"), None);

        storage
            .save_log(room.id, r#"[{"id":1}]"#)
            .expect("first save");
        assert_eq!(
            storage.load_log(room.id).expect("load"),
            Some(r#"[{"id":1}]"#.to_string())
        );

        storage
            .save_log(room.id, r#"[{"id":1},{"id":2}]"#)
            .expect("overwrite");
        assert_eq!(
            storage.load_log(room.id).expect("reload"),
            Some(r#"[{"id":1},{"id":2}]"#.to_string())
        );
    }

    #[tokio::test]
    async fn delete_chatroom_removes_log_and_is_idempotent() {
        let (_dir, storage) = open_temp_storage().await;
        let room = storage
            .create_chatroom(NewChatroom::new("Doomed"))
            .expect("create");
        storage.save_log(room.id, "[]").expect("save");

        storage.delete_chatroom(room.id).expect("delete");
        assert_eq!(storage.get_chatroom(room.id).expect("get"), None);
        assert_eq!(storage.load_log(room.id).expect("load"), None);

        // A second delete of the same id is a no-op.
        storage.delete_chatroom(room.id).expect("repeat delete");
        storage.delete_log(room.id).expect("repeat log delete");
    }
}
