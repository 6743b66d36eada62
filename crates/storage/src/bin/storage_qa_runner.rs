use std::cmp::Ordering;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};

use parley_storage::{
    ChatroomId, ChatroomRecord, ChatroomStore, DEFAULT_CHATROOM_TITLE, MessageLogStore,
    NewChatroom, SqliteStorage, StorageError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    ChatroomCrud,
    LogRoundtrip,
    DeleteCascade,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "chatroom_crud" => Some(Self::ChatroomCrud),
            "log_roundtrip" => Some(Self::LogRoundtrip),
            "delete_cascade" => Some(Self::DeleteCascade),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::ChatroomCrud => "chatroom_crud",
            Self::LogRoundtrip => "log_roundtrip",
            Self::DeleteCascade => "delete_cascade",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::ChatroomCrud => run_chatroom_crud(require_db_path(&args, "chatroom_crud")?).await,
        Scenario::LogRoundtrip => run_log_roundtrip(require_db_path(&args, "log_roundtrip")?).await,
        Scenario::DeleteCascade => {
            run_delete_cascade(require_db_path(&args, "delete_cascade")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = ChatroomId::new_v7();
    let encoded = id.to_string();
    let decoded = encoded
        .parse::<ChatroomId>()
        .context(StorageValidationSnafu {
            stage: "scenario-id-roundtrip-parse",
        })?;

    if decoded != id {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-compare",
            scenario: "id_roundtrip",
            reason: "chatroom_id parse/format roundtrip mismatch".to_string(),
        }
        .fail();
    }

    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_id_error = matches!(
        ChatroomId::from_str("not-a-valid-uuid"),
        Err(StorageError::InvalidId { .. })
    );

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "ID wrapper accepted malformed UUID input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_chatroom_crud(path).await?;
        run_log_roundtrip(path).await?;
        run_delete_cascade(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-schema-init-open",
        })?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('chatrooms', 'message_logs')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let required_tables = ["chatrooms", "message_logs"];
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = required_tables
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let busy_timeout = sqlx::query_scalar::<_, i64>("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-busy-timeout",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("busy_timeout={busy_timeout}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected migration tables are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    if busy_timeout != 5_000 {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-busy-timeout",
            scenario: "schema_init",
            reason: format!("expected busy_timeout=5000 but was {busy_timeout}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_chatroom_crud(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-open",
        })?;

    let created_a = storage
        .create_chatroom(NewChatroom::new("room-a"))
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-create-a",
        })?;
    let created_b = storage
        .create_chatroom(NewChatroom::new("room-b"))
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-create-b",
        })?;
    let created_default = storage
        .create_chatroom(NewChatroom::new("   "))
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-create-default",
        })?;

    storage
        .get_chatroom(created_a.id)
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-get-a",
        })?
        .context(ScenarioFailedSnafu {
            stage: "scenario-chatroom-crud-get-a-missing",
            scenario: "chatroom_crud",
            reason: "created room-a not found".to_string(),
        })?;

    let renamed = storage
        .rename_chatroom(created_b.id, "room-b-renamed")
        .context(StorageValidationSnafu {
            stage: "scenario-chatroom-crud-rename-b",
        })?;

    let missing_rename = storage.rename_chatroom(ChatroomId::new_v7(), "ghost");
    let missing_rejected = matches!(missing_rename, Err(StorageError::NotFound { .. }));

    let listed = storage.list_chatrooms().context(StorageValidationSnafu {
        stage: "scenario-chatroom-crud-list",
    })?;
    let list_order_ok = is_chatroom_list_ordered(&listed);
    let default_title_applied = created_default.title == DEFAULT_CHATROOM_TITLE;

    println!("rename_applied={}", renamed.title == "room-b-renamed");
    println!("missing_rename_rejected={missing_rejected}");
    println!("listed_count={}", listed.len());
    println!("list_order_ok={list_order_ok}");
    println!("default_title_applied={default_title_applied}");

    if renamed.title != "room-b-renamed" || !missing_rejected || !list_order_ok
        || !default_title_applied
    {
        return ScenarioFailedSnafu {
            stage: "scenario-chatroom-crud-assert",
            scenario: "chatroom_crud",
            reason: "chatroom CRUD semantics mismatch".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_log_roundtrip(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-log-roundtrip-open",
        })?;

    let room = storage
        .create_chatroom(NewChatroom::new("log-roundtrip"))
        .context(StorageValidationSnafu {
            stage: "scenario-log-roundtrip-create",
        })?;

    let empty_before_save = storage
        .load_log(room.id)
        .context(StorageValidationSnafu {
            stage: "scenario-log-roundtrip-load-empty",
        })?
        .is_none();

    storage
        .save_log(room.id, r#"[{"id":1}]"#)
        .context(StorageValidationSnafu {
            stage: "scenario-log-roundtrip-save-first",
        })?;
    storage
        .save_log(room.id, r#"[{"id":1},{"id":2}]"#)
        .context(StorageValidationSnafu {
            stage: "scenario-log-roundtrip-save-second",
        })?;

    let reloaded = storage.load_log(room.id).context(StorageValidationSnafu {
        stage: "scenario-log-roundtrip-load",
    })?;
    let overwrite_ok = reloaded.as_deref() == Some(r#"[{"id":1},{"id":2}]"#);

    println!("empty_before_save={empty_before_save}");
    println!("overwrite_ok={overwrite_ok}");

    if !empty_before_save || !overwrite_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-log-roundtrip-assert",
            scenario: "log_roundtrip",
            reason: "log save/load roundtrip mismatch".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_delete_cascade(db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-open",
        })?;

    let room = storage
        .create_chatroom(NewChatroom::new("delete-cascade"))
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-create",
        })?;
    storage
        .save_log(room.id, "[]")
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-save-log",
        })?;

    storage
        .delete_chatroom(room.id)
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-delete",
        })?;

    let room_gone = storage
        .get_chatroom(room.id)
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-get-after",
        })?
        .is_none();
    let log_gone = storage
        .load_log(room.id)
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-load-after",
        })?
        .is_none();

    // Repeat deletes must stay silent no-ops.
    storage
        .delete_chatroom(room.id)
        .context(StorageValidationSnafu {
            stage: "scenario-delete-cascade-repeat-delete",
        })?;

    println!("room_gone={room_gone}");
    println!("log_gone={log_gone}");

    if !room_gone || !log_gone {
        return ScenarioFailedSnafu {
            stage: "scenario-delete-cascade-assert",
            scenario: "delete_cascade",
            reason: "chatroom delete did not remove both the room and its log".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn is_chatroom_list_ordered(chatrooms: &[ChatroomRecord]) -> bool {
    chatrooms.windows(2).all(|pair| {
        let left = &pair[0];
        let right = &pair[1];

        if left.updated_at_unix_seconds != right.updated_at_unix_seconds {
            return left.updated_at_unix_seconds > right.updated_at_unix_seconds;
        }

        // UUIDv7 IDs are textual in sqlite ordering; compare the serialized forms to mirror SQL.
        left.id.to_string().cmp(&right.id.to_string()) == Ordering::Greater
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
