use std::env;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use parley_chat::{
    ChatSession, Sender, SessionConfig, SessionError, SubmitRejection, decode_log,
};
use parley_reply::SimulatedReplyGenerator;
use parley_storage::{ChatroomId, MessageLogStore, SqliteStorage, StorageError};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SeedOnOpen,
    PagedHistory,
    SubmitReply,
    ReplyBackpressure,
    StaleReplySuppression,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "seed_on_open" => Some(Self::SeedOnOpen),
            "paged_history" => Some(Self::PagedHistory),
            "submit_reply" => Some(Self::SubmitReply),
            "reply_backpressure" => Some(Self::ReplyBackpressure),
            "stale_reply_suppression" => Some(Self::StaleReplySuppression),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SeedOnOpen => "seed_on_open",
            Self::PagedHistory => "paged_history",
            Self::SubmitReply => "submit_reply",
            Self::ReplyBackpressure => "reply_backpressure",
            Self::StaleReplySuppression => "stale_reply_suppression",
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
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session operation failed: {source}"))]
    SessionOperation {
        stage: &'static str,
        source: SessionError,
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
        Scenario::SeedOnOpen => run_seed_on_open(require_db_path(&args, "seed_on_open")?).await,
        Scenario::PagedHistory => {
            run_paged_history(require_db_path(&args, "paged_history")?).await
        }
        Scenario::SubmitReply => run_submit_reply(require_db_path(&args, "submit_reply")?).await,
        Scenario::ReplyBackpressure => {
            run_reply_backpressure(require_db_path(&args, "reply_backpressure")?).await
        }
        Scenario::StaleReplySuppression => {
            run_stale_reply_suppression(require_db_path(&args, "stale_reply_suppression")?).await
        }
        Scenario::All => run_all(require_db_path(&args, "all")?).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

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

async fn run_all(db_path: &str) -> RunnerResult<()> {
    run_seed_on_open(db_path).await?;
    run_paged_history(db_path).await?;
    run_submit_reply(db_path).await?;
    run_reply_backpressure(db_path).await?;
    run_stale_reply_suppression(db_path).await?;
    println!("all_passed=true");
    Ok(())
}

async fn open_session(db_path: &str) -> RunnerResult<(Arc<SqliteStorage>, ChatSession)> {
    let storage = Arc::new(SqliteStorage::open(db_path).await.context(
        StorageValidationSnafu {
            stage: "runner-open-storage",
        },
    )?);
    let generator =
        SimulatedReplyGenerator::with_default_template(Duration::from_millis(50));
    let session = ChatSession::new(
        storage.clone(),
        Arc::new(generator),
        SessionConfig {
            page_size: 20,
            page_delay: Duration::from_millis(25),
            seed_pages: 5,
        },
    );
    Ok((storage, session))
}

async fn run_seed_on_open(db_path: &str) -> RunnerResult<()> {
    let (storage, mut session) = open_session(db_path).await?;
    let room = ChatroomId::new_v7();

    session.open_chatroom(room);

    let empty_at_open = session.visible().is_empty();
    session.load_more().context(SessionOperationSnafu {
        stage: "scenario-seed-on-open-first-load",
    })?;
    session.settle().await;

    let visible_count = session.visible().len();
    let has_more = session.has_more();
    let stored = storage
        .load_log(room)
        .context(StorageValidationSnafu {
            stage: "scenario-seed-on-open-load",
        })?
        .unwrap_or_default();
    let seeded_count = decode_log(&stored).map(|log| log.len()).unwrap_or(0);

    println!("empty_at_open={empty_at_open}");
    println!("visible_count={visible_count}");
    println!("has_more={has_more}");
    println!("seeded_count={seeded_count}");

    if !empty_at_open || visible_count != 20 || !has_more || seeded_count != 100 {
        return ScenarioFailedSnafu {
            stage: "scenario-seed-on-open-assert",
            scenario: "seed_on_open",
            reason: format!(
                "expected an empty window, then 20 visible over 100 seeded, got empty_at_open={empty_at_open} visible_count={visible_count} seeded_count={seeded_count}"
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_paged_history(db_path: &str) -> RunnerResult<()> {
    let (_storage, mut session) = open_session(db_path).await?;
    session.open_chatroom(ChatroomId::new_v7());

    let mut visible_counts = vec![session.visible().len()];
    while session.has_more() {
        session.load_more().context(SessionOperationSnafu {
            stage: "scenario-paged-history-load-more",
        })?;
        session.settle().await;
        visible_counts.push(session.visible().len());
    }

    let exhausted_rejected = session.load_more().is_err();
    let pagination_ok = visible_counts == vec![0, 20, 40, 60, 80, 100];

    println!(
        "visible_counts={}",
        visible_counts
            .iter()
            .map(|count| count.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("exhausted_rejected={exhausted_rejected}");

    if !pagination_ok || !exhausted_rejected {
        return ScenarioFailedSnafu {
            stage: "scenario-paged-history-assert",
            scenario: "paged_history",
            reason: "pagination did not reveal one page per round".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_submit_reply(db_path: &str) -> RunnerResult<()> {
    let (storage, mut session) = open_session(db_path).await?;
    let room = ChatroomId::new_v7();
    session.open_chatroom(room);

    let user_id = session
        .submit("hello from the runner", None)
        .map_err(|rejection| RunnerError::ScenarioFailed {
            stage: "scenario-submit-reply-submit",
            scenario: "submit_reply",
            reason: format!("submit rejected: {rejection:?}"),
        })?;
    let pending_after_submit = session.reply_pending();

    session.settle().await;

    let reply = session.visible().last().cloned();
    let reply_delivered = reply
        .as_ref()
        .is_some_and(|message| message.sender == Sender::Agent && message.id > user_id);
    let stored = storage
        .load_log(room)
        .context(StorageValidationSnafu {
            stage: "scenario-submit-reply-load",
        })?
        .unwrap_or_default();
    let persisted_count = decode_log(&stored).map(|log| log.len()).unwrap_or(0);

    println!("pending_after_submit={pending_after_submit}");
    println!("reply_delivered={reply_delivered}");
    println!("persisted_count={persisted_count}");

    if !pending_after_submit || !reply_delivered || persisted_count != 102 {
        return ScenarioFailedSnafu {
            stage: "scenario-submit-reply-assert",
            scenario: "submit_reply",
            reason: "submit/reply round did not persist both messages".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_reply_backpressure(db_path: &str) -> RunnerResult<()> {
    let (_storage, mut session) = open_session(db_path).await?;
    session.open_chatroom(ChatroomId::new_v7());

    session
        .submit("first", None)
        .map_err(|rejection| RunnerError::ScenarioFailed {
            stage: "scenario-reply-backpressure-first",
            scenario: "reply_backpressure",
            reason: format!("first submit rejected: {rejection:?}"),
        })?;
    let second_blocked = matches!(
        session.submit("second", None),
        Err(SubmitRejection::ReplyPending)
    );

    session.settle().await;
    let second_after_settle = session.submit("second", None).is_ok();
    session.settle().await;

    println!("second_blocked={second_blocked}");
    println!("second_after_settle={second_after_settle}");

    if !second_blocked || !second_after_settle {
        return ScenarioFailedSnafu {
            stage: "scenario-reply-backpressure-assert",
            scenario: "reply_backpressure",
            reason: "pending reply did not gate the second submission".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_stale_reply_suppression(db_path: &str) -> RunnerResult<()> {
    let (storage, mut session) = open_session(db_path).await?;
    let room_a = ChatroomId::new_v7();
    let room_b = ChatroomId::new_v7();

    session.open_chatroom(room_a);
    session
        .submit("trigger", None)
        .map_err(|rejection| RunnerError::ScenarioFailed {
            stage: "scenario-stale-reply-submit",
            scenario: "stale_reply_suppression",
            reason: format!("submit rejected: {rejection:?}"),
        })?;
    session.open_chatroom(room_b);

    tokio::time::sleep(Duration::from_millis(200)).await;
    session.pump();

    let stored_a = storage
        .load_log(room_a)
        .context(StorageValidationSnafu {
            stage: "scenario-stale-reply-load",
        })?
        .unwrap_or_default();
    let log_a = decode_log(&stored_a).unwrap_or_default();
    let reply_suppressed = log_a.len() == 101
        && log_a.iter().all(|message| message.sender != Sender::Agent
            || message.content.starts_with("Dummy message"));
    let active_is_b = session.active_chatroom() == Some(room_b);

    println!("reply_suppressed={reply_suppressed}");
    println!("active_is_b={active_is_b}");

    if !reply_suppressed || !active_is_b {
        return ScenarioFailedSnafu {
            stage: "scenario-stale-reply-assert",
            scenario: "stale_reply_suppression",
            reason: "a reply for the abandoned room leaked into state".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
