use std::fmt;

use chrono::Duration;
use live_core::model::{Question, SessionDraft, SessionId, SessionStatus, UserId, UserProfile};
use serde::Serialize;
use services::{Clock, LiveConfig, LiveServices};
use storage::repository::SessionFilter;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt as log_fmt, prelude::*};

const DB_URL_KEY: &str = "LIVE_DB_URL";

#[derive(Debug)]
enum ArgsError {
    MissingCommand,
    UnknownCommand(String),
    MissingValue { flag: &'static str },
    MissingSessionId { command: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidStatus { raw: String },
    InvalidSessionId { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingCommand => write!(f, "a subcommand is required"),
            ArgsError::UnknownCommand(cmd) => write!(f, "unknown subcommand: {cmd}"),
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingSessionId { command } => {
                write!(f, "{command} requires a session id")
            }
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidStatus { raw } => write!(f, "invalid --status value: {raw}"),
            ArgsError::InvalidSessionId { raw } => write!(f, "invalid session id: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  app refresh                              [--db <sqlite_url>]");
    eprintln!("  app list [--status <s>] [--level <l>]    [--db <sqlite_url>]");
    eprintln!("  app show <session_id>                    [--db <sqlite_url>]");
    eprintln!("  app leaderboard <session_id>             [--db <sqlite_url>]");
    eprintln!("  app demo                                 [--db <sqlite_url>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:live.sqlite3");
    eprintln!();
    eprintln!("Environment (also read from .env):");
    eprintln!("  {DB_URL_KEY}, LIVE_LOBBY_LEAD_SECS, LIVE_DEFAULT_CAPACITY, RUST_LOG");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Refresh,
    List(SessionFilter),
    Show(SessionId),
    Leaderboard(SessionId),
    Demo,
}

struct Args {
    db_url: String,
    command: Command,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let name = args.next().ok_or(ArgsError::MissingCommand)?;
        let mut db_url = std::env::var(DB_URL_KEY)
            .ok()
            .map_or_else(|| "sqlite://live.sqlite3".into(), normalize_sqlite_url);
        let mut filter = SessionFilter::default();
        let mut positional: Option<String> = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--status" if name == "list" => {
                    let value = require_value(&mut args, "--status")?;
                    let status = value
                        .parse::<SessionStatus>()
                        .map_err(|_| ArgsError::InvalidStatus { raw: value.clone() })?;
                    filter.status = Some(status);
                }
                "--level" if name == "list" => {
                    filter.level = Some(require_value(&mut args, "--level")?);
                }
                other if !other.starts_with("--") && positional.is_none() => {
                    positional = Some(arg);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let session_id = |command: &'static str| -> Result<SessionId, ArgsError> {
            let raw = positional
                .clone()
                .ok_or(ArgsError::MissingSessionId { command })?;
            raw.parse()
                .map_err(|_| ArgsError::InvalidSessionId { raw: raw.clone() })
        };
        let command = match name.as_str() {
            "refresh" => Command::Refresh,
            "list" => Command::List(filter),
            "show" => Command::Show(session_id("show")?),
            "leaderboard" => Command::Leaderboard(session_id("leaderboard")?),
            "demo" => Command::Demo,
            _ => return Err(ArgsError::UnknownCommand(name)),
        };
        if let (Some(extra), Command::Refresh | Command::List(_) | Command::Demo) =
            (&positional, &command)
        {
            return Err(ArgsError::UnknownArg(extra.clone()));
        }

        Ok(Self { db_url, command })
    }
}

/// Accepts `sqlite:<path>`, a bare path, or a full `sqlite://` URL and
/// returns an absolute `sqlite://` URL. In-memory URLs pass through.
fn normalize_sqlite_url(raw: String) -> String {
    let raw = raw.trim();
    if raw.starts_with("sqlite://") || raw.starts_with("sqlite::memory:") {
        return raw.to_owned();
    }
    let path = std::path::Path::new(raw.strip_prefix("sqlite:").unwrap_or(raw));
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };
    format!("sqlite://{}", absolute.display())
}

/// Creates the database file's directory; `SQLite` creates the file itself.
fn ensure_db_dir(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(rest) = db_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_owned(),
        }
        .into());
    }
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(std::fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(log_fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Creates a sample session opening its lobby shortly, with two registered students.
async fn seed_demo(services: &LiveServices, clock: Clock) -> Result<SessionId, Box<dyn std::error::Error>> {
    let admin = UserProfile::admin(UserId::new("demo-admin")?, "demo-admin", "Demo Admin");
    let draft = SessionDraft {
        name: "Demo live practice".into(),
        description: Some("Five mixed questions, weighted by difficulty".into()),
        level: "B1".into(),
        scheduled_start: clock.now() + Duration::minutes(10),
        duration_minutes: 15,
        questions: vec![
            Question::new("grammar-001", 1),
            Question::new("grammar-002", 0),
            Question::new("reading-014", 3).with_weight(2),
            Question::new("reading-015", 2).with_weight(2),
            Question::new("listening-007", 1).with_weight(3),
        ],
        max_participants: Some(30),
        open_enrollment: true,
        allow_immediate: false,
    };
    let session = services.admin().create_session(&admin, draft).await?;

    let registry = services.registry();
    for (id, name) in [("demo-ana", "Ana"), ("demo-ben", "Ben")] {
        let student = UserProfile::student(UserId::new(id)?, id, name);
        registry.register(session.id(), &student).await?;
    }
    info!(session_id = %session.id(), "demo session seeded");
    Ok(session.id())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    if matches!(argv.first().map(String::as_str), None | Some("--help" | "-h")) {
        print_usage();
        return Ok(());
    }

    let parsed = Args::parse(argv.into_iter()).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let config = LiveConfig::from_env()?;
    let clock = Clock::default_clock();
    ensure_db_dir(&parsed.db_url)?;
    let services = LiveServices::new_sqlite(&parsed.db_url, clock, config).await?;

    match parsed.command {
        Command::Refresh => {
            let report = services.catalog().refresh_statuses().await?;
            info!(
                examined = report.examined,
                transitions = report.transitions.len(),
                "status refresh finished"
            );
            print_json(&report)
        }
        Command::List(filter) => print_json(&services.catalog().list_sessions(&filter).await?),
        Command::Show(id) => print_json(&services.catalog().get_session(id).await?),
        Command::Leaderboard(id) => print_json(&services.results().leaderboard(id).await?),
        Command::Demo => {
            let id = seed_demo(&services, clock).await?;
            print_json(&services.catalog().get_session(id).await?)
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
