//! sessdex - incremental index over AI coding assistant session logs
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/sessdex/index.db (~/.local/share/sessdex/index.db)
//! - Logs: $XDG_STATE_HOME/sessdex/sessdex.log.<date> (~/.local/state/sessdex/)
//! - Config: $XDG_CONFIG_HOME/sessdex/config.toml (~/.config/sessdex/config.toml)

mod process_lock;
mod sync;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use process_lock::acquire_ingest_guard;
use sessdex_core::format::{format_duration_ms, format_relative_time, format_tokens};
use sessdex_core::{
    AggregateSnapshot, CacheStore, Config, DateDimension, Error as CoreError, ExternalField,
    IndexService, RecordState, Scope,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sessdex")]
#[command(about = "Index and summarize AI coding assistant sessions")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/sessdex/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the index from the configured roots
    Sync(sync::SyncArgs),

    /// Aggregate totals over indexed sessions
    Stats {
        /// Restrict to these projects (repeatable)
        #[arg(long, conflicts_with_all = ["since", "until"])]
        project: Vec<String>,

        /// First day to include (YYYY-MM-DD, UTC)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Last day to include (YYYY-MM-DD, UTC)
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Timestamp that --since/--until filter on
        #[arg(long, value_enum, default_value_t = DateField::Updated)]
        by: DateField,

        /// Refresh the selected sessions before reporting
        #[arg(long)]
        refresh: bool,
    },

    /// List indexed sessions, most recently updated first
    Sessions {
        /// Restrict to these projects (repeatable)
        #[arg(long)]
        project: Vec<String>,

        /// Maximum number of sessions to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Set or clear a session's title
    Title {
        session_id: String,

        /// New title; omit to clear
        title: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DateField {
    Created,
    Updated,
}

impl From<DateField> for DateDimension {
    fn from(field: DateField) -> Self {
        match field {
            DateField::Created => DateDimension::CreatedAt,
            DateField::Updated => DateDimension::UpdatedAt,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard =
        sessdex_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("sessdex starting");

    match cli.command {
        Commands::Sync(args) => sync::run(&config, &args),
        Commands::Stats {
            project,
            since,
            until,
            by,
            refresh,
        } => {
            let scope = stats_scope(project, since, until, by.into())?;
            if refresh {
                refresh_scope(&config, scope.clone())?;
            }
            run_stats(&config, &scope)
        }
        Commands::Sessions { project, limit } => run_sessions(&config, project, limit),
        Commands::Title { session_id, title } => run_title(&config, &session_id, title),
    }
}

/// Multi-threaded runtime for commands that drive the coordinator.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sessdex-worker")
        .build()
        .context("failed to start async runtime")
}

fn stats_scope(
    project: Vec<String>,
    since: Option<NaiveDate>,
    until: Option<NaiveDate>,
    dimension: DateDimension,
) -> Result<Scope> {
    if !project.is_empty() {
        return Ok(Scope::projects(project));
    }
    if since.is_none() && until.is_none() {
        return Ok(Scope::All);
    }
    if let (Some(since), Some(until)) = (since, until) {
        if since > until {
            anyhow::bail!("--since {since} is after --until {until}");
        }
    }

    let start = since.map(day_start).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    // --until names a whole day, so the range ends at the following midnight
    let end = match until {
        Some(day) => day_start(day) + ChronoDuration::days(1),
        None => Utc::now() + ChronoDuration::days(1),
    };
    Ok(Scope::date_range(start, end, dimension))
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

fn refresh_scope(config: &Config, scope: Scope) -> Result<()> {
    let db_path = config.store_path();
    let _ingest_guard = acquire_ingest_guard(&db_path).context("failed to acquire process lock")?;

    runtime()?.block_on(async {
        let service = IndexService::start(config).context("failed to start index")?;
        let summary = service.refresh(scope).await;
        service.shutdown().await.context("failed to stop index")?;
        let summary = summary.context("refresh failed")?;

        tracing::info!(
            parsed = summary.parsed,
            written = summary.records_written,
            "Scoped refresh complete"
        );
        if summary.store_failed {
            anyhow::bail!(
                "some writes could not be committed; totals may be stale (see {})",
                sessdex_core::logging::log_file_for(Utc::now().date_naive()).display()
            );
        }
        Ok(())
    })
}

/// Open the store for reading, or `None` when nothing was indexed yet.
fn open_existing_store(config: &Config) -> Result<Option<CacheStore>> {
    let db_path = config.store_path();
    if !db_path.exists() {
        println!("No sessions indexed yet. Run `sessdex sync` first.");
        return Ok(None);
    }
    let store = CacheStore::open(&db_path).context("failed to open store")?;
    Ok(Some(store))
}

fn run_stats(config: &Config, scope: &Scope) -> Result<()> {
    let Some(store) = open_existing_store(config)? else {
        return Ok(());
    };
    let snapshot = store.query(scope).context("failed to query store")?;
    print_snapshot(scope, &snapshot);
    Ok(())
}

fn print_snapshot(scope: &Scope, s: &AggregateSnapshot) {
    println!("Scope:             {}", scope);
    println!("Sessions:          {}", s.sessions);
    if s.failed_sessions > 0 {
        println!("Failed to parse:   {}", s.failed_sessions);
    }
    if s.pending_sessions > 0 {
        println!("Not yet parsed:    {}", s.pending_sessions);
    }
    println!(
        "Messages:          {} (user {}, assistant {}, tool {}, reasoning {}, other {})",
        s.messages.total(),
        s.messages.user,
        s.messages.assistant,
        s.messages.tool,
        s.messages.reasoning,
        s.messages.other
    );
    println!(
        "Tokens:            {} (input {}, output {}, cache read {}, cache write {})",
        format_tokens(s.tokens.total),
        format_tokens(s.tokens.input),
        format_tokens(s.tokens.output),
        format_tokens(s.tokens.cache_read),
        format_tokens(s.tokens.cache_creation)
    );
    println!(
        "Duration:          {} (active {})",
        format_duration_ms(s.duration_ms),
        format_duration_ms(s.active_time_ms)
    );
    println!("Terminal sessions: {}", s.terminal_sessions);
    println!("Review sessions:   {}", s.review_sessions);
    if let (Some(first), Some(last)) = (s.first_created_at, s.last_updated_at) {
        println!(
            "Active:            {} to {}",
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        );
    }
}

fn run_sessions(config: &Config, project: Vec<String>, limit: usize) -> Result<()> {
    let Some(store) = open_existing_store(config)? else {
        return Ok(());
    };
    let scope = if project.is_empty() {
        Scope::All
    } else {
        Scope::projects(project)
    };
    let sessions = store
        .list_sessions(&scope, limit)
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions match {}.", scope);
        return Ok(());
    }

    println!(
        "{:<36}  {:<11}  {:<16}  {:>9}  {:>6}  {:>7}  TITLE",
        "SESSION", "SOURCE", "PROJECT", "UPDATED", "MSGS", "TOKENS"
    );
    for record in &sessions {
        let status = match record.state() {
            RecordState::Stub => "(pending)".to_string(),
            RecordState::Failed => "(parse error)".to_string(),
            RecordState::Complete => record.title.clone().unwrap_or_default(),
        };
        println!(
            "{:<36}  {:<11}  {:<16}  {:>9}  {:>6}  {:>7}  {}",
            record.session_id,
            record.source.display_name(),
            record.project.as_deref().unwrap_or("-"),
            format_relative_time(record.updated_at),
            record.messages.total(),
            format_tokens(record.tokens.total),
            status
        );
    }
    Ok(())
}

fn run_title(config: &Config, session_id: &str, title: Option<String>) -> Result<()> {
    let Some(store) = open_existing_store(config)? else {
        return Ok(());
    };
    let cleared = title.is_none();
    match store.set_external_field(session_id, &ExternalField::Title(title)) {
        Ok(()) => {}
        Err(CoreError::SessionNotFound(id)) => anyhow::bail!("no indexed session with id {id}"),
        Err(e) => return Err(e).context("failed to update title"),
    }
    if cleared {
        println!("Cleared title of {session_id}");
    } else {
        println!("Updated title of {session_id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_until_covers_the_whole_day() {
        let scope = stats_scope(
            Vec::new(),
            Some(date("2025-01-01")),
            Some(date("2025-01-31")),
            DateDimension::UpdatedAt,
        )
        .unwrap();
        match scope {
            Scope::DateRange { start, end, .. } => {
                assert_eq!(start, day_start(date("2025-01-01")));
                assert_eq!(end, day_start(date("2025-02-01")));
            }
            other => panic!("unexpected scope {other}"),
        }
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        assert!(stats_scope(
            Vec::new(),
            Some(date("2025-02-01")),
            Some(date("2025-01-01")),
            DateDimension::CreatedAt,
        )
        .is_err());
    }

    #[test]
    fn test_projects_take_precedence_over_all() {
        let scope = stats_scope(vec!["alpha".into()], None, None, DateDimension::UpdatedAt).unwrap();
        assert_eq!(scope, Scope::project("alpha"));
        assert_eq!(
            stats_scope(Vec::new(), None, None, DateDimension::UpdatedAt).unwrap(),
            Scope::All
        );
    }
}
