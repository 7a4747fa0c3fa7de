use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::cli::commands_pipeline::{
    handle_channel, handle_errors, handle_recover, handle_run, handle_tick, handle_title, handle_work,
};
use crate::cli::error::{parse_phase, parse_stage_status, user_error, validate_channel_name, validate_non_empty};
use crate::cli::output::{
    format_lock_table, format_log_lines, format_phase_summary, format_stuck, format_task_list,
    format_task_summary, print_json, TaskView,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::DbConnection;
use crate::logging;
use crate::models::{LockGrant, StageRecord, Task};
use crate::progress::{attempt_lines, progress, progress_for_task};
use crate::repo::{AcquireOutcome, EventRepo, LockRepo, StageLogRepo, StageRepo, TaskFilter, TaskRepo};
use crate::utils::{format_ts, parse_date_expr, parse_duration};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Stage queue, phase locks and channel scheduling for a five-phase content pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, inspect and steer tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskCommands,
    },
    /// Drive stage transitions by hand
    Stage {
        #[command(subcommand)]
        subcommand: StageCommands,
    },
    /// Inspect and administer phase locks
    Lock {
        #[command(subcommand)]
        subcommand: LockCommands,
    },
    /// Channel cadences used by the automation loop
    Channel {
        #[command(subcommand)]
        subcommand: ChannelCommands,
    },
    /// Pre-generated title pool
    Title {
        #[command(subcommand)]
        subcommand: TitleCommands,
    },
    /// Error ledger: report, claim, resolve and retry classified failures
    Errors {
        #[command(subcommand)]
        subcommand: ErrorCommands,
    },
    /// Run one automation tick now
    Tick {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Run the automation loop with its sweepers
    Run {
        /// Stop after this many rounds
        #[arg(long)]
        max_ticks: Option<usize>,
    },
    /// Work one phase: run the next waiting task (or a given one)
    Work {
        /// Phase to work (schedule, script, image, video, youtube)
        phase: String,
        /// Work this task instead of the oldest waiting one
        #[arg(long)]
        task: Option<i64>,
        /// Keep working until interrupted, sleeping between empty polls
        #[arg(long = "loop")]
        keep_going: bool,
        /// Command run for the phase; required for every phase but schedule
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Recover interrupted work
    Recover {
        /// Only fail stages and free locks older than this (e.g. 30m)
        #[arg(long)]
        stale: Option<String>,
        /// Also repair completed records left on a non-terminal phase
        #[arg(long)]
        repair: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Queue a task at a scheduled time
    Add {
        owner: String,
        channel: String,
        /// Task title
        #[arg(trailing_var_arg = true, required = true)]
        title: Vec<String>,
        /// Scheduled time (YYYY-MM-DDTHH:MM, now, tomorrow, +2h, ...)
        #[arg(long, default_value = "now")]
        at: String,
        #[arg(long)]
        category: Option<String>,
        /// Reference to already generated content
        #[arg(long)]
        content_id: Option<String>,
        /// Add even if the channel already has a task in that minute
        #[arg(long)]
        force: bool,
    },
    /// List tasks
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Include finished tasks
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show a task with its stage and history
    Show {
        id: i64,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Cancel a waiting or processing task
    Cancel { id: i64 },
    /// Put a failed task back to waiting at its phase
    Retry { id: i64 },
    /// Print a task's progress percentage
    Progress {
        id: i64,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum StageCommands {
    /// waiting → processing
    Acquire { id: i64, phase: String },
    /// processing → next phase waiting (or done after youtube)
    Complete { id: i64, phase: String },
    /// processing → failed
    Fail {
        id: i64,
        phase: String,
        /// Failure reason
        #[arg(trailing_var_arg = true, required = true)]
        reason: Vec<String>,
    },
    /// processing → waiting without counting a retry
    Requeue { id: i64, phase: String },
    /// Show a task's log lines
    Log {
        id: i64,
        #[arg(long)]
        phase: Option<String>,
        /// Only lines at or after this time
        #[arg(long)]
        since: Option<String>,
        /// Only lines before this time
        #[arg(long)]
        until: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Queue counts per phase
    Summary {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List stages processing for too long
    Health {
        /// Threshold (default: stage.stuck_timeout, 10m)
        #[arg(long)]
        threshold: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete finished tasks older than N days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Subcommand)]
pub enum LockCommands {
    /// List all phase locks
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Take a phase lock for a task
    Acquire { kind: String, task: i64 },
    /// Release a phase lock held by a task
    Release { kind: String, task: i64 },
    /// Release a phase lock whoever holds it
    ForceRelease { kind: String },
}

#[derive(Subcommand)]
pub enum ChannelCommands {
    /// Create or replace a channel's cadence
    Set {
        owner: String,
        channel: String,
        /// Fixed interval length
        #[arg(long, conflicts_with = "slot")]
        every: Option<i64>,
        /// Interval unit: minutes, hours or days
        #[arg(long, default_value = "days")]
        unit: String,
        /// Time of day for day intervals (HH:MM)
        #[arg(long)]
        at: Option<String>,
        /// Weekday slots, e.g. 1=09:00,18:00 (0 = Sunday); repeatable
        #[arg(long)]
        slot: Vec<String>,
        /// Comma-separated categories
        #[arg(long, required = true)]
        categories: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// List channels
    List {
        /// Include inactive channels
        #[arg(long)]
        all: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Next due time of a channel
    Next {
        owner: String,
        channel: String,
        /// Reference time (default: now)
        #[arg(long)]
        from: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Free weekday slots of today and tomorrow
    Slots {
        owner: String,
        channel: String,
        #[arg(long, default_value_t = crate::schedule::DEFAULT_SLOT_LIMIT)]
        limit: usize,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Stop scheduling a channel
    Disable { owner: String, channel: String },
    /// Resume scheduling a channel
    Enable { owner: String, channel: String },
}

#[derive(Subcommand)]
pub enum TitleCommands {
    /// Add a title to a category's pool
    Add {
        category: String,
        #[arg(trailing_var_arg = true, required = true)]
        title: Vec<String>,
    },
    /// Available and used titles per category
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ErrorCommands {
    /// Record a failure
    Report {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        context: Option<String>,
        /// warning, error or critical
        #[arg(long, default_value = "error")]
        severity: String,
        #[arg(long)]
        task: Option<i64>,
        #[arg(long)]
        phase: Option<String>,
    },
    /// List recorded failures
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Claim the most urgent pending failure
    Claim {
        #[arg(long)]
        worker: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Mark a claimed failure as being processed
    Start {
        id: i64,
        #[arg(long)]
        worker: String,
    },
    /// Resolve a failure
    Resolve {
        id: i64,
        #[arg(trailing_var_arg = true, required = true)]
        resolution: Vec<String>,
    },
    /// Ignore a failure
    Ignore { id: i64 },
    /// Record a failed handling attempt
    Retry { id: i64 },
    /// Return stuck claims to pending
    Sweep,
    /// Counts by status, severity and kind
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Loaded configuration plus an open connection
pub(crate) struct Session {
    pub config: Config,
    pub conn: Connection,
    pub clock: SystemClock,
}

impl Session {
    pub fn open() -> Result<Self> {
        let config = Config::load()?;
        let conn = DbConnection::connect(&config).context("Failed to connect to database")?;
        Ok(Self {
            config,
            conn,
            clock: SystemClock,
        })
    }

    pub fn now(&self) -> i64 {
        self.clock.now_ts()
    }
}

pub(crate) fn phase_arg(s: &str) -> crate::models::Phase {
    parse_phase(s).unwrap_or_else(|e| user_error(&e))
}

/// Parse a date expression argument, exiting with a user error if malformed
pub(crate) fn date_arg(expr: &str) -> i64 {
    parse_date_expr(expr, Local::now()).unwrap_or_else(|e| user_error(&e.to_string()))
}

pub(crate) fn duration_arg(expr: &str) -> i64 {
    parse_duration(expr).unwrap_or_else(|e| user_error(&e.to_string()))
}

pub fn run() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print()?;
                return Ok(());
            }
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // Long-running commands report their work; admin commands stay quiet
    let level = match cli.command {
        Commands::Tick { .. } | Commands::Run { .. } | Commands::Work { .. } => "info",
        _ => "warn",
    };
    logging::init(level);

    handle_command(cli)
}

fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Task { subcommand } => handle_task(subcommand),
        Commands::Stage { subcommand } => handle_stage(subcommand),
        Commands::Lock { subcommand } => handle_lock(subcommand),
        Commands::Channel { subcommand } => handle_channel(subcommand),
        Commands::Title { subcommand } => handle_title(subcommand),
        Commands::Errors { subcommand } => handle_errors(subcommand),
        Commands::Tick { json } => handle_tick(json),
        Commands::Run { max_ticks } => handle_run(max_ticks),
        Commands::Work { phase, task, keep_going, command } => handle_work(&phase, task, keep_going, command),
        Commands::Recover { stale, repair, json } => handle_recover(stale, repair, json),
    }
}

/// Task with its record, current-phase progress and queue position
pub(crate) fn task_view(conn: &Connection, task: Task, stage: StageRecord) -> Result<TaskView> {
    let task_id = stage.task_id;
    let lines = attempt_lines(conn, &stage)?;
    let progress = progress(stage.phase, stage.status, &lines, task.expected_total);
    let position = StageRepo::position(conn, task_id)?;
    Ok(TaskView {
        task,
        stage,
        progress,
        position,
    })
}

fn load_view(conn: &Connection, id: i64) -> Result<TaskView> {
    let task = TaskRepo::get_by_id(conn, id)?.unwrap_or_else(|| user_error(&format!("Task {} not found", id)));
    let stage = StageRepo::require(conn, id)?;
    task_view(conn, task, stage)
}

fn handle_task(cmd: TaskCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        TaskCommands::Add { owner, channel, title, at, category, content_id, force } => {
            for (value, field) in [(&owner, "owner"), (&channel, "channel")] {
                if let Err(e) = validate_channel_name(value, field) {
                    user_error(&e);
                }
            }
            let title = title.join(" ");
            if let Err(e) = validate_non_empty(&title, "Title") {
                user_error(&e);
            }
            let scheduled_ts = date_arg(&at);
            if !force && TaskRepo::exists_at_minute(conn, &owner, &channel, scheduled_ts)? {
                user_error(&format!(
                    "{}/{} already has a task at {}. Use --force to add another.",
                    owner,
                    channel,
                    format_ts(scheduled_ts)
                ));
            }

            let now = session.now();
            let mut task = Task::new(&owner, &channel, &title, scheduled_ts, now);
            task.category = category;
            task.content_id = content_id;
            let task = TaskRepo::create_scheduled(conn, task, now)?;
            println!(
                "Created task {} for {}/{} at {}",
                task.id.unwrap_or_default(),
                owner,
                channel,
                format_ts(scheduled_ts)
            );
        }
        TaskCommands::List { owner, channel, phase, status, all, limit, json } => {
            let filter = TaskFilter {
                owner,
                channel,
                phase: phase.as_deref().map(phase_arg),
                status: status
                    .as_deref()
                    .map(|s| parse_stage_status(s).unwrap_or_else(|e| user_error(&e))),
                include_done: all,
                limit,
            };
            let mut views = Vec::new();
            for (task, stage) in TaskRepo::list(conn, &filter)? {
                views.push(task_view(conn, task, stage)?);
            }
            if json {
                print_json(&views)?;
            } else {
                println!("{}", format_task_list(&views));
            }
        }
        TaskCommands::Show { id, json } => {
            let view = load_view(conn, id)?;
            let events = EventRepo::list_for_task(conn, id)?;
            if json {
                print_json(&serde_json::json!({ "task": view, "events": events }))?;
            } else {
                print!("{}", format_task_summary(&view, &events));
            }
        }
        TaskCommands::Cancel { id } => {
            let record = StageRepo::cancel(conn, id, session.now())?;
            println!("Cancelled task {} at {}", id, record.phase);
        }
        TaskCommands::Retry { id } => {
            let record = StageRepo::retry_stage(conn, id, session.now())?;
            println!(
                "Task {} back to waiting at {} (retry {})",
                id, record.phase, record.retry_count
            );
        }
        TaskCommands::Progress { id, json } => {
            let progress = progress_for_task(conn, id)?
                .unwrap_or_else(|| user_error(&format!("Task {} not found", id)));
            if json {
                let stage = StageRepo::require(conn, id)?;
                print_json(&serde_json::json!({
                    "task_id": id,
                    "phase": stage.phase,
                    "status": stage.status,
                    "progress": progress,
                }))?;
            } else {
                println!("{}%", progress);
            }
        }
    }
    Ok(())
}

fn handle_stage(cmd: StageCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        StageCommands::Acquire { id, phase } => {
            let phase = phase_arg(&phase);
            match StageRepo::acquire_stage(conn, id, phase, session.now())? {
                AcquireOutcome::Acquired(_) => println!("Task {} {} processing", id, phase),
                AcquireOutcome::NotEligible { current } => user_error(&format!(
                    "Task {} is not waiting at {} (currently {}/{})",
                    id, phase, current.phase, current.status
                )),
            }
        }
        StageCommands::Complete { id, phase } => {
            let record = StageRepo::complete_stage(conn, id, phase_arg(&phase), session.now())?;
            if record.is_done() {
                println!("Task {} done", id);
            } else {
                println!("Task {} now {} {}", id, record.phase, record.status);
            }
        }
        StageCommands::Fail { id, phase, reason } => {
            let reason = reason.join(" ");
            StageRepo::fail_stage(conn, id, phase_arg(&phase), &reason, session.now())?;
            println!("Task {} failed: {}", id, reason);
        }
        StageCommands::Requeue { id, phase } => {
            let record = StageRepo::requeue(conn, id, phase_arg(&phase), session.now())?;
            println!("Task {} back to waiting at {}", id, record.phase);
        }
        StageCommands::Log { id, phase, since, until, json } => {
            StageRepo::require(conn, id)?;
            let lines = StageLogRepo::list(
                conn,
                id,
                phase.as_deref().map(phase_arg),
                since.as_deref().map(date_arg),
                until.as_deref().map(date_arg),
            )?;
            if json {
                print_json(&lines)?;
            } else {
                println!("{}", format_log_lines(&lines));
            }
        }
        StageCommands::Summary { json } => {
            let summary = StageRepo::summary(conn)?;
            if json {
                print_json(&summary)?;
            } else {
                print!("{}", format_phase_summary(&summary));
            }
        }
        StageCommands::Health { threshold, json } => {
            let threshold = threshold
                .as_deref()
                .map(duration_arg)
                .unwrap_or(session.config.stage_stuck_secs);
            let now = session.now();
            let stuck = StageRepo::stuck(conn, threshold, now)?;
            if json {
                print_json(&stuck)?;
            } else {
                println!("{}", format_stuck(&stuck, now));
            }
        }
        StageCommands::Cleanup { days } => {
            if days < 0 {
                user_error("--days cannot be negative");
            }
            let cutoff = session.now() - days * 86_400;
            let deleted = StageRepo::cleanup(conn, cutoff)?;
            println!("Deleted {} finished task(s)", deleted);
        }
    }
    Ok(())
}

fn handle_lock(cmd: LockCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        LockCommands::List { json } => {
            let locks = LockRepo::list(conn)?;
            if json {
                print_json(&locks)?;
            } else {
                print!("{}", format_lock_table(&locks, session.now()));
            }
        }
        LockCommands::Acquire { kind, task } => {
            let kind = phase_arg(&kind);
            if TaskRepo::get_by_id(conn, task)?.is_none() {
                user_error(&format!("Task {} not found", task));
            }
            let timeout = session.config.lock_timeouts.for_phase(kind);
            let pid = std::process::id() as i64;
            match LockRepo::acquire(conn, kind, task, pid, timeout, session.now())? {
                LockGrant::Fresh => println!("{} lock acquired by task {}", kind, task),
                LockGrant::Reclaimed { previous } => {
                    println!("{} lock reclaimed from task {} by task {}", kind, previous, task)
                }
            }
        }
        LockCommands::Release { kind, task } => {
            let kind = phase_arg(&kind);
            if !LockRepo::release(conn, kind, task)? {
                user_error(&format!("{} lock is not held by task {}", kind, task));
            }
            println!("{} lock released", kind);
        }
        LockCommands::ForceRelease { kind } => {
            let kind = phase_arg(&kind);
            match LockRepo::force_release(conn, kind)? {
                Some(holder) => println!("{} lock released (was held by task {})", kind, holder),
                None => println!("{} lock was free", kind),
            }
        }
    }
    Ok(())
}
