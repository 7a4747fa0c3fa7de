//! The automation control loop
//!
//! A tick walks every active channel cadence, works out the channel's next due
//! slot and, when that slot is free and inside the horizon, asks a
//! [`ContentGenerator`] for a title and queues a new task at that time.
//!
//! A tick is one SQLite transaction. Each channel runs in its own savepoint,
//! so a channel that fails leaves nothing behind while the others commit.
//! Storage failures abort the whole tick instead and roll everything back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDateTime};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::StageError;
use crate::models::{CadenceRow, ChannelCadence, Severity, Task};
use crate::repo::{atomically, CadenceRepo, ErrorLedgerRepo, LockRepo, NewError, TaskRepo, TitleRepo};
use crate::schedule::{next_due, within_horizon};
use crate::utils::local_ts;

/// What the generator is asked to produce
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub owner: String,
    pub channel: String,
    pub category: String,
    pub scheduled_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    pub content_id: Option<String>,
    pub title: String,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    /// Nothing to generate from right now; the channel is skipped, not failed
    #[error("no inventory for category '{0}'")]
    NoInventory(String),

    #[error("generation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Produces the title (and optionally a content reference) of a new task
pub trait ContentGenerator {
    fn generate(
        &mut self,
        conn: &Connection,
        request: &GenerateRequest,
    ) -> std::result::Result<GeneratedContent, GenerateError>;
}

/// Takes pre-generated titles from the title pool, oldest first
#[derive(Debug, Default)]
pub struct TitlePoolGenerator;

impl ContentGenerator for TitlePoolGenerator {
    fn generate(
        &mut self,
        conn: &Connection,
        request: &GenerateRequest,
    ) -> std::result::Result<GeneratedContent, GenerateError> {
        match TitleRepo::take(conn, &request.category)? {
            Some(candidate) => Ok(GeneratedContent {
                content_id: None,
                title: candidate.title,
            }),
            None => Err(GenerateError::NoInventory(request.category.clone())),
        }
    }
}

/// Aggregate result of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Minimum spacing between real ticks; calls in between get the last summary
#[derive(Debug, Clone)]
pub struct TickThrottle {
    min_interval_secs: i64,
    last: Option<(DateTime<Local>, TickSummary)>,
}

impl TickThrottle {
    pub fn new(min_interval_secs: i64) -> Self {
        Self {
            min_interval_secs,
            last: None,
        }
    }

    /// The cached summary if the last real tick is too recent
    pub fn cached(&self, now: DateTime<Local>) -> Option<TickSummary> {
        let (at, summary) = self.last?;
        let elapsed = (now - at).num_seconds();
        (elapsed >= 0 && elapsed < self.min_interval_secs).then_some(summary)
    }

    pub fn record(&mut self, at: DateTime<Local>, summary: TickSummary) {
        self.last = Some((at, summary));
    }
}

/// Per-channel result inside a tick
#[derive(Debug)]
enum ChannelOutcome {
    Scheduled(Task),
    Skipped(String),
}

/// Whether an error means the store itself is unusable
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let sqlite = cause.downcast_ref::<rusqlite::Error>().or_else(|| {
            match cause.downcast_ref::<StageError>() {
                Some(StageError::Storage(inner)) => Some(inner),
                _ => None,
            }
        });
        matches!(
            sqlite.and_then(rusqlite::Error::sqlite_error_code),
            Some(
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::DiskFull
                    | ErrorCode::NotADatabase
                    | ErrorCode::ReadOnly
            )
        )
    })
}

/// Drives ticks for all channels
pub struct AutomationLoop<C: Clock, G: ContentGenerator> {
    clock: C,
    generator: G,
    rng: StdRng,
    throttle: TickThrottle,
    config: Config,
}

impl<C: Clock, G: ContentGenerator> AutomationLoop<C, G> {
    pub fn new(config: Config, clock: C, generator: G) -> Self {
        Self::with_rng(config, clock, generator, StdRng::from_entropy())
    }

    /// Deterministic category choice, for tests and replays
    pub fn with_rng(config: Config, clock: C, generator: G, rng: StdRng) -> Self {
        Self {
            throttle: TickThrottle::new(config.automation.min_interval_secs),
            clock,
            generator,
            rng,
            config,
        }
    }

    /// Run one tick. Returns the cached summary when throttled.
    pub fn tick(&mut self, conn: &Connection) -> Result<TickSummary> {
        if !self.config.automation.enabled {
            debug!("automation disabled");
            return Ok(TickSummary::default());
        }

        let now = self.clock.now();
        if let Some(summary) = self.throttle.cached(now) {
            debug!(success = summary.success, failed = summary.failed, skipped = summary.skipped;
                "tick throttled, returning cached summary");
            return Ok(summary);
        }

        let tx = conn.unchecked_transaction()?;
        let rows = CadenceRepo::list(&tx, true)?;
        let mut summary = TickSummary::default();

        for row in rows {
            let label = format!("{}/{}", row.owner, row.channel);
            match atomically(&tx, || self.process_channel(&tx, row, now)) {
                Ok(ChannelOutcome::Scheduled(task)) => {
                    info!(channel = label.as_str(), task = task.id.unwrap_or_default(),
                        scheduled_ts = task.scheduled_ts; "task scheduled");
                    summary.success += 1;
                }
                Ok(ChannelOutcome::Skipped(reason)) => {
                    debug!(channel = label.as_str(), reason = reason.as_str(); "channel skipped");
                    summary.skipped += 1;
                }
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => {
                    warn!(channel = label.as_str(), error = format!("{:#}", err).as_str();
                        "channel failed");
                    summary.failed += 1;
                    // The channel's savepoint is gone; the ledger entry lands
                    // in the tick transaction
                    if let Err(report_err) = self.report_channel_failure(&tx, &label, &err) {
                        if is_fatal(&report_err) {
                            return Err(report_err);
                        }
                        error!(channel = label.as_str(), error = format!("{:#}", report_err).as_str();
                            "could not record channel failure");
                    }
                }
            }
        }

        tx.commit()?;
        self.throttle.record(now, summary);
        info!(success = summary.success, failed = summary.failed, skipped = summary.skipped;
            "tick finished");
        Ok(summary)
    }

    fn process_channel(
        &mut self,
        conn: &Connection,
        row: CadenceRow,
        now: DateTime<Local>,
    ) -> Result<ChannelOutcome> {
        let channel = match ChannelCadence::try_from(row) {
            Ok(channel) => channel,
            Err(err) => return Ok(ChannelOutcome::Skipped(err.to_string())),
        };

        let naive_now = now.naive_local();
        let Some(due) = next_due(&channel.cadence, naive_now, naive_now) else {
            return Ok(ChannelOutcome::Skipped("no upcoming slot".to_string()));
        };
        if !within_horizon(due, naive_now, self.config.automation.horizon_days) {
            return Ok(ChannelOutcome::Skipped(format!("{} is outside the horizon", due)));
        }
        let Some(scheduled_ts) = local_ts(&due) else {
            return Ok(ChannelOutcome::Skipped(format!("{} does not exist locally", due)));
        };
        if TaskRepo::exists_at_minute(conn, &channel.owner, &channel.channel, scheduled_ts)? {
            return Ok(ChannelOutcome::Skipped(format!("{} already booked", due)));
        }

        let Some(category) = channel.categories.choose(&mut self.rng).cloned() else {
            return Ok(ChannelOutcome::Skipped("no categories".to_string()));
        };
        let request = GenerateRequest {
            owner: channel.owner.clone(),
            channel: channel.channel.clone(),
            category: category.clone(),
            scheduled_at: due,
        };
        let content = match self.generator.generate(conn, &request) {
            Ok(content) => content,
            Err(GenerateError::NoInventory(category)) => {
                return Ok(ChannelOutcome::Skipped(format!("no inventory for '{}'", category)))
            }
            Err(err @ GenerateError::Failed(_)) => return Err(err.into()),
            Err(GenerateError::Storage(err)) => return Err(err),
        };

        let now_ts = now.timestamp();
        let mut task = Task::new(&channel.owner, &channel.channel, &content.title, scheduled_ts, now_ts);
        task.category = Some(category);
        task.content_id = content.content_id;
        Ok(ChannelOutcome::Scheduled(TaskRepo::create_scheduled(conn, task, now_ts)?))
    }

    fn report_channel_failure(&self, conn: &Connection, label: &str, err: &anyhow::Error) -> Result<()> {
        let kind = match err.downcast_ref::<GenerateError>() {
            Some(GenerateError::Failed(_)) => "generate_failed",
            _ => "channel_failed",
        };
        let message = format!("{:#}", err);
        ErrorLedgerRepo::report(
            conn,
            &NewError {
                kind,
                message: &message,
                context: Some(label),
                severity: Severity::Error,
                task_id: None,
                phase: None,
            },
            self.clock.now_ts(),
        )?;
        Ok(())
    }

    /// Housekeeping run between ticks: stuck ledger claims and stale locks
    pub fn sweep(&self, conn: &Connection) -> Result<()> {
        let now = self.clock.now_ts();
        ErrorLedgerRepo::recover_stuck(conn, self.config.errors.stuck_timeout_secs, now)?;
        LockRepo::release_stale(conn, &self.config.lock_timeouts, now)?;
        Ok(())
    }

    /// Tick and sweep every `automation.poll` until `shutdown` is raised or
    /// `max_ticks` rounds have run. Failed ticks are logged and retried on the
    /// next round.
    pub fn run(&mut self, conn: &Connection, shutdown: &AtomicBool, max_ticks: Option<usize>) -> Result<()> {
        let poll = self.config.automation.poll_secs.max(1);
        info!(poll_secs = poll; "automation loop started");
        let mut rounds = 0;
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.tick(conn) {
                error!(error = format!("{:#}", err).as_str(); "tick failed");
            }
            if let Err(err) = self.sweep(conn) {
                error!(error = format!("{:#}", err).as_str(); "sweep failed");
            }
            rounds += 1;
            if max_ticks.is_some_and(|max| rounds >= max) {
                break;
            }
            for _ in 0..poll {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(StdDuration::from_secs(1));
            }
        }
        info!(rounds = rounds; "automation loop stopped");
        Ok(())
    }
}
