//! Phase worker harness
//!
//! A worker claims a task's stage with [`StageRepo::acquire_stage`], then the
//! phase-kind lock, runs a [`PhaseExecutor`] and reports the result back to
//! the queue. The lock is held by a [`LockGuard`] so it is released on every
//! exit path; a crashed process is covered by the lock's stale timeout.

pub mod executor;

pub use executor::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};
use rusqlite::Connection;

use crate::clock::Clock;
use crate::config::LockTimeouts;
use crate::error::StageError;
use crate::models::{Phase, Severity, StageRecord, StageStatus, Task};
use crate::repo::{AcquireOutcome, ErrorLedgerRepo, LockRepo, NewError, StageLogRepo, StageRepo, TaskRepo};

/// Shared flag a worker polls to stop early
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Releases a phase lock when dropped
pub struct LockGuard<'a> {
    conn: &'a Connection,
    kind: Phase,
    task_id: i64,
}

impl<'a> LockGuard<'a> {
    fn new(conn: &'a Connection, kind: Phase, task_id: i64) -> Self {
        Self { conn, kind, task_id }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match LockRepo::release(self.conn, self.kind, self.task_id) {
            Ok(true) => {}
            Ok(false) => warn!(kind = self.kind.as_str(), task = self.task_id;
                "lock was no longer held at release"),
            Err(err) => error!(kind = self.kind.as_str(), task = self.task_id,
                error = err.to_string().as_str(); "failed to release lock"),
        }
    }
}

/// What an executor sees while it runs
pub struct PhaseContext<'a> {
    conn: &'a Connection,
    clock: &'a dyn Clock,
    token: CancellationToken,
    task: Task,
    task_id: i64,
    phase: Phase,
}

impl<'a> PhaseContext<'a> {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Append a line to this phase's log; progress is read from these lines
    pub fn log(&self, line: &str) -> Result<()> {
        StageLogRepo::append(self.conn, self.task_id, self.phase, line, self.clock.now_ts())?;
        Ok(())
    }

    /// Number of scenes (or other units) the phase will produce
    pub fn set_expected_total(&mut self, total: i64) -> Result<()> {
        TaskRepo::set_expected_total(self.conn, self.task_id, total, self.clock.now_ts())?;
        self.task.expected_total = Some(total);
        Ok(())
    }

    /// True once the token is raised or the record stopped being processed
    /// here, e.g. because it was cancelled from outside
    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match StageRepo::get(self.conn, self.task_id) {
            Ok(Some(record)) => record.phase != self.phase || record.status != StageStatus::Processing,
            Ok(None) => true,
            Err(err) => {
                warn!(task = self.task_id, error = err.to_string().as_str();
                    "cannot read stage record while polling for cancellation");
                false
            }
        }
    }
}

/// The work of one phase
pub trait PhaseExecutor {
    fn phase(&self) -> Phase;

    /// Do the phase's work. Long-running executors should poll
    /// [`PhaseContext::is_cancelled`] and return early when it is set.
    fn execute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<()>;
}

/// Result of one worker attempt
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Completed(StageRecord),
    Failed { task_id: i64, error: String },
    Cancelled { task_id: i64 },
    NotEligible { current: StageRecord },
    RetryLater { task_id: i64, holder: i64, age_secs: i64 },
    /// No waiting record for the phase
    Idle,
}

/// Runs executors against the stage queue
pub struct PhaseWorker<C: Clock> {
    clock: C,
    timeouts: LockTimeouts,
    token: CancellationToken,
    owner_pid: i64,
}

impl<C: Clock> PhaseWorker<C> {
    pub fn new(timeouts: LockTimeouts, clock: C) -> Self {
        Self {
            clock,
            timeouts,
            token: CancellationToken::new(),
            owner_pid: std::process::id() as i64,
        }
    }

    /// Token shared with every context this worker creates
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the oldest waiting task of the executor's phase
    pub fn run_next(&self, conn: &Connection, executor: &mut dyn PhaseExecutor) -> Result<WorkOutcome> {
        match StageRepo::next_waiting(conn, executor.phase(), self.clock.now_ts())? {
            Some(record) => self.run_task(conn, executor, record.task_id),
            None => Ok(WorkOutcome::Idle),
        }
    }

    /// Run one task's current phase with `executor`
    pub fn run_task(
        &self,
        conn: &Connection,
        executor: &mut dyn PhaseExecutor,
        task_id: i64,
    ) -> Result<WorkOutcome> {
        let phase = executor.phase();
        let task = TaskRepo::get_by_id(conn, task_id)?.ok_or(StageError::TaskNotFound(task_id))?;

        if let AcquireOutcome::NotEligible { current } =
            StageRepo::acquire_stage(conn, task_id, phase, self.clock.now_ts())?
        {
            return Ok(WorkOutcome::NotEligible { current });
        }

        let timeout = self.timeouts.for_phase(phase);
        match LockRepo::acquire(conn, phase, task_id, self.owner_pid, timeout, self.clock.now_ts()) {
            Ok(_) => {}
            Err(StageError::RetryLater { holder, age_secs, .. }) => {
                StageRepo::requeue(conn, task_id, phase, self.clock.now_ts())?;
                info!(task = task_id, phase = phase.as_str(), holder = holder; "phase lock busy, requeued");
                return Ok(WorkOutcome::RetryLater { task_id, holder, age_secs });
            }
            Err(err) => {
                if let Err(requeue_err) = StageRepo::requeue(conn, task_id, phase, self.clock.now_ts()) {
                    error!(task = task_id, error = requeue_err.to_string().as_str(); "requeue failed");
                }
                return Err(err.into());
            }
        }
        let _guard = LockGuard::new(conn, phase, task_id);

        let mut ctx = PhaseContext {
            conn,
            clock: &self.clock,
            token: self.token.clone(),
            task,
            task_id,
            phase,
        };
        let result = executor.execute(&mut ctx);

        if ctx.is_cancelled() {
            let current = StageRepo::require(conn, task_id)?;
            if current.phase == phase && current.status == StageStatus::Processing {
                StageRepo::cancel(conn, task_id, self.clock.now_ts())?;
            }
            info!(task = task_id, phase = phase.as_str(); "phase cancelled");
            return Ok(WorkOutcome::Cancelled { task_id });
        }

        match result {
            Ok(()) => Ok(WorkOutcome::Completed(StageRepo::complete_stage(
                conn,
                task_id,
                phase,
                self.clock.now_ts(),
            )?)),
            Err(err) => {
                let message = format!("{:#}", err);
                let now = self.clock.now_ts();
                StageRepo::fail_stage(conn, task_id, phase, &message, now)?;
                let kind = format!("{}_failed", phase);
                let context = format!("task {}", task_id);
                ErrorLedgerRepo::report(
                    conn,
                    &NewError {
                        kind: &kind,
                        message: &message,
                        context: Some(&context),
                        severity: Severity::Error,
                        task_id: Some(task_id),
                        phase: Some(phase),
                    },
                    now,
                )?;
                Ok(WorkOutcome::Failed { task_id, error: message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::DbConnection;
    use crate::models::ErrorStatus;

    /// Completes, fails or cancels on demand, logging a few milestones
    struct Scripted {
        phase: Phase,
        fail: bool,
        cancel_from_outside: bool,
    }

    impl Scripted {
        fn ok(phase: Phase) -> Self {
            Self { phase, fail: false, cancel_from_outside: false }
        }
    }

    impl PhaseExecutor for Scripted {
        fn phase(&self) -> Phase {
            self.phase
        }

        fn execute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<()> {
            ctx.log("script generation started")?;
            ctx.set_expected_total(4)?;
            if self.cancel_from_outside {
                StageRepo::cancel(ctx.conn, ctx.task_id, 0)?;
                return Ok(());
            }
            if self.fail {
                anyhow::bail!("generator exited with status 3");
            }
            ctx.log("script saved")?;
            Ok(())
        }
    }

    fn task_at_script(conn: &Connection) -> i64 {
        let task = TaskRepo::create_scheduled(conn, Task::new("o", "c", "t", 0, 0), 0).unwrap();
        let id = task.id.unwrap();
        StageRepo::acquire_stage(conn, id, Phase::Schedule, 1).unwrap();
        StageRepo::complete_stage(conn, id, Phase::Schedule, 2).unwrap();
        id
    }

    fn worker(clock: &FixedClock) -> PhaseWorker<&FixedClock> {
        PhaseWorker::new(LockTimeouts::default(), clock)
    }

    #[test]
    fn test_success_advances_and_releases_lock() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();

        let outcome = worker(&clock).run_task(&conn, &mut Scripted::ok(Phase::Script), id).unwrap();
        match outcome {
            WorkOutcome::Completed(record) => {
                assert_eq!(record.phase, Phase::Image);
                assert_eq!(record.status, StageStatus::Waiting);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(LockRepo::get(&conn, Phase::Script).unwrap().is_free());
        assert_eq!(TaskRepo::get_by_id(&conn, id).unwrap().unwrap().expected_total, Some(4));
        let lines = StageLogRepo::lines(&conn, id, Phase::Script).unwrap();
        assert!(lines.iter().any(|l| l == "script saved"));
    }

    #[test]
    fn test_failure_is_recorded_in_queue_and_ledger() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        let mut executor = Scripted { fail: true, ..Scripted::ok(Phase::Script) };

        let outcome = worker(&clock).run_task(&conn, &mut executor, id).unwrap();
        assert!(matches!(outcome, WorkOutcome::Failed { .. }));

        let record = StageRepo::require(&conn, id).unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("generator exited with status 3"));
        assert!(LockRepo::get(&conn, Phase::Script).unwrap().is_free());

        let ledger = ErrorLedgerRepo::list(&conn, Some(ErrorStatus::Pending), 10).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, "script_failed");
        assert_eq!(ledger[0].task_id, Some(id));
    }

    #[test]
    fn test_contended_lock_requeues() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        LockRepo::acquire(&conn, Phase::Script, 999, 1, 600, clock.now_ts() - 30).unwrap();

        let outcome = worker(&clock).run_task(&conn, &mut Scripted::ok(Phase::Script), id).unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::RetryLater { task_id: id, holder: 999, age_secs: 30 }
        );
        let record = StageRepo::require(&conn, id).unwrap();
        assert_eq!(record.status, StageStatus::Waiting);
        assert_eq!(LockRepo::get(&conn, Phase::Script).unwrap().holder_task_id, Some(999));
    }

    #[test]
    fn test_wrong_phase_is_not_eligible() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();

        let outcome = worker(&clock).run_task(&conn, &mut Scripted::ok(Phase::Video), id).unwrap();
        assert!(matches!(outcome, WorkOutcome::NotEligible { .. }));
        assert!(LockRepo::get(&conn, Phase::Video).unwrap().is_free());
    }

    #[test]
    fn test_external_cancel_is_honoured() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        let mut executor = Scripted { cancel_from_outside: true, ..Scripted::ok(Phase::Script) };

        let outcome = worker(&clock).run_task(&conn, &mut executor, id).unwrap();
        assert_eq!(outcome, WorkOutcome::Cancelled { task_id: id });
        assert_eq!(StageRepo::require(&conn, id).unwrap().status, StageStatus::Cancelled);
        assert!(LockRepo::get(&conn, Phase::Script).unwrap().is_free());
    }

    #[test]
    fn test_token_cancel_marks_record_cancelled() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let id = task_at_script(&conn);
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        let worker = worker(&clock);
        worker.token().cancel();

        let outcome = worker.run_task(&conn, &mut Scripted::ok(Phase::Script), id).unwrap();
        assert_eq!(outcome, WorkOutcome::Cancelled { task_id: id });
        assert_eq!(StageRepo::require(&conn, id).unwrap().status, StageStatus::Cancelled);
    }

    #[test]
    fn test_run_next_idle_and_schedule_gate() {
        let conn = DbConnection::connect_in_memory().unwrap();
        let clock = FixedClock::at("2024-01-01T15:00").unwrap();
        let worker = worker(&clock);
        assert_eq!(worker.run_next(&conn, &mut ScheduleGate).unwrap(), WorkOutcome::Idle);

        // Due in an hour: not picked up yet
        let later = clock.now_ts() + 3600;
        let task = TaskRepo::create_scheduled(&conn, Task::new("o", "c", "t", later, 0), 0).unwrap();
        assert_eq!(worker.run_next(&conn, &mut ScheduleGate).unwrap(), WorkOutcome::Idle);

        clock.advance(chrono::Duration::hours(1));
        match worker.run_next(&conn, &mut ScheduleGate).unwrap() {
            WorkOutcome::Completed(record) => {
                assert_eq!(record.task_id, task.id.unwrap());
                assert_eq!(record.phase, Phase::Script);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
