//! Built-in phase executors
//!
//! - [`ScheduleGate`] completes the schedule phase as soon as it is run
//! - [`CommandExecutor`] runs an external program for any phase, streaming
//!   its stdout into the stage log

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};
use regex::Regex;

use super::{PhaseContext, PhaseExecutor};
use crate::models::Phase;

/// How often a running command is checked for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Output still accepted after a cancelled child has been killed
const CANCEL_DRAIN: Duration = Duration::from_millis(500);

/// `expected total: N` on stdout sets the task's unit count
static EXPECTED_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*expected total:\s*(\d+)\s*$").unwrap());

/// The schedule phase has no work of its own; being run means the task is due
#[derive(Debug, Default, Clone, Copy)]
pub struct ScheduleGate;

impl PhaseExecutor for ScheduleGate {
    fn phase(&self) -> Phase {
        Phase::Schedule
    }

    fn execute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<()> {
        ctx.log("schedule reached, releasing to script")?;
        Ok(())
    }
}

/// Runs `program args..` for a phase.
///
/// The child gets `STAGEHAND_TASK_ID`, `STAGEHAND_TASK_UUID`,
/// `STAGEHAND_PHASE` and `STAGEHAND_TITLE` in its environment. Every stdout
/// line is appended to the phase log. A non-zero exit fails the phase with the
/// last stderr line as the reason.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    phase: Phase,
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(phase: Phase, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            phase,
            program: program.into(),
            args,
        }
    }
}

impl PhaseExecutor for CommandExecutor {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn execute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<()> {
        let task = ctx.task().clone();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("STAGEHAND_TASK_ID", task.id.unwrap_or_default().to_string())
            .env("STAGEHAND_TASK_UUID", &task.uuid)
            .env("STAGEHAND_PHASE", self.phase.as_str())
            .env("STAGEHAND_TITLE", &task.title)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group, so a kill reaches everything the command starts
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start '{}'", self.program))?;

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let mut stderr = child.stderr.take().context("child stderr not captured")?;

        let (tx, rx) = mpsc::channel::<String>();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let mut failure = None;
        let mut killed_at: Option<Instant> = None;
        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => {
                    if let Err(err) = record_line(ctx, &line) {
                        failure = Some(err);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            match killed_at {
                Some(at) if at.elapsed() >= CANCEL_DRAIN => break,
                Some(_) => {}
                None if ctx.is_cancelled() => {
                    warn!(phase = self.phase.as_str(), program = self.program.as_str();
                        "cancelled, killing child");
                    kill_tree(&mut child);
                    killed_at = Some(Instant::now());
                }
                None => {}
            }
        }

        if let Some(err) = failure {
            warn!(phase = self.phase.as_str(), program = self.program.as_str(),
                error = err.to_string().as_str(); "could not record output, killing child");
            kill_tree(&mut child);
            if let Err(wait_err) = child.wait() {
                debug!(error = wait_err.to_string().as_str(); "wait after kill failed");
            }
            drop(rx);
            let _ = reader.join();
            let _ = stderr_reader.join();
            return Err(err);
        }

        if killed_at.is_some() {
            // The readers are not joined: anything that left the process
            // group may still hold the pipes open
            if let Err(err) = child.wait() {
                debug!(error = err.to_string().as_str(); "wait after kill failed");
            }
            return Ok(());
        }

        let status = child.wait().context("Failed to wait for child")?;
        let _ = reader.join();
        let stderr_text = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            let reason = stderr_text
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output on stderr");
            anyhow::bail!("'{}' exited with {}: {}", self.program, status, reason.trim());
        }
        Ok(())
    }
}

/// Append one stdout line to the phase log, picking up an expected total
fn record_line(ctx: &mut PhaseContext<'_>, line: &str) -> Result<()> {
    if let Some(total) = EXPECTED_TOTAL
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
    {
        ctx.set_expected_total(total)?;
    }
    ctx.log(line)
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child leads its own group, so its pid is the group id. It has not
    // been waited on yet, so the id cannot have been reused.
    let pgid = child.id() as libc::pid_t;
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(pgid = pgid; "process group already gone");
    }
    if let Err(err) = child.kill() {
        debug!(error = err.to_string().as_str(); "child already gone");
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = err.to_string().as_str(); "child already gone");
    }
}
