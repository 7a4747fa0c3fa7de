//! Progress inferred from phase log text
//!
//! Nothing here is persisted: the percentage is recomputed from the stage
//! record and the phase's log lines whenever it is asked for. Each phase owns
//! a band of the 0-100 range and milestones found in the log move the value
//! inside the band.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use rusqlite::Connection;

use crate::models::{Phase, StageRecord, StageStatus};
use crate::repo::{StageLogRepo, StageRepo, TaskRepo};

/// Added to the band start once a phase has any log output but no milestone
pub const NO_MILESTONE_OFFSET: u8 = 1;

/// `[start, end)` of a phase's share of the progress range
pub fn band(phase: Phase) -> (u8, u8) {
    match phase {
        Phase::Schedule => (0, 10),
        Phase::Script => (10, 25),
        Phase::Image => (25, 60),
        Phase::Video => (60, 85),
        Phase::Youtube => (85, 99),
    }
}

static SCRIPT_MILESTONES: LazyLock<Vec<(Regex, u8)>> = LazyLock::new(|| {
    [
        (r"(?i)script generation started", 12),
        (r"(?i)prompt file created", 14),
        (r"(?i)generator started", 16),
        (r"(?i)browser automation", 18),
        (r"(?i)generator finished", 22),
        (r"(?i)script saved", 24),
    ]
    .into_iter()
    .map(|(re, value)| (Regex::new(re).unwrap(), value))
    .collect()
});

static YOUTUBE_MILESTONES: LazyLock<Vec<(Regex, u8)>> = LazyLock::new(|| {
    [
        (r"(?i)upload started", 88),
        (r"(?i)upload finished", 92),
        (r"(?i)thumbnail pending", 94),
        (r"(?i)thumbnail uploaded", 96),
        (r"(?i)comment posted|publish complete", 98),
    ]
    .into_iter()
    .map(|(re, value)| (Regex::new(re).unwrap(), value))
    .collect()
});

static SAVED_SCENE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)saved\s+scene_(\d+)").unwrap());
static IMAGES_SAVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+images?\s+saved").unwrap());
static TTS_SCENE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tts generated:\s*scene_(\d+)").unwrap());
static RENDER_SCENE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rendering scene\s+(\d+)").unwrap());
static MERGING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)merging|final video").unwrap());

fn fixed_milestone<S: AsRef<str>>(table: &[(Regex, u8)], lines: &[S]) -> Option<u8> {
    table
        .iter()
        .filter(|(re, _)| lines.iter().any(|l| re.is_match(l.as_ref())))
        .map(|(_, value)| *value)
        .max()
}

/// Distinct scene numbers captured by `re` across all lines
fn distinct_scenes<S: AsRef<str>>(re: &Regex, lines: &[S]) -> usize {
    lines
        .iter()
        .filter_map(|l| re.captures(l.as_ref()))
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
        .collect::<BTreeSet<_>>()
        .len()
}

/// `start + span * done / total`, rounded; `None` without a usable total
fn fraction(start: u8, span: u8, done: usize, total: Option<i64>) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    if done == 0 {
        return None;
    }
    let ratio = (done as f64 / total as f64).min(1.0);
    Some((start as f64 + span as f64 * ratio).round() as u8)
}

fn milestone<S: AsRef<str>>(phase: Phase, lines: &[S], expected_total: Option<i64>) -> Option<u8> {
    match phase {
        Phase::Schedule => None,
        Phase::Script => fixed_milestone(&SCRIPT_MILESTONES, lines),
        Phase::Image => {
            let scenes = distinct_scenes(&SAVED_SCENE, lines);
            let reported = lines
                .iter()
                .filter_map(|l| IMAGES_SAVED.captures(l.as_ref()))
                .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
                .max()
                .unwrap_or(0);
            fraction(25, 35, scenes.max(reported), expected_total)
        }
        Phase::Video => {
            let tts = fraction(60, 7, distinct_scenes(&TTS_SCENE, lines), expected_total);
            let render = fraction(67, 13, distinct_scenes(&RENDER_SCENE, lines), expected_total);
            let merge = lines
                .iter()
                .any(|l| MERGING.is_match(l.as_ref()))
                .then_some(82);
            [tts, render, merge].into_iter().flatten().max()
        }
        Phase::Youtube => fixed_milestone(&YOUTUBE_MILESTONES, lines),
    }
}

/// Progress percentage of a task in `phase`/`status` given that phase's log.
///
/// Deterministic in its inputs. While processing, appending lines never
/// lowers the result. Failed and cancelled report the phase's band start.
pub fn progress<S: AsRef<str>>(
    phase: Phase,
    status: StageStatus,
    lines: &[S],
    expected_total: Option<i64>,
) -> u8 {
    let (start, end) = band(phase);
    match status {
        StageStatus::Completed => match phase.next() {
            // Only reachable through a defective record; it is already
            // logically at the next phase
            Some(next) => band(next).0,
            None => 100,
        },
        StageStatus::Waiting | StageStatus::Failed | StageStatus::Cancelled => start,
        StageStatus::Processing => {
            if lines.is_empty() {
                return start;
            }
            let floor = start + NO_MILESTONE_OFFSET;
            let value = milestone(phase, lines, expected_total).map_or(floor, |m| m.max(floor));
            value.clamp(start, end - 1)
        }
    }
}

/// Log lines written by the attempt that is currently processing `record`.
///
/// Earlier attempts at the same phase (failed, then retried) stay in the log
/// but must not count. Lines are taken from `started_ts` on, and from the
/// last `waiting -> processing` transition within that window, since a
/// retry can land in the same second as the failure.
pub fn attempt_lines(conn: &Connection, record: &StageRecord) -> Result<Vec<String>> {
    let Some(started) = record.started_ts else {
        return Ok(Vec::new());
    };
    let mut lines: Vec<String> =
        StageLogRepo::list(conn, record.task_id, Some(record.phase), Some(started), None)?
            .into_iter()
            .map(|l| l.line)
            .collect();
    let marker = format!("stage {} {} -> {}", record.phase, StageStatus::Waiting, StageStatus::Processing);
    if let Some(pos) = lines.iter().rposition(|l| *l == marker) {
        lines.drain(..pos);
    }
    Ok(lines)
}

/// Load a task's record and current-attempt log and compute its progress.
/// `None` if the task does not exist.
pub fn progress_for_task(conn: &Connection, task_id: i64) -> Result<Option<u8>> {
    let Some(record) = StageRepo::get(conn, task_id)? else {
        return Ok(None);
    };
    let expected_total = TaskRepo::get_by_id(conn, task_id)?.and_then(|t| t.expected_total);
    let lines = attempt_lines(conn, &record)?;
    Ok(Some(progress(record.phase, record.status, &lines, expected_total)))
}
