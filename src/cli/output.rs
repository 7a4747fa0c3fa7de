// Output formatting utilities

use std::io::IsTerminal;

use anyhow::Result;
use serde::Serialize;

use crate::models::{CadenceRow, ChannelCadence, ErrorRecord, StageEvent, StageLock, StageLogLine, StageRecord, StageStatus, Task};
use crate::repo::{PhaseSummary, TitleStats};
use crate::utils::{format_duration, format_opt_ts, format_ts};

// ANSI escape codes for terminal formatting
const ANSI_BOLD: &str = "\x1b[1m";
const ANSI_RESET: &str = "\x1b[0m";
const ANSI_FG_RED: &str = "\x1b[31m";
const ANSI_FG_GREEN: &str = "\x1b[32m";
const ANSI_FG_YELLOW: &str = "\x1b[33m";
const ANSI_FG_BRIGHT_BLACK: &str = "\x1b[90m";

/// Longest title shown in list tables before truncation
const TITLE_WIDTH: usize = 40;

/// Check if stdout is a terminal (TTY)
pub fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Get terminal width dynamically
///
/// Uses the `terminal_size` crate for reliable detection, with fallback to
/// COLUMNS environment variable and a sensible default.
pub fn get_terminal_width() -> usize {
    if let Some((terminal_size::Width(w), _)) = terminal_size::terminal_size() {
        if w > 0 {
            return w as usize;
        }
    }

    if let Ok(cols) = std::env::var("COLUMNS") {
        if let Ok(width) = cols.parse::<usize>() {
            if width > 0 && width < 10000 {
                return width;
            }
        }
    }

    120
}

/// Apply bold formatting if in TTY mode
fn bold_if_tty(text: &str, is_tty: bool) -> String {
    if is_tty {
        format!("{}{}{}", ANSI_BOLD, text, ANSI_RESET)
    } else {
        text.to_string()
    }
}

fn status_color(status: StageStatus) -> Option<&'static str> {
    match status {
        StageStatus::Waiting => None,
        StageStatus::Processing => Some(ANSI_FG_YELLOW),
        StageStatus::Completed => Some(ANSI_FG_GREEN),
        StageStatus::Failed => Some(ANSI_FG_RED),
        StageStatus::Cancelled => Some(ANSI_FG_BRIGHT_BLACK),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let kept: String = text.chars().take(width.saturating_sub(2)).collect();
        format!("{}..", kept)
    }
}

/// Left-aligned columns under a header and a dashed separator.
///
/// `colors` holds an optional ANSI color per row, applied after padding so the
/// escape codes do not disturb alignment.
fn render_table(headers: &[&str], rows: &[Vec<String>], colors: &[Option<&str>]) -> String {
    render_table_styled(headers, rows, colors, is_tty())
}

fn render_table_styled(headers: &[&str], rows: &[Vec<String>], colors: &[Option<&str>], tty: bool) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let total_width = (widths.iter().sum::<usize>() + widths.len().saturating_sub(1)).min(get_terminal_width());

    let pad = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(" ")
            .trim_end()
            .to_string()
    };

    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut output = String::new();
    output.push_str(&bold_if_tty(&pad(&header_cells), tty));
    output.push('\n');
    output.push_str(&"-".repeat(total_width));
    output.push('\n');
    for (i, row) in rows.iter().enumerate() {
        let line = pad(row);
        match colors.get(i).copied().flatten() {
            Some(color) if tty => output.push_str(&format!("{}{}{}", color, line, ANSI_RESET)),
            _ => output.push_str(&line),
        }
        output.push('\n');
    }
    output
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A task with its queue position and computed progress
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub stage: StageRecord,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

pub fn format_task_list(views: &[TaskView]) -> String {
    if views.is_empty() {
        return "No tasks found.".to_string();
    }
    let rows: Vec<Vec<String>> = views
        .iter()
        .map(|v| {
            vec![
                v.task.id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string()),
                format!("{}/{}", v.task.owner, v.task.channel),
                format_ts(v.task.scheduled_ts),
                v.stage.phase.to_string(),
                v.stage.status.to_string(),
                format!("{}%", v.progress),
                truncate(&v.task.title, TITLE_WIDTH),
            ]
        })
        .collect();
    let colors: Vec<Option<&str>> = views.iter().map(|v| status_color(v.stage.status)).collect();
    render_table(
        &["ID", "Channel", "Scheduled", "Phase", "Status", "Progress", "Title"],
        &rows,
        &colors,
    )
}

pub fn format_task_summary(view: &TaskView, events: &[StageEvent]) -> String {
    let task = &view.task;
    let stage = &view.stage;
    let mut output = String::new();

    let header = format!(
        "Task {}: {}",
        task.id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string()),
        task.title
    );
    output.push_str(&header);
    output.push('\n');
    output.push_str(&"=".repeat(header.chars().count().max(60)));
    output.push_str("\n\n");

    output.push_str(&format!("UUID:        {}\n", task.uuid));
    output.push_str(&format!("Channel:     {}/{}\n", task.owner, task.channel));
    output.push_str(&format!("Category:    {}\n", task.category.as_deref().unwrap_or("(none)")));
    if let Some(content_id) = &task.content_id {
        output.push_str(&format!("Content:     {}\n", content_id));
    }
    output.push_str(&format!("Scheduled:   {}\n", format_ts(task.scheduled_ts)));
    output.push_str(&format!("Created:     {}\n", format_ts(task.created_ts)));
    if task.done {
        output.push_str(&format!("Done:        {}\n", format_opt_ts(task.done_ts)));
    }
    output.push('\n');

    output.push_str("Stage:\n");
    output.push_str(&format!("  Phase:     {}\n", stage.phase));
    output.push_str(&format!("  Status:    {}\n", stage.status));
    output.push_str(&format!("  Progress:  {}%\n", view.progress));
    if let Some(position) = view.position {
        output.push_str(&format!("  Queue:     {} ahead\n", position));
    }
    if stage.retry_count > 0 {
        output.push_str(&format!("  Retries:   {}\n", stage.retry_count));
    }
    output.push_str(&format!("  Started:   {}\n", format_opt_ts(stage.started_ts)));
    output.push_str(&format!("  Finished:  {}\n", format_opt_ts(stage.finished_ts)));
    if let Some(error) = &stage.error {
        output.push_str(&format!("  Error:     {}\n", error));
    }
    if let Some(total) = task.expected_total {
        output.push_str(&format!("  Expected:  {} units\n", total));
    }

    if !events.is_empty() {
        output.push_str("\nHistory:\n");
        for event in events {
            let from = event.from_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
            output.push_str(&format!(
                "  {}  {:<8} {} -> {}",
                format_ts(event.created_ts),
                event.phase.as_str(),
                from,
                event.to_status
            ));
            if let Some(detail) = &event.detail {
                output.push_str(&format!("  ({})", detail));
            }
            output.push('\n');
        }
    }
    output
}

pub fn format_phase_summary(summary: &[PhaseSummary]) -> String {
    let rows: Vec<Vec<String>> = summary
        .iter()
        .map(|s| {
            vec![
                s.phase.map(|p| p.to_string()).unwrap_or_else(|| "total".to_string()),
                s.waiting.to_string(),
                s.processing.to_string(),
                s.completed.to_string(),
                s.failed.to_string(),
            ]
        })
        .collect();
    render_table(&["Phase", "Waiting", "Processing", "Completed", "Failed"], &rows, &[])
}

pub fn format_stuck(records: &[StageRecord], now: i64) -> String {
    if records.is_empty() {
        return "No stuck stages.".to_string();
    }
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.task_id.to_string(),
                r.phase.to_string(),
                format_opt_ts(r.started_ts),
                r.started_ts.map(|ts| format_duration(now - ts)).unwrap_or_default(),
            ]
        })
        .collect();
    render_table(&["Task", "Phase", "Started", "Running"], &rows, &[])
}

pub fn format_lock_table(locks: &[StageLock], now: i64) -> String {
    let rows: Vec<Vec<String>> = locks
        .iter()
        .map(|l| {
            vec![
                l.kind.to_string(),
                l.holder_task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                l.owner_pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string()),
                l.age_secs(now).map(format_duration).unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    render_table(&["Kind", "Holder", "Pid", "Age"], &rows, &[])
}

/// A stored channel row with its parsed form, if it parses
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    #[serde(flatten)]
    pub row: CadenceRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadence: Option<ChannelCadence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid: Option<String>,
}

impl From<CadenceRow> for ChannelView {
    fn from(row: CadenceRow) -> Self {
        match ChannelCadence::try_from(row.clone()) {
            Ok(cadence) => Self {
                row,
                cadence: Some(cadence),
                invalid: None,
            },
            Err(err) => Self {
                row,
                cadence: None,
                invalid: Some(err.to_string()),
            },
        }
    }
}

pub fn format_channel_table(channels: &[ChannelView]) -> String {
    if channels.is_empty() {
        return "No channels configured.".to_string();
    }
    let rows: Vec<Vec<String>> = channels
        .iter()
        .map(|c| {
            let (cadence, categories) = match &c.cadence {
                Some(parsed) => (parsed.cadence.to_string(), parsed.categories.join(",")),
                None => (
                    format!("invalid: {}", c.invalid.as_deref().unwrap_or("?")),
                    c.row.categories.clone().unwrap_or_default(),
                ),
            };
            vec![
                c.row.owner.clone(),
                c.row.channel.clone(),
                if c.row.active { "yes" } else { "no" }.to_string(),
                cadence,
                categories,
            ]
        })
        .collect();
    let colors: Vec<Option<&str>> = channels
        .iter()
        .map(|c| {
            if c.cadence.is_none() {
                Some(ANSI_FG_RED)
            } else if !c.row.active {
                Some(ANSI_FG_BRIGHT_BLACK)
            } else {
                None
            }
        })
        .collect();
    render_table(&["Owner", "Channel", "Active", "Cadence", "Categories"], &rows, &colors)
}

pub fn format_title_stats(stats: &[TitleStats]) -> String {
    if stats.is_empty() {
        return "Title pool is empty.".to_string();
    }
    let rows: Vec<Vec<String>> = stats
        .iter()
        .map(|s| vec![s.category.clone(), s.available.to_string(), s.used.to_string()])
        .collect();
    render_table(&["Category", "Available", "Used"], &rows, &[])
}

pub fn format_error_table(records: &[ErrorRecord]) -> String {
    if records.is_empty() {
        return "No errors recorded.".to_string();
    }
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.severity.to_string(),
                e.status.to_string(),
                e.kind.clone(),
                e.task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                e.retry_count.to_string(),
                truncate(&e.message, TITLE_WIDTH),
            ]
        })
        .collect();
    render_table(&["ID", "Severity", "Status", "Kind", "Task", "Retries", "Message"], &rows, &[])
}

pub fn format_log_lines(lines: &[StageLogLine]) -> String {
    if lines.is_empty() {
        return "No log lines.".to_string();
    }
    lines
        .iter()
        .map(|l| format!("{}  {:<8} {}", format_ts(l.created_ts), l.phase.as_str(), l.line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer title", 8), "a much..");
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let rows = vec![
            vec!["1".to_string(), "script".to_string()],
            vec!["12".to_string(), "image".to_string()],
        ];
        let table = render_table_styled(&["ID", "Phase"], &rows, &[], false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID Phase");
        assert!(lines[1].starts_with("--------"));
        assert_eq!(lines[2], "1  script");
        assert_eq!(lines[3], "12 image");
    }

    #[test]
    fn test_phase_summary_has_total_row() {
        let summary = vec![
            PhaseSummary {
                phase: Some(Phase::Script),
                waiting: 2,
                ..Default::default()
            },
            PhaseSummary {
                phase: None,
                waiting: 2,
                ..Default::default()
            },
        ];
        let table = format_phase_summary(&summary);
        assert!(table.contains("script"));
        assert!(table.lines().last().unwrap().starts_with("total"));
    }
}
