// Channel, title, error ledger and automation commands

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};

use crate::automation::{AutomationLoop, TitlePoolGenerator};
use crate::cli::commands::{date_arg, duration_arg, phase_arg, ChannelCommands, ErrorCommands, Session, TitleCommands};
use crate::cli::error::{parse_error_status, parse_severity, user_error, validate_channel_name, validate_non_empty};
use crate::cli::output::{
    format_channel_table, format_error_table, format_title_stats, print_json, ChannelView,
};
use crate::clock::SystemClock;
use crate::models::{
    parse_time_of_day, Cadence, CadenceRow, ChannelCadence, ErrorRecord, IntervalUnit, Phase, DEFAULT_TIME_OF_DAY,
};
use crate::recovery::{recover_on_startup, recover_stale, repair_defects, RecoveryReport};
use crate::repo::{CadenceRepo, ErrorLedgerRepo, NewError, TitleRepo};
use crate::schedule::{free_slots, next_due};
use crate::utils::to_local;
use crate::worker::{CommandExecutor, PhaseExecutor, PhaseWorker, ScheduleGate, WorkOutcome};

fn format_local(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

/// Parse `--slot 1=09:00,18:00` values into a weekday map
fn parse_slots(values: &[String]) -> Result<BTreeMap<u32, Vec<chrono::NaiveTime>>, String> {
    let mut slots: BTreeMap<u32, Vec<chrono::NaiveTime>> = BTreeMap::new();
    for value in values {
        let (day, times) = value
            .split_once('=')
            .ok_or_else(|| format!("Invalid slot '{}'. Expected <weekday>=HH:MM[,HH:MM...]", value))?;
        let day: u32 = day
            .trim()
            .parse()
            .ok()
            .filter(|d| *d < 7)
            .ok_or_else(|| format!("Invalid weekday '{}'. Use 0 (Sunday) to 6 (Saturday)", day))?;
        let entry = slots.entry(day).or_default();
        for t in times.split(',').filter(|t| !t.trim().is_empty()) {
            let time = parse_time_of_day(t).ok_or_else(|| format!("Invalid time '{}'. Expected HH:MM", t))?;
            entry.push(time);
        }
        entry.sort();
        entry.dedup();
    }
    Ok(slots)
}

fn load_channel(session: &Session, owner: &str, channel: &str) -> Result<ChannelCadence> {
    let row = CadenceRepo::get(&session.conn, owner, channel)?
        .unwrap_or_else(|| user_error(&format!("Channel {}/{} not found", owner, channel)));
    Ok(ChannelCadence::try_from(row).unwrap_or_else(|e| user_error(&e.to_string())))
}

pub fn handle_channel(cmd: ChannelCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        ChannelCommands::Set { owner, channel, every, unit, at, slot, categories, name } => {
            for (value, field) in [(&owner, "owner"), (&channel, "channel")] {
                if let Err(e) = validate_channel_name(value, field) {
                    user_error(&e);
                }
            }
            let cadence = if !slot.is_empty() {
                Cadence::WeekdayTime {
                    slots: parse_slots(&slot).unwrap_or_else(|e| user_error(&e)),
                }
            } else {
                let every = every.unwrap_or_else(|| user_error("Give either --every or at least one --slot"));
                if every < 1 || every > u32::MAX as i64 {
                    user_error("--every must be at least 1");
                }
                let unit = IntervalUnit::from_str(&unit.to_ascii_lowercase())
                    .unwrap_or_else(|| user_error(&format!("Invalid unit '{}'. Use minutes, hours or days", unit)));
                let time_text = at.as_deref().unwrap_or(DEFAULT_TIME_OF_DAY);
                let time_of_day = parse_time_of_day(time_text)
                    .unwrap_or_else(|| user_error(&format!("Invalid time '{}'. Expected HH:MM", time_text)));
                Cadence::FixedInterval {
                    every: every as u32,
                    unit,
                    time_of_day,
                }
            };
            let categories: Vec<String> = categories
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();

            let mut row = CadenceRow::from_cadence(&owner, &channel, &cadence, &categories);
            row.name = name;
            if let Err(e) = ChannelCadence::try_from(row.clone()) {
                user_error(&e.to_string());
            }
            CadenceRepo::save(conn, &row, session.now())?;
            println!("Channel {}/{}: {}", owner, channel, cadence);
        }
        ChannelCommands::List { all, json } => {
            let views: Vec<ChannelView> = CadenceRepo::list(conn, !all)?
                .into_iter()
                .map(ChannelView::from)
                .collect();
            if json {
                print_json(&views)?;
            } else {
                println!("{}", format_channel_table(&views));
            }
        }
        ChannelCommands::Next { owner, channel, from, json } => {
            let channel = load_channel(&session, &owner, &channel)?;
            let now = Local::now();
            let reference = match from.as_deref() {
                Some(expr) => to_local(date_arg(expr))
                    .unwrap_or_else(|| user_error(&format!("Invalid reference time '{}'", expr))),
                None => now,
            };
            let due = next_due(&channel.cadence, reference.naive_local(), now.naive_local());
            if json {
                print_json(&serde_json::json!({
                    "owner": channel.owner,
                    "channel": channel.channel,
                    "next_due": due.map(format_local),
                }))?;
            } else {
                match due {
                    Some(due) => println!("{}", format_local(due)),
                    None => println!("No upcoming slot"),
                }
            }
        }
        ChannelCommands::Slots { owner, channel, limit, json } => {
            let channel = load_channel(&session, &owner, &channel)?;
            let slots: Vec<String> = free_slots(conn, &channel, Local::now(), limit)?
                .into_iter()
                .map(format_local)
                .collect();
            if json {
                print_json(&slots)?;
            } else if slots.is_empty() {
                println!("No free slots.");
            } else {
                for slot in slots {
                    println!("{}", slot);
                }
            }
        }
        ChannelCommands::Disable { owner, channel } => {
            if !CadenceRepo::set_active(conn, &owner, &channel, false, session.now())? {
                user_error(&format!("Channel {}/{} not found", owner, channel));
            }
            println!("Channel {}/{} disabled", owner, channel);
        }
        ChannelCommands::Enable { owner, channel } => {
            if !CadenceRepo::set_active(conn, &owner, &channel, true, session.now())? {
                user_error(&format!("Channel {}/{} not found", owner, channel));
            }
            println!("Channel {}/{} enabled", owner, channel);
        }
    }
    Ok(())
}

pub fn handle_title(cmd: TitleCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        TitleCommands::Add { category, title } => {
            let title = title.join(" ");
            for (value, field) in [(category.as_str(), "Category"), (title.as_str(), "Title")] {
                if let Err(e) = validate_non_empty(value, field) {
                    user_error(&e);
                }
            }
            if TitleRepo::add(conn, category.trim(), title.trim(), session.now())? {
                println!("Added title to {}", category.trim());
            } else {
                println!("Title already in {}", category.trim());
            }
        }
        TitleCommands::Stats { json } => {
            let stats = TitleRepo::stats(conn)?;
            if json {
                print_json(&stats)?;
            } else {
                println!("{}", format_title_stats(&stats));
            }
        }
    }
    Ok(())
}

fn print_error_record(record: &ErrorRecord, json: bool) -> Result<()> {
    if json {
        print_json(record)
    } else {
        println!("{}", format_error_table(std::slice::from_ref(record)));
        Ok(())
    }
}

pub fn handle_errors(cmd: ErrorCommands) -> Result<()> {
    let session = Session::open()?;
    let conn = &session.conn;

    match cmd {
        ErrorCommands::Report { kind, message, context, severity, task, phase } => {
            for (value, field) in [(kind.as_str(), "Kind"), (message.as_str(), "Message")] {
                if let Err(e) = validate_non_empty(value, field) {
                    user_error(&e);
                }
            }
            let error = NewError {
                kind: &kind,
                message: &message,
                context: context.as_deref(),
                severity: parse_severity(&severity).unwrap_or_else(|e| user_error(&e)),
                task_id: task,
                phase: phase.as_deref().map(phase_arg),
            };
            match ErrorLedgerRepo::report(conn, &error, session.now())? {
                Some(record) => println!("Recorded error {}", record.id),
                None => println!("Already recorded"),
            }
        }
        ErrorCommands::List { status, limit, json } => {
            let status = status
                .as_deref()
                .map(|s| parse_error_status(s).unwrap_or_else(|e| user_error(&e)));
            let records = ErrorLedgerRepo::list(conn, status, limit)?;
            if json {
                print_json(&records)?;
            } else {
                println!("{}", format_error_table(&records));
            }
        }
        ErrorCommands::Claim { worker, json } => match ErrorLedgerRepo::claim(conn, &worker, session.now())? {
            Some(record) => print_error_record(&record, json)?,
            None if json => print_json(&serde_json::Value::Null)?,
            None => println!("Nothing to claim."),
        },
        ErrorCommands::Start { id, worker } => {
            if !ErrorLedgerRepo::start(conn, id, &worker, session.now())? {
                user_error(&format!("Error {} is not claimed by {}", id, worker));
            }
            println!("Error {} processing", id);
        }
        ErrorCommands::Resolve { id, resolution } => {
            if !ErrorLedgerRepo::resolve(conn, id, &resolution.join(" "), session.now())? {
                user_error(&format!("Error {} is not open", id));
            }
            println!("Error {} resolved", id);
        }
        ErrorCommands::Ignore { id } => {
            if !ErrorLedgerRepo::ignore(conn, id, session.now())? {
                user_error(&format!("Error {} is not open", id));
            }
            println!("Error {} ignored", id);
        }
        ErrorCommands::Retry { id } => {
            if !matches!(ErrorLedgerRepo::get(conn, id)?, Some(record) if record.status.is_open()) {
                user_error(&format!("Error {} is not open", id));
            }
            let outcome =
                ErrorLedgerRepo::record_attempt_failure(conn, id, session.config.errors.max_retries, session.now())?;
            if outcome.gave_up {
                println!("Error {} failed after {} attempts", id, outcome.retry_count);
            } else {
                println!("Error {} back to pending (attempt {})", id, outcome.retry_count);
            }
        }
        ErrorCommands::Sweep => {
            let recovered =
                ErrorLedgerRepo::recover_stuck(conn, session.config.errors.stuck_timeout_secs, session.now())?;
            println!("Returned {} stuck claim(s) to pending", recovered);
        }
        ErrorCommands::Stats { json } => {
            let stats = ErrorLedgerRepo::stats(conn)?;
            if json {
                print_json(&stats)?;
            } else {
                println!("Total: {}", stats.total);
                for (status, count) in &stats.by_status {
                    println!("  {:<12} {}", status, count);
                }
                if !stats.pending_by_severity.is_empty() {
                    println!("Pending by severity:");
                    for (severity, count) in &stats.pending_by_severity {
                        println!("  {:<12} {}", severity, count);
                    }
                }
                if !stats.pending_by_kind.is_empty() {
                    println!("Pending by kind:");
                    for (kind, count) in &stats.pending_by_kind {
                        println!("  {:<24} {}", kind, count);
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn handle_tick(json: bool) -> Result<()> {
    let session = Session::open()?;
    let mut automation = AutomationLoop::new(session.config.clone(), SystemClock, TitlePoolGenerator);
    let summary = automation.tick(&session.conn)?;
    if json {
        print_json(&summary)?;
    } else {
        println!(
            "Scheduled {}, failed {}, skipped {}",
            summary.success, summary.failed, summary.skipped
        );
    }
    Ok(())
}

pub fn handle_run(max_ticks: Option<usize>) -> Result<()> {
    let session = Session::open()?;
    if max_ticks == Some(0) {
        user_error("--max-ticks must be at least 1");
    }
    // Processing records may belong to live workers, so only defects are repaired here
    repair_defects(&session.conn, session.now())?;

    let shutdown = AtomicBool::new(false);
    let mut automation = AutomationLoop::new(session.config.clone(), SystemClock, TitlePoolGenerator);
    automation.run(&session.conn, &shutdown, max_ticks)
}

fn describe(outcome: &WorkOutcome, phase: Phase) -> String {
    match outcome {
        WorkOutcome::Completed(record) if record.is_done() => format!("Task {} done", record.task_id),
        WorkOutcome::Completed(record) => format!(
            "Task {} finished {}, now {} {}",
            record.task_id, phase, record.phase, record.status
        ),
        WorkOutcome::Failed { task_id, error } => format!("Task {} failed: {}", task_id, error),
        WorkOutcome::Cancelled { task_id } => format!("Task {} cancelled", task_id),
        WorkOutcome::NotEligible { current } => format!(
            "Task {} is not waiting at {} (currently {}/{})",
            current.task_id, phase, current.phase, current.status
        ),
        WorkOutcome::RetryLater { task_id, holder, age_secs } => format!(
            "Task {} requeued: {} lock held by task {} for {}s",
            task_id, phase, holder, age_secs
        ),
        WorkOutcome::Idle => format!("No task waiting at {}", phase),
    }
}

pub fn handle_work(phase: &str, task: Option<i64>, keep_going: bool, command: Vec<String>) -> Result<()> {
    let phase = phase_arg(phase);
    let mut executor: Box<dyn PhaseExecutor> = match command.split_first() {
        Some((program, args)) => Box::new(CommandExecutor::new(phase, program.clone(), args.to_vec())),
        None if phase == Phase::Schedule => Box::new(ScheduleGate),
        None => user_error(&format!("Phase {} needs a command after --", phase)),
    };
    if task.is_some() && keep_going {
        user_error("--task and --loop cannot be combined");
    }

    let session = Session::open()?;
    let worker = PhaseWorker::new(session.config.lock_timeouts.clone(), SystemClock);

    if let Some(task_id) = task {
        let outcome = worker.run_task(&session.conn, executor.as_mut(), task_id)?;
        println!("{}", describe(&outcome, phase));
        return match outcome {
            WorkOutcome::Failed { .. } | WorkOutcome::NotEligible { .. } => std::process::exit(1),
            _ => Ok(()),
        };
    }

    let poll = StdDuration::from_secs(session.config.automation.poll_secs.max(1) as u64);
    loop {
        let outcome = worker.run_next(&session.conn, executor.as_mut())?;
        println!("{}", describe(&outcome, phase));
        if !keep_going {
            if matches!(outcome, WorkOutcome::Failed { .. }) {
                std::process::exit(1);
            }
            return Ok(());
        }
        if matches!(outcome, WorkOutcome::Idle | WorkOutcome::RetryLater { .. }) {
            std::thread::sleep(poll);
        }
    }
}

pub fn handle_recover(stale: Option<String>, repair: bool, json: bool) -> Result<()> {
    let session = Session::open()?;
    let now = session.now();
    let mut report: RecoveryReport = match stale.as_deref() {
        Some(expr) => recover_stale(&session.conn, duration_arg(expr), now)?,
        None => recover_on_startup(&session.conn, now)?,
    };
    if repair {
        report.stages_repaired = repair_defects(&session.conn, now)?.stages_repaired;
    }

    if json {
        print_json(&report)?;
    } else {
        println!("Released {} lock(s)", report.locks_released);
        println!("Failed {} interrupted stage(s)", report.stages_failed.len());
        if repair {
            println!("Repaired {} defective record(s)", report.stages_repaired.len());
        }
    }
    Ok(())
}
