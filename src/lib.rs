//! Stagehand - stage queue, phase locks and channel scheduling for a
//! five-phase content pipeline (schedule → script → image → video → youtube)
//!
//! This library provides:
//! - SQLite storage with migrations
//! - The stage queue with compare-and-swap transitions and phase locks
//! - Progress estimation from stage logs
//! - Channel cadence arithmetic and the automation tick
//! - A worker harness that runs phase executors under a lock
//! - Startup and periodic recovery, and an error ledger
//! - The `stagehand` admin CLI
//!
//! # Example
//!
//! ```no_run
//! use stagehand::cli::run;
//!
//! fn main() {
//!     if let Err(e) = run() {
//!         eprintln!("Error: {}", e);
//!         std::process::exit(1);
//!     }
//! }
//! ```

pub mod automation;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod repo;
pub mod schedule;
pub mod utils;
pub mod worker;
