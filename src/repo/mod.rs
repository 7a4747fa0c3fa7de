pub mod cadence;
pub mod error_ledger;
pub mod event;
pub mod lock;
pub mod stage;
pub mod stage_log;
pub mod task;
pub mod title;

pub use cadence::*;
pub use error_ledger::*;
pub use event::*;
pub use lock::*;
pub use stage::*;
pub use stage_log::*;
pub use task::*;
pub use title::*;

use rusqlite::Connection;

/// Run `f` inside a savepoint so a multi-statement write lands completely or
/// not at all. Nests inside an open transaction.
pub(crate) fn atomically<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    E: From<rusqlite::Error>,
    F: FnOnce() -> Result<T, E>,
{
    conn.execute_batch("SAVEPOINT repo_write")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("RELEASE repo_write")?;
            Ok(value)
        }
        Err(err) => {
            // The original error is the one worth reporting
            let _ = conn.execute_batch("ROLLBACK TO repo_write; RELEASE repo_write");
            Err(err)
        }
    }
}
