//! Logger setup
//!
//! Log calls carry structured fields through the `log` kv API, e.g.
//! `info!(task = id, phase = phase.as_str(); "stage acquired")`. The formatter
//! appends them to the message as `key=value` pairs.

use std::io::Write;

use env_logger::{Builder, Env};
use log::kv::{Error as KvError, Key, Value, VisitSource};

struct KvSuffix(String);

impl<'kvs> VisitSource<'kvs> for KvSuffix {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), KvError> {
        self.0.push(' ');
        self.0.push_str(key.as_str());
        self.0.push('=');
        self.0.push_str(&value.to_string());
        Ok(())
    }
}

/// Install the stderr logger. `RUST_LOG` overrides `default_level`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let _ = Builder::from_env(Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            let mut kv = KvSuffix(String::new());
            // A failing visitor only loses the suffix
            let _ = record.key_values().visit(&mut kv);
            writeln!(
                buf,
                "{} {:<5} {}: {}{}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                record.args(),
                kv.0
            )
        })
        .try_init();
}
