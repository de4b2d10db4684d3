//! A small synchronous `log::Log` implementation.
//!
//! This system's logging volume is a handful of lines per connection or
//! request, nothing like the millions-of-lines-per-second a full simulator
//! needs, so unlike a queued, background-thread logger this one writes
//! straight from the calling thread. The shape — a struct implementing
//! `log::Log`, installed once through `log::set_logger`, with a public
//! `init()` — follows the same convention as this house's larger logger.

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: OnceCell<SimpleLogger> = OnceCell::new();

struct SimpleLogger {
    level: LevelFilter,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{}.{:03} {:<5} [{}] {}\n",
            now.as_secs(),
            now.subsec_millis(),
            record.level(),
            record.target(),
            record.args()
        );
        match record.level() {
            Level::Warn | Level::Error => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            _ => {
                let _ = std::io::stdout().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

/// Installs the process-wide logger. Safe to call more than once; only the
/// first call has any effect, matching `log::set_logger`'s own contract.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    let logger = LOGGER.get_or_init(|| SimpleLogger { level });
    match log::set_logger(logger) {
        Ok(()) => {
            log::set_max_level(level);
            Ok(())
        }
        Err(_) => Ok(()), // already installed by an earlier call
    }
}

/// Renders an `anyhow::Error`'s full causal chain, one link per line, for
/// the structured log; pairs with a short `root_cause()` line on stderr at
/// the binary entry point.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut out = format!("{err}");
    for cause in err.chain().skip(1) {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_includes_every_link() {
        let err = anyhow::anyhow!("outer")
            .context("middle")
            .context("innermost context is actually outermost after wrapping");
        let rendered = format_error_chain(&err);
        assert!(rendered.contains("caused by"));
    }
}
