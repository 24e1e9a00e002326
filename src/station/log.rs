//! Station log levels on top of `tracing`.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LEVEL_NAMES:[&str; 8] = [
    "XDEBUG", "DEBUG", "VERBOSE", "INFO", "NOTICE", "WARNING", "ERROR", "CRITICAL",
];

/// Accepts a level name or its number 0..7.
pub fn parse_level(s: &str) -> Option<Level> {
    let s = s.trim();
    let idx = match s.parse::<usize>() {
        Ok(n) if n < LEVEL_NAMES.len() => n,
        Ok(_) => return None,
        Err(_) => LEVEL_NAMES.iter().position(|n| n.eq_ignore_ascii_case(s))?,
    };
    Some(match idx {
        0 => Level::TRACE,
        1 | 2 => Level::DEBUG,
        3 | 4 => Level::INFO,
        5 => Level::WARN,
        _ => Level::ERROR,
    })
}

/// Installs the process wide subscriber, appending to `file` if given.
/// Returns false if a subscriber was installed before.
pub fn init(level: &str, file: Option<&Path>) -> Result<bool> {
    let lvl = parse_level(level).ok_or_else(|| anyhow!("unknown log level: {}", level))?;
    let filter = EnvFilter::default().add_directive(LevelFilter::from_level(lvl).into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let res = match file {
        Some(p) => {
            let f = OpenOptions::new().create(true).append(true).open(p)?;
            builder.with_ansi(false).with_writer(Mutex::new(f)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    Ok(res.is_ok())
}
