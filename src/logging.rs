//! Structured logging for the sync core.
//!
//! Provides the [`mlog!`] macro for consistent log output in the format:
//!
//! ```text
//! 2026-08-07 21:33:12.000 - src/channel.rs:42 - channel: applied pushed event n:Zk9qTx2Q
//! ```
//!
//! When stderr is a terminal, timestamps and source locations are dimmed and
//! notification/user ids get deterministic colours so interleaved pipeline
//! logs stay readable. Call [`set_writer`] to redirect output to any
//! [`std::io::Write`] implementor (file, in-memory buffer, test capture);
//! installing a custom writer disables colour codes.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the log writer. All subsequent [`mlog!`] output goes to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Bright, visually distinct colours for id hashing.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
];

fn hash_colour(id: &str) -> &'static str {
    let mut hasher = DefaultHasher::new();
    hasher.write(id.as_bytes());
    ID_COLOURS[(hasher.finish() as usize) % ID_COLOURS.len()]
}

const ID_PREVIEW_LEN: usize = 8;

fn shorten(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(ID_PREVIEW_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a notification id with consistent colour and truncation.
///
/// Returns e.g. `n:Zk9qTx2Q` (plain) or the same wrapped in a colour code.
pub fn notif_id(id: &str) -> String {
    let short = shorten(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}n:{short}{RESET}")
    } else {
        format!("n:{short}")
    }
}

/// Format a user id with consistent colour and truncation.
pub fn user_id(id: &str) -> String {
    let short = shorten(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}u:{short}{RESET}")
    } else {
        format!("u:{short}")
    }
}

/// Write a single log line to the current writer.
///
/// Called by the [`mlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// mlog!("sync: applied {} fetched notification(s)", count);
/// mlog!("resolver: rolled back read state for {}", logging::notif_id(&id));
/// ```
#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
