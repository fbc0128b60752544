//! Logging for the relay process.
//!
//! A single process-wide sink pairs the output writer with a colour flag, so
//! swapping one always keeps the other consistent.  Lines carry a timestamp
//! and source location:
//!
//! ```text
//! 2026-08-02T12:33:12.000 - src/main.rs:42 - relay: room created room:3f9a2c1d
//! ```
//!
//! The timestamp reuses the crate's RFC 3339 formatter from
//! [`crate::storage`], with millisecond precision appended; there is exactly
//! one civil-date implementation in the crate.
//!
//! Room tokens are the only identifiers worth colouring here.  They are
//! uniformly random 32-character hex strings, so [`room_id`] shortens them to
//! their first eight characters and derives a stable colour directly from the
//! leading byte — no hashing needed.
//!
//! By default lines go to stderr, coloured when stderr is a terminal.  Call
//! [`set_writer`] to redirect output to any [`std::io::Write`] implementor
//! (file, in-memory test capture, etc.); installing a writer turns colour
//! off.

use std::io::{self, IsTerminal, Write};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

struct Sink {
    writer: Box<dyn Write + Send>,
    colour: bool,
}

static SINK: LazyLock<Mutex<Sink>> = LazyLock::new(|| {
    Mutex::new(Sink {
        writer: Box::new(io::stderr()),
        colour: false,
    })
});

/// Initialize logging.  Call once at startup: turns colour on when stderr
/// is a terminal.
pub fn init() {
    SINK.lock().unwrap().colour = io::stderr().is_terminal();
}

/// Replace the log writer.  All subsequent [`tlog!`] output goes to `w`,
/// uncoloured — a replacement writer is unlikely to be a colour terminal.
pub fn set_writer(w: Box<dyn Write + Send>) {
    let mut sink = SINK.lock().unwrap();
    sink.writer = w;
    sink.colour = false;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    SINK.lock().unwrap().colour
}

// ANSI escape codes
const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Bright foreground colours, indexed by a token's leading byte.
const TOKEN_COLOURS: &[&str] = &[
    "\x1b[92m", // green
    "\x1b[93m", // yellow
    "\x1b[94m", // blue
    "\x1b[95m", // magenta
    "\x1b[96m", // cyan
    "\x1b[91m", // red
];

/// Length of the token prefix shown in log lines.  Eight hex characters give
/// 32 bits, plenty to tell concurrent rooms apart by eye.
const TOKEN_PREFIX_LEN: usize = 8;

/// Format a room token for log lines: shortened, and coloured by its leading
/// byte so interleaved rooms stay visually distinct.
///
/// Returns e.g. `room:3f9a2c1d` (plain) or `\x1b[92mroom:3f9a2c1d\x1b[0m`
/// (colour).
pub fn room_id(token: &str) -> String {
    // Tokens are ASCII hex, so byte slicing is safe; anything shorter or
    // stranger falls back to the whole string.
    let short = token.get(..TOKEN_PREFIX_LEN).unwrap_or(token);
    if !colour_enabled() {
        return format!("room:{short}");
    }
    let lead = u8::from_str_radix(token.get(..2).unwrap_or(""), 16).unwrap_or(0);
    let colour = TOKEN_COLOURS[lead as usize % TOKEN_COLOURS.len()];
    format!("{colour}room:{short}{RESET}")
}

/// Wall-clock time as `YYYY-MM-DDTHH:MM:SS.mmm`, built from the crate's
/// RFC 3339 formatter plus the sub-second remainder.
fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let date_time = crate::storage::format_rfc3339(now.as_secs() as i64);
    let date_time = date_time.trim_end_matches('Z');
    format!("{date_time}.{:03}", now.subsec_millis())
}

/// Write a single log line to the current sink.
///
/// Called by the [`tlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = timestamp();
    let mut sink = SINK.lock().unwrap();
    let result = if sink.colour {
        writeln!(sink.writer, "{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        writeln!(sink.writer, "{ts} - {file}:{line} - {msg}")
    };
    let _ = result;
}

/// Emit a log line to the current sink with timestamp and source location.
///
/// By default writes to stderr.  Install a different destination with
/// [`set_writer`].
///
/// # Usage
///
/// ```ignore
/// tlog!("relay: replayed {} message(s)", count);
/// tlog!("relay: room expired {}", logging::room_id(&token));
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
