//! Fire-and-forget notification hook.
//!
//! Lifecycle events are handed to an external command as a single string
//! argument, `"[<event>] <room> <detail>"`.  The hook runs detached; a
//! missing or failing hook is logged and otherwise ignored.

use tokio::process::Command;

/// Default hook executable.  Override with `HUSH_NOTIFY_HOOK`.
const NOTIFY_HOOK: &str = "/usr/local/bin/hush-notify.sh";

/// Emit a lifecycle event (`room.created`, `system.start`, ...).
///
/// Must be called from within a tokio runtime; the hook process runs in a
/// detached task so the caller never waits on it.
pub fn emit(event: &str, room: &str, detail: &str) {
    crate::tlog!("notify: {event} {room} {detail}");

    let message = format!("[{event}] {room} {detail}");
    let hook = std::env::var("HUSH_NOTIFY_HOOK").unwrap_or_else(|_| NOTIFY_HOOK.to_string());

    tokio::spawn(async move {
        match Command::new(&hook).arg(&message).output().await {
            Ok(output) if !output.status.success() => {
                crate::tlog!(
                    "notify: hook exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(_) => {}
            Err(e) => crate::tlog!("notify: hook failed: {e}"),
        }
    });
}
