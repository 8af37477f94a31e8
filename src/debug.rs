use crate::protocol::MessageKind;
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize diagnostics from environment variables
///
/// - `WIRESYNC_DEBUG=1`: JSON pretty-printing of decoded values
/// - `WIRESYNC_TRACE=1`: human-readable operation traces on stderr
pub fn init_debug_mode() {
    let debug = env::var("WIRESYNC_DEBUG").is_ok();
    let trace = env::var("WIRESYNC_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        eprintln!("[wiresync] debug mode enabled - decoded values logged as JSON");
    }
    if trace {
        eprintln!("[wiresync] trace mode enabled - operation logs on stderr");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Dump any serializable value as pretty JSON if debug mode is enabled
pub fn log_value<T: Serialize>(label: &str, value: &T) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(value) {
        Ok(json) => eprintln!("\n[wiresync] {label}:\n{json}\n"),
        Err(e) => eprintln!("[wiresync] failed to serialize {label} to JSON: {e}"),
    }
}

pub fn trace_send(kind: MessageKind, bytes: usize, destination: &str) {
    if !is_trace_enabled() {
        return;
    }
    eprintln!("[wiresync] → {kind:?} ({bytes} bytes) to {destination}");
}

pub fn trace_receive(kind: MessageKind, bytes: usize, source: &str) {
    if !is_trace_enabled() {
        return;
    }
    eprintln!("[wiresync] ← {kind:?} ({bytes} bytes) from {source}");
}

/// Trace one delta send: which entity/component changed and which mask bits
pub fn trace_delta(network_id: u32, type_id: u16, mask: u32) {
    if !is_trace_enabled() {
        return;
    }
    eprintln!(
        "[wiresync] delta entity {network_id} type {type_id} mask {mask:#034b} ({} fields)",
        mask.count_ones()
    );
}

pub fn trace_tick(tick: u32, clients: usize) {
    if !is_trace_enabled() {
        return;
    }
    eprintln!("[wiresync] tick {tick} ({clients} clients)");
}

/// One-line summary of a wire message, for logs
pub fn message_summary(kind: MessageKind, tick: u32) -> String {
    format!("{kind:?} (tick: {tick})")
}

/// Format bytes in human-readable form (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_message_summary() {
        assert_eq!(
            message_summary(MessageKind::EntitySpawn, 42),
            "EntitySpawn (tick: 42)"
        );
    }

    #[test]
    fn test_debug_mode_initialization() {
        // must not crash without env vars
        init_debug_mode();
    }
}
