//! Cell formatting helpers for the table renderer.

use chrono::{DateTime, Local};

/// Human-readable byte count.
///
/// Values under 1 KiB print exact (`999b`); larger values pick the biggest
/// suffix that keeps the mantissa in `[1.0, 1000)` and print one decimal.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes}b");
    }
    const SUFFIXES: [char; 4] = ['K', 'M', 'G', 'T'];
    let mut value = bytes as f64 / 1024.0;
    let mut idx = 0;
    while value >= 1000.0 && idx < SUFFIXES.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    format!("{value:.1}{}", SUFFIXES[idx])
}

/// Local wall-clock time in the `%X` shape the laccess column uses.
#[must_use]
pub fn format_time(t: &DateTime<Local>) -> String {
    t.format("%X").to_string()
}

/// Keep the tail of an over-long string, marking the cut with a `...`
/// prefix. Paths truncate this way so the filename stays visible.
#[must_use]
pub fn truncate_left(s: &str, max: usize) -> String {
    const FILL: &str = "...";
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }
    if max <= FILL.len() {
        return String::new();
    }
    let keep = max - FILL.len();
    let tail: String = s.chars().skip(len - keep).collect();
    format!("{FILL}{tail}")
}

/// Keep the head of an over-long string, marking the cut with a `...`
/// suffix. The command line truncates this way.
#[must_use]
pub fn truncate_right(s: &str, max: usize) -> String {
    const FILL: &str = "...";
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }
    if max <= FILL.len() {
        return String::new();
    }
    let keep = max - FILL.len();
    let head: String = s.chars().take(keep).collect();
    format!("{head}{FILL}")
}
