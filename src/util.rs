//! Small shared helpers: SQL literal escaping and date utilities.

use chrono::Local;

/// Escape a string for inclusion in a single-quoted SQL literal.
///
/// Doubles single quotes and backslashes; everything else passes through
/// unchanged so the target database reads back the original value.
pub fn encode_sql(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Current date in the server's local timezone as `YYYY-MM-DD`.
///
/// Used by handler-side validators comparing client-supplied DATE
/// parameters against "today".
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}
