//! Logging helpers for raw serial traffic.
//! Scales emit CR/LF-terminated ASCII, sometimes with stray control bytes or
//! line noise after a baud mismatch; these helpers keep such data on one log line.

/// Render raw bytes for single-line logging.
///
/// Printable ASCII is kept, `\r` `\n` `\t` and backslash are escaped, and every
/// other byte becomes `\xNN`. Output past `max_bytes` input bytes is cut with an
/// ellipsis.
pub fn escape_bytes(data: &[u8], max_bytes: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len().min(max_bytes) + 8);
    for (i, &b) in data.iter().enumerate() {
        if i >= max_bytes {
            out.push('…');
            break;
        }
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(&mut out, "\\x{:02X}", b);
            }
        }
    }
    out
}

/// Shorthand for logging a decoded scale line.
pub fn escape_line(s: &str) -> String {
    const MAX_PREVIEW: usize = 120;
    escape_bytes(s.as_bytes(), MAX_PREVIEW)
}
