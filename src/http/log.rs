//! Access logging in the Apache common/combined format family.
//!
//! The format string uses `%`-placeholders: `%h` remote host, `%l` and
//! `%u` identity/user (always `-` here), `%t` request time, `%r` request
//! line, `%s` status, `%b` body bytes (`-` for zero), `%f` request path,
//! `%a` peer IP, `%T` handling time in seconds, `%D` handling time in
//! microseconds, `%%` a literal percent. Lines are emitted through the
//! `log` facade under the `weft::http::access` target.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

/// The classic common log format.
pub const COMMON_LOG_FORMAT: &str = "%h %l %u %t \"%r\" %s %b";

pub(crate) struct AccessLogEntry<'a> {
    pub peer: Option<std::net::SocketAddr>,
    pub request_line: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub body_bytes: u64,
    pub started: SystemTime,
    pub duration: Duration,
}

pub(crate) fn write_access_log(format: &str, entry: &AccessLogEntry<'_>) {
    let mut line = String::with_capacity(format.len() + 64);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            line.push(c);
            continue;
        }
        match chars.next() {
            Some('h') | Some('a') => match entry.peer {
                Some(addr) => line.push_str(&addr.ip().to_string()),
                None => line.push('-'),
            },
            Some('l') | Some('u') => line.push('-'),
            Some('t') => line.push_str(&format_clf_time(entry.started)),
            Some('r') => line.push_str(entry.request_line),
            Some('s') => line.push_str(&entry.status.to_string()),
            Some('b') => {
                if entry.body_bytes == 0 {
                    line.push('-');
                } else {
                    line.push_str(&entry.body_bytes.to_string());
                }
            }
            Some('f') => line.push_str(entry.path),
            Some('T') => line.push_str(&entry.duration.as_secs().to_string()),
            Some('D') => line.push_str(&entry.duration.as_micros().to_string()),
            Some('%') => line.push('%'),
            Some(other) => {
                line.push('%');
                line.push(other);
            }
            None => line.push('%'),
        }
    }
    log::info!(target: "weft::http::access", "{line}");
}

/// `[10/Oct/2000:13:55:36 +0000]`, always UTC.
fn format_clf_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t)
        .format("[%d/%b/%Y:%H:%M:%S %z]")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn clf_time_shape() {
        let t = UNIX_EPOCH + Duration::from_secs(971_186_136);
        assert_eq!(format_clf_time(t), "[10/Oct/2000:13:55:36 +0000]");
    }

    #[test]
    fn clf_time_handles_leap_day() {
        let t = UNIX_EPOCH + Duration::from_secs(951_782_400);
        assert_eq!(format_clf_time(t), "[29/Feb/2000:00:00:00 +0000]");
    }
}
