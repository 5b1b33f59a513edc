//! Runtime log file handling.
//!
//! The runtime writes structured `key=value` (logfmt) records to the file
//! named by `--log`. After a verb completes, every record is forwarded to
//! the supervisor's logger at debug level, and when the verb failed the
//! last record's `msg` value is folded into the returned error, yielding
//! messages like `runc start: exit status 1: container already exists`.
//! A malformed log line never masks the original error.

use crate::error::Error;
use tracing::debug;

/// Parses one logfmt line and returns the value of its `msg` key.
///
/// Values may be bare words or double-quoted strings with `\"` and `\\`
/// escapes. Lines without a `msg` key yield `None`.
pub fn parse_msg(line: &str) -> Option<String> {
    let mut rest = line.trim();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = &rest[..eq];
        rest = &rest[eq + 1..];

        let (value, remainder) = if let Some(stripped) = rest.strip_prefix('"') {
            parse_quoted(stripped)?
        } else {
            match rest.find(' ') {
                Some(space) => (rest[..space].to_string(), &rest[space..]),
                None => (rest.to_string(), ""),
            }
        };

        if key.trim() == "msg" {
            return Some(value);
        }
        rest = remainder.trim_start();
    }
    None
}

fn parse_quoted(rest: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars.next()?;
                value.push(escaped);
            }
            '"' => return Some((value, &rest[i + 1..])),
            _ => value.push(c),
        }
    }
    None
}

/// Forwards every parsed record of a runtime log to the logger.
pub fn forward_logs(verb: &str, contents: &str) {
    for line in contents.lines() {
        if let Some(msg) = parse_msg(line) {
            debug!(runtime_verb = verb, message = %msg, "runc");
        }
    }
}

/// Builds the error for a failed runtime verb, augmented with the last
/// parsed `msg` from the log file when one exists.
pub fn wrap_error(verb: &str, exit_status: i32, contents: &str) -> Error {
    let last_msg = contents.lines().filter_map(parse_msg).next_back();
    let message = match last_msg {
        Some(msg) if !msg.is_empty() => format!("exit status {exit_status}: {msg}"),
        _ => format!("exit status {exit_status}"),
    };
    Error::Runtime {
        verb: verb.to_string(),
        message,
    }
}
