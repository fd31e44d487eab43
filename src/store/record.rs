//! Text key/value codec for status records.
//!
//! One `key=value` pair per line. Values are escaped so an error detail with
//! embedded newlines stays on one line. Unknown keys are ignored on read.

use crate::model::{TaskRecord, TaskState};
use std::fmt::Write as _;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn encode(rec: &TaskRecord) -> String {
    let mut out = String::with_capacity(256);
    push(&mut out, "partition", &rec.partition_id);
    push(&mut out, "state", rec.state.as_label());
    push(&mut out, "items", &rec.items.to_string());
    push(&mut out, "attempts", &rec.attempts.to_string());
    if let Some(pid) = rec.pid {
        push(&mut out, "pid", &pid.to_string());
    }
    if let Some(t) = rec.start_time {
        push(&mut out, "start_time", &format_time(t));
    }
    if let Some(t) = rec.end_time {
        push(&mut out, "end_time", &format_time(t));
    }
    if let Some(code) = rec.exit_code {
        push(&mut out, "exit_code", &code.to_string());
    }
    if let Some(kind) = rec.failure {
        push(&mut out, "failure", kind.as_label());
    }
    if let Some(err) = rec.error.as_deref() {
        push(&mut out, "error", err);
    }
    if let Some(p) = rec.log_path.as_deref() {
        push(&mut out, "log", &p.to_string_lossy());
    }
    if let Some(p) = rec.raw_output_path.as_deref() {
        push(&mut out, "output", &p.to_string_lossy());
    }
    out
}

pub fn decode(text: &str) -> Result<TaskRecord, String> {
    let mut partition = None;
    let mut state = None;
    let mut rec = TaskRecord::pending("", 0);

    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: missing `=`", lineno + 1))?;
        let value = unescape(raw);
        let bad = |e: &dyn std::fmt::Display| format!("line {}: {key}: {e}", lineno + 1);
        match key {
            "partition" => partition = Some(value),
            "state" => state = Some(value.parse::<TaskState>().map_err(|e| bad(&e))?),
            "items" => rec.items = value.parse().map_err(|e| bad(&e))?,
            "attempts" => rec.attempts = value.parse().map_err(|e| bad(&e))?,
            "pid" => rec.pid = Some(value.parse().map_err(|e| bad(&e))?),
            "start_time" => rec.start_time = Some(parse_time(&value).map_err(|e| bad(&e))?),
            "end_time" => rec.end_time = Some(parse_time(&value).map_err(|e| bad(&e))?),
            "exit_code" => rec.exit_code = Some(value.parse().map_err(|e| bad(&e))?),
            "failure" => rec.failure = Some(value.parse().map_err(|e| bad(&e))?),
            "error" => rec.error = Some(value),
            "log" => rec.log_path = Some(PathBuf::from(value)),
            "output" => rec.raw_output_path = Some(PathBuf::from(value)),
            _ => {}
        }
    }

    rec.partition_id = partition.ok_or("missing `partition`")?;
    rec.state = state.ok_or("missing `state`")?;
    Ok(rec)
}

pub fn format_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.unix_timestamp().to_string())
}

fn parse_time(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(s, &Rfc3339)
}

fn push(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "{key}={}", escape(value));
}

fn escape(value: &str) -> String {
    let mut s = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => s.push_str("\\\\"),
            '\n' => s.push_str("\\n"),
            '\r' => s.push_str("\\r"),
            c => s.push(c),
        }
    }
    s
}

fn unescape(value: &str) -> String {
    let mut s = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            s.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => s.push('\n'),
            Some('r') => s.push('\r'),
            Some(other) => s.push(other),
            None => s.push('\\'),
        }
    }
    s
}
