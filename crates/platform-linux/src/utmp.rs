//! Login-accounting (utmp/wtmp/btmp) records.
//!
//! The raw binary files are decoded by the system `utmpdump` tool behind the
//! [`UtmpDecoder`] seam, so this module only parses the dump's bracketed
//! text lines and tests can substitute the decoder. Field order in a dump
//! line: `[type] [pid] [id] [user] [line] [host] [addr] [timestamp]`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, FixedOffset};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SourceError;

/// First text on `utmpdump`'s single diagnostic stderr line.
pub const DUMP_BANNER: &str = "Utmp dump of";

static DUMP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d+)\] \[(\d+)\] \[(.+)\] \[(.+)\] \[(.+)\] \[(.+)\] \[(.+)\] \[(.+)\]$")
        .expect("dump line grammar")
});

/// One login-accounting record. All parsed fields are derived from `line`,
/// so the verbatim line alone is the record's identity.
#[derive(Debug, Clone)]
pub struct LoginRecord {
    pub line: String,
    pub record_type: i64,
    pub pid: i64,
    pub id: String,
    pub user: String,
    pub tty: String,
    pub host: String,
    pub addr_v6: String,
    pub time: DateTime<FixedOffset>,
}

impl PartialEq for LoginRecord {
    fn eq(&self, other: &Self) -> bool {
        self.line == other.line
    }
}

impl Eq for LoginRecord {}

impl Hash for LoginRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.line.hash(state);
    }
}

impl fmt::Display for LoginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

impl LoginRecord {
    /// Parse one dump line. Returns `None` when the line does not fully
    /// match the 8-field bracketed grammar.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = DUMP_LINE.captures(line)?;
        Some(Self {
            line: line.to_string(),
            record_type: caps[1].parse().ok()?,
            pid: caps[2].parse().ok()?,
            id: caps[3].trim().to_string(),
            user: caps[4].trim().to_string(),
            tty: caps[5].trim().to_string(),
            host: caps[6].trim().to_string(),
            addr_v6: caps[7].trim().to_string(),
            time: parse_dump_timestamp(caps[8].trim())?,
        })
    }
}

/// `utmpdump` prints ISO-8601 with a comma before the microseconds
/// (`2024-03-01T09:30:00,123456+00:00`); normalize to RFC 3339 and parse
/// offset-aware.
fn parse_dump_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(&raw.replace(',', ".")).ok()
}

/// Decodes one raw accounting file into dump lines. Production uses
/// [`UtmpDumpCommand`]; tests substitute canned lines.
pub trait UtmpDecoder {
    fn decode(&self, path: &Path) -> Result<Vec<String>, SourceError>;
}

/// Production decoder shelling out to util-linux `utmpdump`. The tool's
/// contract: record lines on stdout, exactly one diagnostic line starting
/// with [`DUMP_BANNER`] on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtmpDumpCommand;

impl UtmpDecoder for UtmpDumpCommand {
    fn decode(&self, path: &Path) -> Result<Vec<String>, SourceError> {
        let output = Command::new("utmpdump")
            .arg(path)
            .output()
            .map_err(|err| SourceError::unavailable(path, err))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr_matches_banner(&stderr) {
            return Err(SourceError::ExternalTool {
                path: path.to_path_buf(),
                detail: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().map(str::to_string).collect())
    }
}

fn stderr_matches_banner(stderr: &str) -> bool {
    let mut lines = stderr.lines();
    let first_ok = lines.next().is_some_and(|line| line.starts_with(DUMP_BANNER));
    first_ok && lines.next().is_none()
}

/// Parse dump output lines. Empty lines are skipped; anything else must
/// match the grammar or the whole source is rejected.
pub fn parse_dump_lines(lines: &[String], path: &Path) -> Result<Vec<LoginRecord>, SourceError> {
    let mut out = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = LoginRecord::parse(trimmed)
            .ok_or_else(|| SourceError::malformed(path, trimmed))?;
        out.push(record);
    }
    Ok(out)
}
