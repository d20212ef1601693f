//! Last-login (`/var/log/lastlog`) parsing.
//!
//! Binary file of fixed 292-byte records: a 4-byte little-endian epoch
//! timestamp, a 32-byte NUL-padded device, a 256-byte NUL-padded host. The
//! record at byte offset `uid * 292` belongs to uid `uid`, so the file is
//! joined against the current user database to resolve names.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::users::UserRecord;

const TIMESTAMP_LEN: usize = 4;
const DEVICE_LEN: usize = 32;
const HOST_LEN: usize = 256;

/// On-disk size of one lastlog record.
pub const RECORD_SIZE: usize = TIMESTAMP_LEN + DEVICE_LEN + HOST_LEN;

/// A user's most recent login. Timestamps carry second precision and are
/// always UTC; persisted form stores epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LastLoginRecord {
    pub uid: u32,
    pub name: String,
    pub device: String,
    pub host: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
}

impl fmt::Display for LastLoginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.uid, self.name, self.device, self.host, self.time
        )
    }
}

/// Read and parse the lastlog file, emitting only uids that exist in the
/// given user database snapshot.
pub fn read_lastlog(path: &Path, users: &[UserRecord]) -> Result<Vec<LastLoginRecord>, SourceError> {
    let bytes = fs::read(path).map_err(|err| SourceError::unavailable(path, err))?;
    parse_lastlog(&bytes, users, path)
}

/// Decode raw lastlog bytes. A record with timestamp 0 means "never logged
/// in" and is skipped; a record whose uid has no user database entry is
/// skipped as well (stale slot, not an error). A short trailing record or
/// non-UTF-8 text rejects the source with the raw bytes for diagnosis.
pub fn parse_lastlog(
    bytes: &[u8],
    users: &[UserRecord],
    path: &Path,
) -> Result<Vec<LastLoginRecord>, SourceError> {
    let mut names: BTreeMap<u32, &str> = BTreeMap::new();
    for user in users {
        names.insert(user.uid, &user.name);
    }

    let mut out = Vec::new();
    for (index, chunk) in bytes.chunks(RECORD_SIZE).enumerate() {
        if chunk.len() != RECORD_SIZE {
            return Err(SourceError::malformed(path, format!("{chunk:02x?}")));
        }

        let timestamp = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if timestamp == 0 {
            continue;
        }
        let uid = index as u32;
        let Some(name) = names.get(&uid) else {
            continue;
        };

        let device = decode_padded(&chunk[TIMESTAMP_LEN..TIMESTAMP_LEN + DEVICE_LEN])
            .ok_or_else(|| SourceError::malformed(path, format!("{chunk:02x?}")))?;
        let host = decode_padded(&chunk[TIMESTAMP_LEN + DEVICE_LEN..])
            .ok_or_else(|| SourceError::malformed(path, format!("{chunk:02x?}")))?;
        let time = DateTime::<Utc>::from_timestamp(i64::from(timestamp), 0)
            .ok_or_else(|| SourceError::malformed(path, format!("{chunk:02x?}")))?;

        out.push(LastLoginRecord {
            uid,
            name: (*name).to_string(),
            device,
            host,
            time,
        });
    }
    Ok(out)
}

/// Strip NUL padding and whitespace; `None` on invalid UTF-8.
fn decode_padded(raw: &[u8]) -> Option<String> {
    let stripped: Vec<u8> = raw.iter().copied().filter(|byte| *byte != 0).collect();
    let text = String::from_utf8(stripped).ok()?;
    Some(text.trim().to_string())
}
