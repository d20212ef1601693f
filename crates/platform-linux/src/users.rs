//! User database (`/etc/passwd`) parsing.
//!
//! One record per line, seven colon-separated fields:
//! `name:password:uid:gid:info:home:shell`. The password field is carried
//! opaquely. Uids are deliberately not assumed unique; collisions are a
//! detection target, not a parse error.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// One user database entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    pub info: String,
    pub home: String,
    pub shell: String,
}

impl UserRecord {
    /// Parse a single 7-field passwd line. Returns `None` when the line does
    /// not split into exactly seven fields or uid/gid is not an integer.
    pub fn from_passwd_line(line: &str) -> Option<Self> {
        let mut fields = line.split(':');
        let record = Self {
            name: fields.next()?.to_string(),
            password: fields.next()?.to_string(),
            uid: fields.next()?.parse().ok()?,
            gid: fields.next()?.parse().ok()?,
            info: fields.next()?.to_string(),
            home: fields.next()?.to_string(),
            shell: fields.next()?.to_string(),
        };
        if fields.next().is_some() {
            return None;
        }
        Some(record)
    }
}

impl fmt::Display for UserRecord {
    /// Renders the exact passwd line, so valid lines round-trip through
    /// `from_passwd_line`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}:{}",
            self.name, self.password, self.uid, self.gid, self.info, self.home, self.shell
        )
    }
}

/// Read and parse the user database. Blank lines are skipped; any malformed
/// line rejects the whole source.
pub fn read_users(path: &Path) -> Result<Vec<UserRecord>, SourceError> {
    let contents =
        fs::read_to_string(path).map_err(|err| SourceError::unavailable(path, err))?;
    parse_passwd(&contents, path)
}

/// Parse user database text. `path` is only used for error context.
pub fn parse_passwd(contents: &str, path: &Path) -> Result<Vec<UserRecord>, SourceError> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = UserRecord::from_passwd_line(trimmed)
            .ok_or_else(|| SourceError::malformed(path, trimmed))?;
        out.push(record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seven_field_line() {
        let user = UserRecord::from_passwd_line("root:x:0:0:root:/root:/bin/bash")
            .expect("valid line");
        assert_eq!(user.name, "root");
        assert_eq!(user.password, "x");
        assert_eq!(user.uid, 0);
        assert_eq!(user.gid, 0);
        assert_eq!(user.info, "root");
        assert_eq!(user.home, "/root");
        assert_eq!(user.shell, "/bin/bash");
    }

    #[test]
    fn display_round_trips_valid_lines() {
        let lines = [
            "root:x:0:0:root:/root:/bin/bash",
            "daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin",
            "gdm:x:127:133:Gnome Display Manager:/var/lib/gdm3:/bin/false",
            "empty::12:34:::",
        ];
        for line in lines {
            let user = UserRecord::from_passwd_line(line).expect("valid line");
            assert_eq!(user.to_string(), line);
            assert_eq!(UserRecord::from_passwd_line(&user.to_string()), Some(user));
        }
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(UserRecord::from_passwd_line("root:x:0:0:root:/root").is_none());
        assert!(UserRecord::from_passwd_line("root:x:0:0:root:/root:/bin/bash:extra").is_none());
    }

    #[test]
    fn rejects_non_integer_uid_gid() {
        assert!(UserRecord::from_passwd_line("root:x:abc:0:root:/root:/bin/bash").is_none());
        assert!(UserRecord::from_passwd_line("root:x:0:abc:root:/root:/bin/bash").is_none());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let contents = "root:x:0:0:root:/root:/bin/bash\n\n  \nsync:x:4:65534:sync:/bin:/bin/sync\n";
        let users = parse_passwd(contents, Path::new("/etc/passwd")).expect("parses");
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].name, "sync");
    }

    #[test]
    fn malformed_line_rejects_whole_source() {
        let contents = "root:x:0:0:root:/root:/bin/bash\nbroken line\n";
        let err = parse_passwd(contents, Path::new("/etc/passwd")).unwrap_err();
        match err {
            SourceError::Malformed { content, .. } => assert_eq!(content, "broken line"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_unavailable() {
        let err = read_users(Path::new("/this/passwd/does/not/exist")).unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }
}
