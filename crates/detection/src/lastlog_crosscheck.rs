//! Cross-reference of last-login records against login accounting.
//!
//! Every last-login entry was once written alongside a matching accounting
//! record; a last-login entry with no accounting record for the same user
//! in the same second means someone cleaned wtmp/utmp and forgot (or was
//! unable) to fix lastlog.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use baseline::{diff_sets, PersistedSnapshot, SnapshotError, SnapshotStore};
use platform_linux::lastlog::{read_lastlog, LastLoginRecord};
use platform_linux::users::read_users;
use platform_linux::utmp::{parse_dump_lines, LoginRecord, UtmpDecoder};

use crate::report::ReportSink;
use crate::util::{from_fields, to_fields};

/// Source identifier attached to this unit's findings and errors.
pub const SOURCE: &str = "lastlog_crosscheck";

const SNAPSHOT_KEY: &str = "lastlog_xref";

#[derive(Debug, Clone)]
pub struct LastlogCrossCheckConfig {
    pub lastlog_path: PathBuf,
    pub passwd_path: PathBuf,
    /// Accounting files to search for matches; missing files are skipped.
    pub accounting_files: Vec<PathBuf>,
}

impl Default for LastlogCrossCheckConfig {
    fn default() -> Self {
        Self {
            lastlog_path: PathBuf::from("/var/log/lastlog"),
            passwd_path: PathBuf::from("/etc/passwd"),
            accounting_files: vec![
                PathBuf::from("/var/run/utmp"),
                PathBuf::from("/var/log/wtmp"),
                PathBuf::from("/var/log/wtmp.1"),
            ],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CrossCheckSnapshot {
    #[serde(default)]
    missing_entries: Vec<LastLoginRecord>,
}

pub struct LastlogCrossCheck<D: UtmpDecoder> {
    config: LastlogCrossCheckConfig,
    store: SnapshotStore,
    decoder: D,
}

impl<D: UtmpDecoder> LastlogCrossCheck<D> {
    pub fn new(config: LastlogCrossCheckConfig, store: SnapshotStore, decoder: D) -> Self {
        Self {
            config,
            store,
            decoder,
        }
    }

    pub fn run(&self, sink: &mut dyn ReportSink) {
        let previous = match self.load_state() {
            Ok(previous) => previous,
            Err(message) => {
                sink.emit_error(SOURCE, &message);
                return;
            }
        };

        // The user database and the lastlog file are mandatory sources.
        let users = match read_users(&self.config.passwd_path) {
            Ok(users) => users,
            Err(err) => {
                sink.emit_error(SOURCE, &err.to_string());
                return;
            }
        };
        let lastlog = match read_lastlog(&self.config.lastlog_path, &users) {
            Ok(lastlog) => lastlog,
            Err(err) => {
                sink.emit_error(SOURCE, &err.to_string());
                return;
            }
        };

        let mut accounting: Vec<LoginRecord> = Vec::new();
        for file in &self.config.accounting_files {
            if !file.is_file() {
                continue;
            }
            match self
                .decoder
                .decode(file)
                .and_then(|lines| parse_dump_lines(&lines, file))
            {
                Ok(mut records) => accounting.append(&mut records),
                Err(err) => {
                    sink.emit_error(SOURCE, &err.to_string());
                    continue;
                }
            }
        }
        debug!(
            lastlog = lastlog.len(),
            accounting = accounting.len(),
            "cross-reference inputs parsed"
        );

        let missing: Vec<LastLoginRecord> = lastlog
            .into_iter()
            .filter(|entry| !has_accounting_match(entry, &accounting))
            .collect();
        let missing_set: BTreeSet<LastLoginRecord> = missing.iter().cloned().collect();

        let diff = diff_sets(&previous, &missing_set);
        if !diff.added.is_empty() {
            let mut message = format!(
                "{} missing entry (or entries) in {} found:\n",
                missing.len(),
                self.config.lastlog_path.display()
            );
            for entry in &missing {
                let _ = write!(message, "\nMissing entry: {entry}");
            }
            sink.emit_finding(SOURCE, &message);
        }

        if let Err(err) = self.store_state(missing) {
            sink.emit_error(SOURCE, &err.to_string());
        }
    }

    fn load_state(&self) -> Result<BTreeSet<LastLoginRecord>, String> {
        let snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .map_err(|err| err.to_string())?;
        // The legacy layout already used the same single field.
        let fields = match snapshot {
            PersistedSnapshot::V0(fields) | PersistedSnapshot::V1(fields) => fields,
        };
        let raw: CrossCheckSnapshot = from_fields(fields)?;
        Ok(raw.missing_entries.into_iter().collect())
    }

    fn store_state(&self, missing: Vec<LastLoginRecord>) -> Result<(), SnapshotError> {
        let snapshot = CrossCheckSnapshot {
            missing_entries: missing,
        };
        self.store.store(SNAPSHOT_KEY, to_fields(&snapshot)?)
    }
}

/// A last-login entry matches when any accounting record names the same
/// user in the same second. Accounting timestamps carry microseconds and
/// are truncated for the comparison.
fn has_accounting_match(entry: &LastLoginRecord, accounting: &[LoginRecord]) -> bool {
    accounting.iter().any(|record| {
        record.user == entry.name && record.time.timestamp() == entry.time.timestamp()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;
    use crate::test_support::{dump_line, StaticDecoder};

    const LOGIN_TS: u32 = 1_709_285_400; // 2024-03-01T09:30:00Z

    struct Fixture {
        _dir: tempfile::TempDir,
        passwd: PathBuf,
        lastlog: PathBuf,
        wtmp: PathBuf,
        store: SnapshotStore,
    }

    fn fixture(lastlog_records: &[(u32, u32)]) -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let passwd = dir.path().join("passwd");
        std::fs::write(
            &passwd,
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1:1::/home/alice:/bin/bash\n",
        )
        .expect("write passwd");

        // Sparse lastlog: records addressed by uid, zero-filled otherwise.
        let max_uid = lastlog_records.iter().map(|(uid, _)| *uid).max().unwrap_or(0);
        let mut bytes = vec![0u8; (max_uid as usize + 1) * platform_linux::lastlog::RECORD_SIZE];
        for (uid, timestamp) in lastlog_records {
            let offset = *uid as usize * platform_linux::lastlog::RECORD_SIZE;
            bytes[offset..offset + 4].copy_from_slice(&timestamp.to_le_bytes());
            bytes[offset + 4..offset + 9].copy_from_slice(b"pts/0");
            bytes[offset + 36..offset + 40].copy_from_slice(b"host");
        }
        let lastlog = dir.path().join("lastlog");
        std::fs::write(&lastlog, bytes).expect("write lastlog");

        let wtmp = dir.path().join("wtmp");
        std::fs::write(&wtmp, b"raw").expect("write wtmp");
        let store = SnapshotStore::new(dir.path().join("state"));
        Fixture {
            passwd,
            lastlog,
            wtmp,
            store,
            _dir: dir,
        }
    }

    fn check(fixture: &Fixture, decoder: StaticDecoder) -> LastlogCrossCheck<StaticDecoder> {
        LastlogCrossCheck::new(
            LastlogCrossCheckConfig {
                lastlog_path: fixture.lastlog.clone(),
                passwd_path: fixture.passwd.clone(),
                accounting_files: vec![fixture.wtmp.clone()],
            },
            fixture.store.clone(),
            decoder,
        )
    }

    #[test]
    fn matched_entries_are_quiet() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        let mut decoder = StaticDecoder::new();
        decoder.insert(
            &fixture.wtmp,
            // Same second, different microseconds.
            &[&dump_line(7, 1000, "alice", "2024-03-01T09:30:00,734501+00:00")],
        );
        let mut sink = MemorySink::new();
        check(&fixture, decoder).run(&mut sink);
        assert!(sink.findings.is_empty());
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn unmatched_entry_is_reported() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        let mut decoder = StaticDecoder::new();
        decoder.insert(
            &fixture.wtmp,
            // Different second.
            &[&dump_line(7, 1000, "alice", "2024-03-01T09:30:01,000000+00:00")],
        );
        let mut sink = MemorySink::new();
        check(&fixture, decoder).run(&mut sink);
        assert_eq!(sink.findings.len(), 1);
        let message = &sink.findings[0].1;
        assert!(message.starts_with("1 missing entry (or entries)"));
        assert!(message.contains("Missing entry: 1 alice pts/0 host"));
    }

    #[test]
    fn same_second_different_user_does_not_match() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        let mut decoder = StaticDecoder::new();
        decoder.insert(
            &fixture.wtmp,
            &[&dump_line(7, 1000, "mallory", "2024-03-01T09:30:00,000000+00:00")],
        );
        let mut sink = MemorySink::new();
        check(&fixture, decoder).run(&mut sink);
        assert_eq!(sink.findings.len(), 1);
    }

    #[test]
    fn missing_record_is_reported_exactly_once_across_runs() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        let mut decoder = StaticDecoder::new();
        decoder.insert(&fixture.wtmp, &[]);

        let check = check(&fixture, decoder);
        let mut first = MemorySink::new();
        check.run(&mut first);
        assert_eq!(first.findings.len(), 1);

        let mut second = MemorySink::new();
        check.run(&mut second);
        assert!(second.findings.is_empty(), "no duplicate findings for known state");
    }

    #[test]
    fn missing_passwd_aborts_the_run() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        std::fs::remove_file(&fixture.passwd).expect("remove passwd");
        let mut decoder = StaticDecoder::new();
        decoder.insert(&fixture.wtmp, &[]);
        let mut sink = MemorySink::new();
        check(&fixture, decoder).run(&mut sink);
        assert_eq!(sink.errors.len(), 1);
        assert!(sink.findings.is_empty());
    }

    #[test]
    fn missing_accounting_file_is_not_an_error() {
        let fixture = fixture(&[(1, LOGIN_TS)]);
        std::fs::remove_file(&fixture.wtmp).expect("remove wtmp");
        let mut sink = MemorySink::new();
        check(&fixture, StaticDecoder::new()).run(&mut sink);
        assert!(sink.errors.is_empty());
        // With no accounting data every lastlog entry is missing.
        assert_eq!(sink.findings.len(), 1);
    }
}
