//! User database monitoring.
//!
//! Three rules over one snapshot: entry integrity (entries added, removed,
//! or modified since the last run), uid collisions (two entries sharing a
//! uid can impersonate each other), and service accounts carrying an
//! interactive login shell.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use baseline::{diff_maps, diff_sets, PersistedSnapshot, SnapshotError, SnapshotStore};
use platform_linux::users::{read_users, UserRecord};

use crate::report::ReportSink;
use crate::util::{from_fields, to_fields};

/// Source identifier attached to this unit's findings and errors.
pub const SOURCE: &str = "passwd_monitor";

const SNAPSHOT_KEY: &str = "passwd_monitor";

/// Uids strictly below this belong to service accounts; uid 0 is root and
/// exempt from the service-account rule.
const SERVICE_UID_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct PasswdMonitorConfig {
    pub passwd_path: PathBuf,
    /// Shells that do not allow interactive login.
    pub shell_no_login: BTreeSet<String>,
    /// Service accounts allowed an interactive shell: name → allowed shells.
    pub service_shell_whitelist: BTreeMap<String, BTreeSet<String>>,
}

impl Default for PasswdMonitorConfig {
    fn default() -> Self {
        Self {
            passwd_path: PathBuf::from("/etc/passwd"),
            shell_no_login: [
                "/usr/bin/false",
                "/bin/false",
                "/sbin/nologin",
                "/usr/sbin/nologin",
                "/usr/bin/nologin",
                "/bin/nologin",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            service_shell_whitelist: BTreeMap::from([(
                "sync".to_string(),
                BTreeSet::from(["/bin/sync".to_string()]),
            )]),
        }
    }
}

/// Persisted layout. Entries are stored as their verbatim passwd lines,
/// which keeps the document diffable by eye and round-trips exactly.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PasswdSnapshot {
    #[serde(default)]
    passwd: BTreeMap<String, String>,
    #[serde(default)]
    uid_collision: BTreeSet<u32>,
    #[serde(default)]
    uid_service_interactive_shell: BTreeSet<u32>,
}

#[derive(Debug, Default)]
struct PasswdState {
    passwd: BTreeMap<String, UserRecord>,
    uid_collision: BTreeSet<u32>,
    uid_service_interactive_shell: BTreeSet<u32>,
}

pub struct PasswdMonitor {
    config: PasswdMonitorConfig,
    store: SnapshotStore,
}

impl PasswdMonitor {
    pub fn new(config: PasswdMonitorConfig, store: SnapshotStore) -> Self {
        Self { config, store }
    }

    /// One pass: load the prior snapshot, compare against the current user
    /// database, report deltas, persist the new snapshot. Errors surface as
    /// error events and leave the snapshot untouched.
    pub fn run(&self, sink: &mut dyn ReportSink) {
        let previous = match self.load_state() {
            Ok(previous) => previous,
            Err(message) => {
                sink.emit_error(SOURCE, &message);
                return;
            }
        };

        let current = match read_users(&self.config.passwd_path) {
            Ok(users) => index_by_name(users),
            Err(err) => {
                sink.emit_error(SOURCE, &err.to_string());
                return;
            }
        };
        debug!(entries = current.len(), "user database parsed");

        check_changes(&previous.passwd, &current, sink);
        let uid_collision = check_uid_collisions(&previous.uid_collision, &current, sink);
        let uid_service_shell = self.check_service_shells(
            &previous.uid_service_interactive_shell,
            &current,
            sink,
        );

        if let Err(err) = self.store_state(&current, &uid_collision, &uid_service_shell) {
            sink.emit_error(SOURCE, &err.to_string());
        }
    }

    fn load_state(&self) -> Result<PasswdState, String> {
        let snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .map_err(|err| err.to_string())?;
        let raw = match snapshot {
            PersistedSnapshot::V1(fields) => from_fields::<PasswdSnapshot>(fields)?,
            // Legacy layout: the whole document is the name → line mapping.
            PersistedSnapshot::V0(fields) => PasswdSnapshot {
                passwd: from_fields(fields)?,
                ..PasswdSnapshot::default()
            },
        };

        let mut passwd = BTreeMap::new();
        for (name, line) in raw.passwd {
            let record = UserRecord::from_passwd_line(&line)
                .ok_or_else(|| format!("unparsable stored passwd entry: {line}"))?;
            passwd.insert(name, record);
        }
        Ok(PasswdState {
            passwd,
            uid_collision: raw.uid_collision,
            uid_service_interactive_shell: raw.uid_service_interactive_shell,
        })
    }

    fn store_state(
        &self,
        current: &BTreeMap<String, UserRecord>,
        uid_collision: &BTreeSet<u32>,
        uid_service_shell: &BTreeSet<u32>,
    ) -> Result<(), SnapshotError> {
        let snapshot = PasswdSnapshot {
            passwd: current
                .iter()
                .map(|(name, user)| (name.clone(), user.to_string()))
                .collect(),
            uid_collision: uid_collision.clone(),
            uid_service_interactive_shell: uid_service_shell.clone(),
        };
        self.store.store(SNAPSHOT_KEY, to_fields(&snapshot)?)
    }

    /// Service accounts (0 < uid < 1000) with an interactive login shell,
    /// minus the per-account whitelist. Root is exempt.
    fn check_service_shells(
        &self,
        previous: &BTreeSet<u32>,
        current_passwd: &BTreeMap<String, UserRecord>,
        sink: &mut dyn ReportSink,
    ) -> BTreeSet<u32> {
        let config = &self.config;
        let mut matching = BTreeSet::new();
        for user in current_passwd.values() {
            if user.uid == 0 || user.uid >= SERVICE_UID_LIMIT {
                continue;
            }
            if config.shell_no_login.contains(&user.shell) {
                continue;
            }
            if config
                .service_shell_whitelist
                .get(&user.name)
                .is_some_and(|shells| shells.contains(&user.shell))
            {
                continue;
            }
            matching.insert(user.uid);
        }

        let diff = diff_sets(previous, &matching);
        if !diff.added.is_empty() {
            let mut message = String::from("Service accounts with interactive shell found.\n");
            for uid in &diff.added {
                push_entries_for_uid(&mut message, *uid, current_passwd);
            }
            sink.emit_finding(SOURCE, &message);
        }
        if !diff.removed.is_empty() {
            let mut message = String::from("Service accounts removed interactive shell.\n");
            for uid in &diff.removed {
                push_entries_for_uid(&mut message, *uid, current_passwd);
            }
            sink.emit_finding(SOURCE, &message);
        }

        matching
    }
}

fn index_by_name(users: Vec<UserRecord>) -> BTreeMap<String, UserRecord> {
    users
        .into_iter()
        .map(|user| (user.name.clone(), user))
        .collect()
}

/// Report entries added, removed, or modified since the stored snapshot.
/// Modifications carry both the old and new line.
fn check_changes(
    previous: &BTreeMap<String, UserRecord>,
    current: &BTreeMap<String, UserRecord>,
    sink: &mut dyn ReportSink,
) {
    let diff = diff_maps(previous, current);
    for name in &diff.removed {
        sink.emit_finding(SOURCE, &format!("User '{name}' was deleted."));
    }
    for (name, before, after) in &diff.changed {
        sink.emit_finding(
            SOURCE,
            &format!(
                "Passwd entry for user '{name}' was modified.\n\nOld entry: {before}\nNew entry: {after}"
            ),
        );
    }
    for name in &diff.added {
        if let Some(entry) = current.get(name) {
            sink.emit_finding(
                SOURCE,
                &format!("User '{name}' was added.\n\nEntry: {entry}"),
            );
        }
    }
}

/// Uids shared by at least two current entries. New collisions and
/// resolutions are both reported, with every entry involved.
fn check_uid_collisions(
    previous: &BTreeSet<u32>,
    current_passwd: &BTreeMap<String, UserRecord>,
    sink: &mut dyn ReportSink,
) -> BTreeSet<u32> {
    let mut seen = BTreeSet::new();
    let mut collisions = BTreeSet::new();
    for user in current_passwd.values() {
        if !seen.insert(user.uid) {
            collisions.insert(user.uid);
        }
    }

    let diff = diff_sets(previous, &collisions);
    if !diff.added.is_empty() {
        let mut message = String::from("UID collisions found.\n");
        for uid in &diff.added {
            let _ = write!(message, "\nUID: {uid}\n");
            push_entries_for_uid(&mut message, *uid, current_passwd);
        }
        sink.emit_finding(SOURCE, &message);
    }
    if !diff.removed.is_empty() {
        let mut message = String::from("UID collisions no longer exist.\n");
        for uid in &diff.removed {
            let _ = write!(message, "\nUID: {uid}\n");
            push_entries_for_uid(&mut message, *uid, current_passwd);
        }
        sink.emit_finding(SOURCE, &message);
    }

    collisions
}

fn push_entries_for_uid(message: &mut String, uid: u32, passwd: &BTreeMap<String, UserRecord>) {
    for user in passwd.values().filter(|user| user.uid == uid) {
        let _ = write!(message, "Entry: {user}\n");
    }
}
