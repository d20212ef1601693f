//! Deleted-executable scan.
//!
//! Reports processes still running after their binary was unlinked from
//! disk, a favorite of droppers that delete themselves after exec. Each
//! process is keyed by its `/proc/<pid>/exe -> target` link text, so the
//! same process is reported once and a restart (new pid) is new again.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use baseline::{diff_sets, PersistedSnapshot, SnapshotError, SnapshotStore};
use platform_linux::proc_exe::{scan_deleted_executables, DeletedExecutable};

use crate::report::ReportSink;
use crate::util::{from_fields, to_fields};

/// Source identifier attached to this unit's findings and errors.
pub const SOURCE: &str = "deleted_exe";

const SNAPSHOT_KEY: &str = "deleted_exe";

#[derive(Debug, Clone)]
pub struct DeletedExeConfig {
    pub proc_root: PathBuf,
}

impl Default for DeletedExeConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeletedExeSnapshot {
    #[serde(default)]
    suspicious_exes: BTreeSet<String>,
}

pub struct DeletedExecutableScan {
    config: DeletedExeConfig,
    store: SnapshotStore,
}

impl DeletedExecutableScan {
    pub fn new(config: DeletedExeConfig, store: SnapshotStore) -> Self {
        Self { config, store }
    }

    pub fn run(&self, sink: &mut dyn ReportSink) {
        let previous = match self.load_state() {
            Ok(previous) => previous,
            Err(message) => {
                sink.emit_error(SOURCE, &message);
                return;
            }
        };

        let found = match scan_deleted_executables(&self.config.proc_root) {
            Ok(found) => found,
            Err(err) => {
                sink.emit_error(SOURCE, &err.to_string());
                return;
            }
        };
        debug!(deleted = found.len(), "process executables scanned");

        let current: BTreeSet<String> = found
            .iter()
            .map(DeletedExecutable::link_text)
            .collect();

        let diff = diff_sets(&previous, &current);
        if !diff.added.is_empty() {
            let mut message = format!("{} deleted executable file(s) found:\n", diff.added.len());
            for record in found
                .iter()
                .filter(|record| diff.added.contains(&record.link_text()))
            {
                let _ = write!(message, "\n{}", record.link_text());
                let _ = write!(
                    message,
                    "\n/proc/{}/cmdline -> {}\n",
                    record.pid,
                    record.cmdline.as_deref().unwrap_or("")
                );
            }
            sink.emit_finding(SOURCE, &message);
        }

        if let Err(err) = self.store_state(&current) {
            sink.emit_error(SOURCE, &err.to_string());
        }
    }

    fn load_state(&self) -> Result<BTreeSet<String>, String> {
        let snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .map_err(|err| err.to_string())?;
        // The legacy layout already used the same single field.
        let fields = match snapshot {
            PersistedSnapshot::V0(fields) | PersistedSnapshot::V1(fields) => fields,
        };
        let raw: DeletedExeSnapshot = from_fields(fields)?;
        Ok(raw.suspicious_exes)
    }

    fn store_state(&self, current: &BTreeSet<String>) -> Result<(), SnapshotError> {
        let snapshot = DeletedExeSnapshot {
            suspicious_exes: current.clone(),
        };
        self.store.store(SNAPSHOT_KEY, to_fields(&snapshot)?)
    }
}
