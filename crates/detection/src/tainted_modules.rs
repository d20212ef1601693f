//! Tainted kernel module scan.
//!
//! A loaded module that is both out-of-tree and unsigned was built outside
//! the kernel tree and carries no signature, the usual fingerprint of a
//! manually planted module. Either flag on its own is routine (vendor
//! drivers are out-of-tree but signed, some distribution builds run with
//! signature enforcement off), so only the combination is reported.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use baseline::{diff_sets, PersistedSnapshot, SnapshotError, SnapshotStore};
use platform_linux::modules::{read_modules, ModuleRecord, TaintFlag};

use crate::report::ReportSink;
use crate::util::{from_fields, to_fields};

/// Source identifier attached to this unit's findings and errors.
pub const SOURCE: &str = "tainted_modules";

const SNAPSHOT_KEY: &str = "tainted_modules";

#[derive(Debug, Clone)]
pub struct TaintedModulesConfig {
    pub modules_path: PathBuf,
    /// Module names excluded from reporting.
    pub whitelist: BTreeSet<String>,
}

impl Default for TaintedModulesConfig {
    fn default() -> Self {
        Self {
            modules_path: PathBuf::from("/proc/modules"),
            whitelist: BTreeSet::new(),
        }
    }
}

/// Persisted layout: the full record of every module that matched on the
/// last run, so any structural change re-reports it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ModulesSnapshot {
    #[serde(default)]
    suspicious_modules: Vec<ModuleRecord>,
}

pub struct TaintedModuleScan {
    config: TaintedModulesConfig,
    store: SnapshotStore,
}

impl TaintedModuleScan {
    pub fn new(config: TaintedModulesConfig, store: SnapshotStore) -> Self {
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

        let modules = match read_modules(&self.config.modules_path) {
            Ok(modules) => modules,
            Err(err) => {
                sink.emit_error(SOURCE, &err.to_string());
                return;
            }
        };
        debug!(loaded = modules.len(), "module list parsed");

        let current: BTreeSet<ModuleRecord> = modules
            .into_iter()
            .filter(|module| self.is_suspicious(module))
            .collect();

        let diff = diff_sets(&previous, &current);
        if !diff.added.is_empty() {
            let mut message = format!("{} suspicious loaded module(s) found:\n", diff.added.len());
            for module in &diff.added {
                let _ = write!(message, "\n{}", describe(module));
            }
            sink.emit_finding(SOURCE, &message);
        }
        // Modules that stopped matching (unloaded or whitelisted since the
        // last run) drop out of the persisted set silently; unlike the
        // passwd rules, this scan emits no resolution finding.

        if let Err(err) = self.store_state(&current) {
            sink.emit_error(SOURCE, &err.to_string());
        }
    }

    fn is_suspicious(&self, module: &ModuleRecord) -> bool {
        !self.config.whitelist.contains(&module.name)
            && module.has_taint(TaintFlag::OutOfTree)
            && module.has_taint(TaintFlag::Unsigned)
    }

    fn load_state(&self) -> Result<BTreeSet<ModuleRecord>, String> {
        let snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .map_err(|err| err.to_string())?;
        // The legacy layout already used the same single field.
        let fields = match snapshot {
            PersistedSnapshot::V0(fields) | PersistedSnapshot::V1(fields) => fields,
        };
        let raw: ModulesSnapshot = from_fields(fields)?;
        Ok(raw.suspicious_modules.into_iter().collect())
    }

    fn store_state(&self, current: &BTreeSet<ModuleRecord>) -> Result<(), SnapshotError> {
        let snapshot = ModulesSnapshot {
            suspicious_modules: current.iter().cloned().collect(),
        };
        self.store.store(SNAPSHOT_KEY, to_fields(&snapshot)?)
    }
}

fn describe(module: &ModuleRecord) -> String {
    let dependencies: Vec<&str> = module.dependencies.iter().map(String::as_str).collect();
    let flags: Vec<&str> = module
        .taint_flags
        .iter()
        .map(|flag| flag.as_str())
        .collect();
    format!(
        "{} - state: {}; dependencies: {}; taint flags: {}",
        module.name,
        module.state.as_str(),
        dependencies.join(","),
        flags.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;

    struct Fixture {
        _dir: tempfile::TempDir,
        modules_path: PathBuf,
        store: SnapshotStore,
    }

    fn fixture(modules: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let modules_path = dir.path().join("modules");
        std::fs::write(&modules_path, modules).expect("write modules");
        let store = SnapshotStore::new(dir.path().join("state"));
        Fixture {
            modules_path,
            store,
            _dir: dir,
        }
    }

    fn scan(fixture: &Fixture, whitelist: &[&str]) -> TaintedModuleScan {
        TaintedModuleScan::new(
            TaintedModulesConfig {
                modules_path: fixture.modules_path.clone(),
                whitelist: whitelist.iter().map(|name| name.to_string()).collect(),
            },
            fixture.store.clone(),
        )
    }

    const ROOTKIT_LINE: &str = "diamorphine 16384 0 - Live 0xffffffffc0e96000 (OE)";

    #[test]
    fn out_of_tree_alone_is_never_reported() {
        let fixture = fixture("nvidia 56823808 2 nvidia_uvm,nvidia_modeset, Live 0x0 (PO)\n");
        let mut sink = MemorySink::new();
        scan(&fixture, &[]).run(&mut sink);
        assert!(sink.findings.is_empty());
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn out_of_tree_and_unsigned_is_reported_with_details() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        let mut sink = MemorySink::new();
        scan(&fixture, &[]).run(&mut sink);

        assert_eq!(sink.findings.len(), 1);
        let message = &sink.findings[0].1;
        assert!(message.starts_with("1 suspicious loaded module(s) found:"));
        assert!(message.contains("diamorphine - state: live"));
        assert!(message.contains("taint flags: out_of_tree,unsigned"));
    }

    #[test]
    fn whitelisting_a_reported_module_silences_it() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        scan(&fixture, &[]).run(&mut MemorySink::new());

        let mut sink = MemorySink::new();
        scan(&fixture, &["diamorphine"]).run(&mut sink);
        assert!(sink.findings.is_empty());
    }

    #[test]
    fn unchanged_module_is_reported_only_once() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        let scan = scan(&fixture, &[]);
        let mut first = MemorySink::new();
        scan.run(&mut first);
        assert_eq!(first.findings.len(), 1);

        let mut second = MemorySink::new();
        scan.run(&mut second);
        assert!(second.findings.is_empty());
    }

    #[test]
    fn structural_change_re_reports_the_module() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        let scan = scan(&fixture, &[]);
        scan.run(&mut MemorySink::new());

        // Same module, new reference count.
        std::fs::write(
            &fixture.modules_path,
            "diamorphine 16384 1 - Live 0xffffffffc0e96000 (OE)\n",
        )
        .expect("rewrite modules");
        let mut sink = MemorySink::new();
        scan.run(&mut sink);
        assert_eq!(sink.findings.len(), 1);
    }

    #[test]
    fn disappearance_is_dropped_silently() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        let scan = scan(&fixture, &[]);
        scan.run(&mut MemorySink::new());

        std::fs::write(&fixture.modules_path, "").expect("rewrite modules");
        let mut sink = MemorySink::new();
        scan.run(&mut sink);
        assert!(sink.findings.is_empty(), "no resolution finding by design");

        // The module coming back is new again relative to the emptied set.
        std::fs::write(&fixture.modules_path, format!("{ROOTKIT_LINE}\n")).expect("rewrite");
        let mut third = MemorySink::new();
        scan.run(&mut third);
        assert_eq!(third.findings.len(), 1);
    }

    #[test]
    fn malformed_module_list_aborts_without_touching_state() {
        let fixture = fixture(&format!("{ROOTKIT_LINE}\n"));
        let scan = scan(&fixture, &[]);
        scan.run(&mut MemorySink::new());
        let before = std::fs::read_to_string(fixture.store.path_for(SNAPSHOT_KEY)).expect("read");

        std::fs::write(&fixture.modules_path, "garbage\n").expect("rewrite modules");
        let mut sink = MemorySink::new();
        scan.run(&mut sink);
        assert_eq!(sink.errors.len(), 1);
        assert!(sink.findings.is_empty());
        assert_eq!(
            std::fs::read_to_string(fixture.store.path_for(SNAPSHOT_KEY)).expect("read"),
            before
        );
    }
}
