//! Deleted-executable collection over `/proc`.
//!
//! The kernel appends ` (deleted)` to a `/proc/<pid>/exe` link target once
//! the backing file is unlinked; a program still running without its binary
//! on disk is a common malware trait.

use std::fs;
use std::path::Path;

use crate::error::SourceError;

/// Suffix the kernel appends to unlinked link targets.
const DELETED_SUFFIX: &str = " (deleted)";

/// Target the kernel reports for processes it spawned without an
/// executable; not a finding.
const KERNEL_PSEUDO_TARGET: &str = "/ (deleted)";

/// A running process whose executable has been unlinked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeletedExecutable {
    pub pid: u32,
    /// Link target text, including the ` (deleted)` suffix.
    pub target: String,
    /// Command line with NUL separators replaced by spaces, when readable.
    pub cmdline: Option<String>,
}

impl DeletedExecutable {
    /// `/proc/<pid>/exe -> <target>`, the shape used in findings and
    /// persisted state.
    pub fn link_text(&self) -> String {
        format!("/proc/{}/exe -> {}", self.pid, self.target)
    }
}

/// Scan every numeric `/proc` entry for exe links with a deleted target.
/// Processes that exit mid-scan are skipped. `memfd:` targets and the bare
/// `/ (deleted)` pseudo-target are kernel artifacts, not findings.
pub fn scan_deleted_executables(proc_root: &Path) -> Result<Vec<DeletedExecutable>, SourceError> {
    let entries =
        fs::read_dir(proc_root).map_err(|err| SourceError::unavailable(proc_root, err))?;

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(target) = fs::read_link(entry.path().join("exe")) else {
            continue;
        };
        let target = target.to_string_lossy().into_owned();
        if !target.ends_with(DELETED_SUFFIX) {
            continue;
        }
        if target.contains("memfd:") || target == KERNEL_PSEUDO_TARGET {
            continue;
        }
        out.push(DeletedExecutable {
            pid,
            target,
            cmdline: read_cmdline(proc_root, pid),
        });
    }
    out.sort();
    Ok(out)
}

fn read_cmdline(proc_root: &Path, pid: u32) -> Option<String> {
    let raw = fs::read(proc_root.join(pid.to_string()).join("cmdline")).ok()?;
    let replaced: Vec<u8> = raw
        .iter()
        .map(|byte| if *byte == 0 { b' ' } else { *byte })
        .collect();
    let text = String::from_utf8_lossy(&replaced).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_proc(entries: &[(u32, &str, &[u8])]) -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("create fake /proc");
        for (pid, exe_target, cmdline) in entries {
            let dir = root.path().join(pid.to_string());
            fs::create_dir_all(&dir).expect("create pid dir");
            symlink(exe_target, dir.join("exe")).expect("create exe link");
            fs::write(dir.join("cmdline"), cmdline).expect("write cmdline");
        }
        root
    }

    #[test]
    fn reports_deleted_targets_only() {
        let proc_root = fake_proc(&[
            (100, "/usr/bin/sshd", b"sshd: alice@pts/0\x00"),
            (200, "/tmp/.hidden/payload (deleted)", b"payload\x00--connect\x00"),
        ]);
        let found = scan_deleted_executables(proc_root.path()).expect("scans");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 200);
        assert_eq!(
            found[0].link_text(),
            "/proc/200/exe -> /tmp/.hidden/payload (deleted)"
        );
        assert_eq!(found[0].cmdline.as_deref(), Some("payload --connect"));
    }

    #[test]
    fn memfd_and_kernel_pseudo_targets_are_excluded() {
        let proc_root = fake_proc(&[
            (300, "/memfd:spam (deleted)", b"spam\x00"),
            (400, "/ (deleted)", b""),
        ]);
        let found = scan_deleted_executables(proc_root.path()).expect("scans");
        assert!(found.is_empty());
    }

    #[test]
    fn non_numeric_entries_are_skipped() {
        let root = tempfile::tempdir().expect("create fake /proc");
        fs::create_dir_all(root.path().join("self")).expect("create self dir");
        let found = scan_deleted_executables(root.path()).expect("scans");
        assert!(found.is_empty());
    }

    #[test]
    fn missing_proc_root_is_unavailable() {
        let err = scan_deleted_executables(Path::new("/this/proc/does/not/exist")).unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }
}
