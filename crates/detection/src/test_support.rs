//! Shared fixtures for the detector tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use platform_linux::utmp::UtmpDecoder;
use platform_linux::SourceError;

/// Canned decoder standing in for the external `utmpdump` tool.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticDecoder {
    lines: BTreeMap<PathBuf, Vec<String>>,
}

impl StaticDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, path: &Path, lines: &[&str]) {
        self.lines.insert(
            path.to_path_buf(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
    }
}

impl UtmpDecoder for StaticDecoder {
    fn decode(&self, path: &Path) -> Result<Vec<String>, SourceError> {
        self.lines
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::ExternalTool {
                path: path.to_path_buf(),
                detail: "no canned dump for this path".to_string(),
            })
    }
}

/// Build a dump line in the `utmpdump` shape; `timestamp` is the bracketed
/// ISO-8601 field.
pub(crate) fn dump_line(record_type: i64, pid: i64, user: &str, timestamp: &str) -> String {
    format!(
        "[{record_type}] [{pid:05}] [ts/0] [{user:<8}] [pts/0       ] [host.example.org] [203.0.113.7    ] [{timestamp}]"
    )
}
