//! Versioned snapshot persistence and diffing for stateful detectors.
//!
//! Each detector owns one snapshot: a JSON document at `<dir>/<key>.json`
//! holding a version tag plus named fields. Version 0 (legacy) documents
//! carry no tag; their whole body is a flat mapping the owning detector
//! migrates structurally on load. Unknown version tags are fatal: the
//! store never guesses snapshot semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Snapshot layout written by [`SnapshotStore::store`].
pub const SNAPSHOT_VERSION: u64 = 1;

const VERSION_KEY: &str = "version";

/// A snapshot as found on disk, version tag already interpreted and
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedSnapshot {
    /// Legacy untagged layout; the whole document is a flat mapping that
    /// the caller must migrate into the current shape.
    V0(Map<String, Value>),
    /// Current tagged layout, named fields only.
    V1(Map<String, Value>),
}

#[derive(Debug)]
pub enum SnapshotError {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Deserialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The document carries a version integer this store does not know.
    /// Never migrated; callers treat this as fatal for the detector run.
    UnknownVersion {
        path: PathBuf,
        version: i64,
    },
    /// The document is not an object, or its version tag is not an integer.
    Layout {
        path: PathBuf,
        detail: String,
    },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "snapshot I/O error on {}: {}", path.display(), source)
            }
            Self::Serialize { source } => write!(f, "snapshot serialization error: {}", source),
            Self::Deserialize { path, source } => {
                write!(
                    f,
                    "snapshot deserialization error on {}: {}",
                    path.display(),
                    source
                )
            }
            Self::UnknownVersion { path, version } => {
                write!(
                    f,
                    "unknown snapshot version {} in {}",
                    version,
                    path.display()
                )
            }
            Self::Layout { path, detail } => {
                write!(f, "bad snapshot layout in {}: {}", path.display(), detail)
            }
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize { source } | Self::Deserialize { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One snapshot file per detector key under a state directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load the snapshot for `key`. A missing file is the first-run case
    /// and yields an empty current-version snapshot, not an error.
    pub fn load(&self, key: &str) -> Result<PersistedSnapshot, SnapshotError> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedSnapshot::V1(Map::new()));
            }
            Err(err) => return Err(SnapshotError::Io { path, source: err }),
        };

        let document: Value = serde_json::from_str(&contents)
            .map_err(|err| SnapshotError::Deserialize {
                path: path.clone(),
                source: err,
            })?;
        let Value::Object(mut fields) = document else {
            return Err(SnapshotError::Layout {
                path,
                detail: "document is not an object".to_string(),
            });
        };

        match fields.remove(VERSION_KEY) {
            None => Ok(PersistedSnapshot::V0(fields)),
            Some(tag) => {
                let Some(version) = tag.as_i64() else {
                    return Err(SnapshotError::Layout {
                        path,
                        detail: format!("version tag {tag} is not an integer"),
                    });
                };
                if version == SNAPSHOT_VERSION as i64 {
                    Ok(PersistedSnapshot::V1(fields))
                } else {
                    Err(SnapshotError::UnknownVersion { path, version })
                }
            }
        }
    }

    /// Persist `fields` as the snapshot for `key`, fully replacing any
    /// previous content. Writes via a temp file and rename so readers never
    /// observe a half-written document.
    pub fn store(&self, key: &str, mut fields: Map<String, Value>) -> Result<(), SnapshotError> {
        fields.insert(VERSION_KEY.to_string(), Value::from(SNAPSHOT_VERSION));
        let contents = serde_json::to_string_pretty(&Value::Object(fields))
            .map_err(|err| SnapshotError::Serialize { source: err })?;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SnapshotError::Io {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents.as_bytes()).map_err(|err| SnapshotError::Io {
            path: tmp_path.clone(),
            source: err,
        })?;
        fs::rename(&tmp_path, &path).map_err(|err| SnapshotError::Io { path, source: err })?;
        Ok(())
    }
}

// ── Diff engine ──────────────────────────────────────────────────────

/// Elements that appeared in / disappeared from a derived set between two
/// runs. Ordering follows the element order, keeping report text stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set subtraction both ways: `added = current - previous`,
/// `removed = previous - current`.
pub fn diff_sets<T: Ord + Clone>(previous: &BTreeSet<T>, current: &BTreeSet<T>) -> SetDiff<T> {
    SetDiff {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

/// Key-level diff over mapping-shaped snapshots. `changed` carries
/// `(key, before, after)` for keys present in both with unequal values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDiff<K, V> {
    pub added: Vec<K>,
    pub removed: Vec<K>,
    pub changed: Vec<(K, V, V)>,
}

impl<K, V> MapDiff<K, V> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_maps<K: Ord + Clone, V: PartialEq + Clone>(
    previous: &BTreeMap<K, V>,
    current: &BTreeMap<K, V>,
) -> MapDiff<K, V> {
    let mut diff = MapDiff {
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
    };

    for (key, before) in previous {
        match current.get(key) {
            None => diff.removed.push(key.clone()),
            Some(after) if after != before => {
                diff.changed
                    .push((key.clone(), before.clone(), after.clone()));
            }
            Some(_) => {}
        }
    }
    for key in current.keys() {
        if !previous.contains_key(key) {
            diff.added.push(key.clone());
        }
    }

    diff
}
