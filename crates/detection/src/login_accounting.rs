//! Login-accounting (utmp/wtmp/btmp) tampering scan.
//!
//! Log cleaners that trash or rewrite accounting records leave shapes the
//! format itself never produces: impossible type codes, epoch timestamps,
//! entries older than the system, or history running backwards. Each file
//! is checked independently; a finding lists every anomaly currently in
//! the file whenever the file's anomaly map changed since the last run.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use baseline::{diff_maps, PersistedSnapshot, SnapshotError, SnapshotStore};
use platform_linux::utmp::{parse_dump_lines, LoginRecord, UtmpDecoder};

use crate::report::ReportSink;
use crate::util::{from_fields, to_fields};

/// Source identifier attached to this unit's findings and errors.
pub const SOURCE: &str = "login_accounting";

const SNAPSHOT_KEY: &str = "login_accounting";

/// Record type code for boot-time entries.
const BOOT_TIME_TYPE: i64 = 2;
/// Valid record types per utmp(5).
const VALID_TYPES: std::ops::RangeInclusive<i64> = 1..=9;

/// Tolerated backwards drift between consecutive records; timestamps
/// normally differ by microseconds.
const DRIFT_TOLERANCE_MS: i64 = 5_000;
/// Wider tolerance when the preceding record is a boot record; clocks
/// jump around reboots.
const BOOT_DRIFT_TOLERANCE_MS: i64 = 120_000;

/// Anomaly tags attached to one accounting record. The timestamp tags are
/// a first-match chain, so a record carries at most one of them plus at
/// most one `TypeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoginAnomaly {
    /// Record type outside the valid 1–9 range.
    TypeError,
    /// Timestamp is exactly the Unix epoch. Some systems write such
    /// entries during early boot before the clock is set, so this is a
    /// detection, not proof of tampering.
    TimeZero,
    /// Timestamp predates the configured oldest-allowed threshold.
    TimeTooOld,
    /// Timestamp runs backwards relative to the preceding record beyond
    /// tolerance.
    TimeInconsistency,
}

impl LoginAnomaly {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::TimeZero => "TimeZero",
            Self::TimeTooOld => "TimeTooOld",
            Self::TimeInconsistency => "TimeInconsistency",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginAccountingConfig {
    /// Accounting files to inspect; missing files are skipped, the rest
    /// are still processed.
    pub accounting_files: Vec<PathBuf>,
    /// Oldest credible record timestamp.
    pub oldest_allowed: DateTime<Utc>,
}

impl Default for LoginAccountingConfig {
    fn default() -> Self {
        Self {
            accounting_files: vec![
                PathBuf::from("/var/run/utmp"),
                PathBuf::from("/var/log/wtmp"),
                PathBuf::from("/var/log/wtmp.1"),
                PathBuf::from("/var/log/btmp"),
            ],
            oldest_allowed: Utc::now() - Duration::days(3650),
        }
    }
}

/// Anomalies for one file, keyed by the verbatim record line.
type FileDetections = BTreeMap<String, Vec<LoginAnomaly>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountingSnapshot {
    /// file path → record line → anomaly tags
    #[serde(default)]
    detections: BTreeMap<String, FileDetections>,
}

pub struct LoginAccountingScan<D: UtmpDecoder> {
    config: LoginAccountingConfig,
    store: SnapshotStore,
    decoder: D,
}

impl<D: UtmpDecoder> LoginAccountingScan<D> {
    pub fn new(config: LoginAccountingConfig, store: SnapshotStore, decoder: D) -> Self {
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

        let mut results: BTreeMap<String, FileDetections> = BTreeMap::new();
        for file in &self.config.accounting_files {
            if !file.is_file() {
                continue;
            }
            let records = match self
                .decoder
                .decode(file)
                .and_then(|lines| parse_dump_lines(&lines, file))
            {
                Ok(records) => records,
                Err(err) => {
                    sink.emit_error(SOURCE, &err.to_string());
                    continue;
                }
            };
            debug!(file = %file.display(), records = records.len(), "accounting file decoded");

            let detections = check_records(&records, file, self.config.oldest_allowed);
            let file_key = file.to_string_lossy().into_owned();
            report_if_changed(&previous, &file_key, &detections, sink);
            results.insert(file_key, detections);
        }

        if let Err(err) = self.store_state(results) {
            sink.emit_error(SOURCE, &err.to_string());
        }
    }

    fn load_state(&self) -> Result<BTreeMap<String, FileDetections>, String> {
        let snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .map_err(|err| err.to_string())?;
        // The legacy layout already used the same single field.
        let fields = match snapshot {
            PersistedSnapshot::V0(fields) | PersistedSnapshot::V1(fields) => fields,
        };
        let raw: AccountingSnapshot = from_fields(fields)?;
        Ok(raw.detections)
    }

    fn store_state(
        &self,
        detections: BTreeMap<String, FileDetections>,
    ) -> Result<(), SnapshotError> {
        let snapshot = AccountingSnapshot { detections };
        self.store.store(SNAPSHOT_KEY, to_fields(&snapshot)?)
    }
}

/// Emit one finding for the file when its anomaly map gained or changed an
/// entry since the stored run. Entries that merely disappeared do not
/// re-raise the file.
fn report_if_changed(
    previous: &BTreeMap<String, FileDetections>,
    file_key: &str,
    detections: &FileDetections,
    sink: &mut dyn ReportSink,
) {
    let has_new = match previous.get(file_key) {
        None => true,
        Some(stored) => {
            let diff = diff_maps(stored, detections);
            !diff.added.is_empty() || !diff.changed.is_empty()
        }
    };
    if !has_new || detections.is_empty() {
        return;
    }

    let mut message = format!(
        "{} suspicious entry (or entries) in {} found:\n",
        detections.len(),
        file_key
    );
    for (line, tags) in detections {
        let names: Vec<&str> = tags.iter().map(|tag| tag.as_str()).collect();
        let _ = write!(message, "\nLine: {line}\nDetections: {}\n", names.join(", "));
    }
    sink.emit_finding(SOURCE, &message);
}

/// Run the anomaly checks over one file's records in file order.
fn check_records(
    records: &[LoginRecord],
    file: &Path,
    oldest_allowed: DateTime<Utc>,
) -> FileDetections {
    let chronology_applies = !is_live_accounting_file(file);
    let mut detections = FileDetections::new();
    let mut previous: Option<&LoginRecord> = None;

    for record in records {
        let mut tags = Vec::new();
        if !VALID_TYPES.contains(&record.record_type) {
            tags.push(LoginAnomaly::TypeError);
        }
        if let Some(anomaly) =
            check_timestamp(previous, record, oldest_allowed, chronology_applies)
        {
            tags.push(anomaly);
        }
        if !tags.is_empty() {
            detections.insert(record.line.clone(), tags);
        }
        previous = Some(record);
    }

    detections
}

/// First matching timestamp anomaly wins: an epoch-zero stamp beats the
/// too-old check, which beats the chronology check.
fn check_timestamp(
    previous: Option<&LoginRecord>,
    current: &LoginRecord,
    oldest_allowed: DateTime<Utc>,
    chronology_applies: bool,
) -> Option<LoginAnomaly> {
    let time = current.time.with_timezone(&Utc);
    if time == DateTime::UNIX_EPOCH {
        return Some(LoginAnomaly::TimeZero);
    }
    if time < oldest_allowed {
        return Some(LoginAnomaly::TimeTooOld);
    }

    if chronology_applies {
        if let Some(previous) = previous {
            if current.time < previous.time {
                let drift_ms = (previous.time - current.time).num_milliseconds();
                let tolerance = if previous.record_type == BOOT_TIME_TYPE {
                    BOOT_DRIFT_TOLERANCE_MS
                } else {
                    DRIFT_TOLERANCE_MS
                };
                if drift_ms > tolerance {
                    return Some(LoginAnomaly::TimeInconsistency);
                }
            }
        }
    }

    None
}

/// The live accounting file is not chronologically ordered by design, so
/// the chronology check does not apply to it.
fn is_live_accounting_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with("utmp"))
}
