//! Snapshot-diff detectors over Linux host-state records.
//!
//! Every detector follows the same protocol: load its persisted snapshot
//! (migrating legacy untagged layouts in place), compute the current
//! derived value from freshly parsed records, diff the two, report only
//! the delta, and persist the new value on every run, findings or not.
//! Errors never escape a detector: they surface as error events on the
//! [`report::ReportSink`] and leave the persisted snapshot untouched.

pub mod deleted_exe;
pub mod lastlog_crosscheck;
pub mod login_accounting;
pub mod passwd_monitor;
pub mod report;
pub mod tainted_modules;
mod util;

pub use deleted_exe::{DeletedExeConfig, DeletedExecutableScan};
pub use lastlog_crosscheck::{LastlogCrossCheck, LastlogCrossCheckConfig};
pub use login_accounting::{LoginAccountingConfig, LoginAccountingScan, LoginAnomaly};
pub use passwd_monitor::{PasswdMonitor, PasswdMonitorConfig};
pub use report::{LogSink, MemorySink, ReportSink};
pub use tainted_modules::{TaintedModuleScan, TaintedModulesConfig};

#[cfg(test)]
mod test_support;
