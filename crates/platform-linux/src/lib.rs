//! Typed record parsers for the Linux host-state sources inspected by the
//! detection crate: the user database, loaded kernel modules, last-login
//! records, the utmp family of login-accounting files, and `/proc`
//! executable links.
//!
//! All reads are plain synchronous file I/O; the only subprocess is the
//! `utmpdump` collaborator behind the [`utmp::UtmpDecoder`] seam.

mod error;
pub mod lastlog;
pub mod modules;
pub mod proc_exe;
pub mod users;
pub mod utmp;

pub use error::SourceError;
pub use lastlog::{read_lastlog, LastLoginRecord};
pub use modules::{read_modules, ModuleRecord, ModuleState, TaintFlag};
pub use proc_exe::{scan_deleted_executables, DeletedExecutable};
pub use users::{read_users, UserRecord};
pub use utmp::{parse_dump_lines, LoginRecord, UtmpDecoder, UtmpDumpCommand};
