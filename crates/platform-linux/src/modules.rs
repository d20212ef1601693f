//! Loaded kernel module (`/proc/modules`) parsing.
//!
//! Line grammar: `name size refcount (deps|-) state 0xHEX [ (LETTERS) ]`
//! where `deps` is a comma-separated list (the kernel emits a trailing
//! comma) or the literal `[permanent]`, and `LETTERS` is an optional
//! parenthesized string of single-letter taint codes.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

static MODULE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+) (\d+) (\d+) ((?:\w|,|-|\[permanent\])*) (\w+) 0x[0-9a-fA-F]+(?: \(([A-Z]+)\))?")
        .expect("module line grammar")
});

/// Module lifecycle state as reported by the kernel. Anything the kernel
/// does not name maps to `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Invalid,
    Live,
    Loading,
    Unloading,
}

impl ModuleState {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "live" => Self::Live,
            "loading" => Self::Loading,
            "unloading" => Self::Unloading,
            _ => Self::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Live => "live",
            Self::Loading => "loading",
            Self::Unloading => "unloading",
        }
    }
}

/// Kernel taint flags, one bit each, as documented in the kernel's
/// `Documentation/admin-guide/tainted-kernels.rst`. `Invalid` (bit 0) is the
/// sentinel for letters outside the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TaintFlag {
    Invalid = 0,
    Proprietary = 1,
    ForcedLoad = 2,
    CpuOutOfSpec = 4,
    ForcedUnload = 8,
    MachineCheck = 16,
    BadPage = 32,
    UserRequested = 64,
    KernelDied = 128,
    AcpiOverridden = 256,
    WarningIssued = 512,
    StagingDriver = 1024,
    FirmwareWorkaround = 2048,
    OutOfTree = 4096,
    Unsigned = 8192,
    SoftLockup = 16384,
    LivePatched = 32768,
    Auxiliary = 65536,
    Randstruct = 131072,
}

/// Letter codes as printed in the parenthesized taint suffix, in kernel bit
/// order. Kept as data so the mapping stays testable in one place.
pub const TAINT_LETTERS: &[(char, TaintFlag)] = &[
    ('P', TaintFlag::Proprietary),
    ('F', TaintFlag::ForcedLoad),
    ('S', TaintFlag::CpuOutOfSpec),
    ('R', TaintFlag::ForcedUnload),
    ('M', TaintFlag::MachineCheck),
    ('B', TaintFlag::BadPage),
    ('U', TaintFlag::UserRequested),
    ('D', TaintFlag::KernelDied),
    ('A', TaintFlag::AcpiOverridden),
    ('W', TaintFlag::WarningIssued),
    ('C', TaintFlag::StagingDriver),
    ('I', TaintFlag::FirmwareWorkaround),
    ('O', TaintFlag::OutOfTree),
    ('E', TaintFlag::Unsigned),
    ('L', TaintFlag::SoftLockup),
    ('K', TaintFlag::LivePatched),
    ('X', TaintFlag::Auxiliary),
    ('T', TaintFlag::Randstruct),
];

impl TaintFlag {
    /// Map a letter from the taint suffix. Unknown letters become `Invalid`
    /// rather than failing the parse.
    pub fn from_letter(letter: char) -> Self {
        TAINT_LETTERS
            .iter()
            .find(|(code, _)| *code == letter)
            .map(|(_, flag)| *flag)
            .unwrap_or(Self::Invalid)
    }

    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Proprietary => "proprietary",
            Self::ForcedLoad => "forced_load",
            Self::CpuOutOfSpec => "cpu_out_of_spec",
            Self::ForcedUnload => "forced_unload",
            Self::MachineCheck => "machine_check",
            Self::BadPage => "bad_page",
            Self::UserRequested => "user_requested",
            Self::KernelDied => "kernel_died",
            Self::AcpiOverridden => "acpi_overridden",
            Self::WarningIssued => "warning_issued",
            Self::StagingDriver => "staging_driver",
            Self::FirmwareWorkaround => "firmware_workaround",
            Self::OutOfTree => "out_of_tree",
            Self::Unsigned => "unsigned",
            Self::SoftLockup => "soft_lockup",
            Self::LivePatched => "live_patched",
            Self::Auxiliary => "auxiliary",
            Self::Randstruct => "randstruct",
        }
    }
}

/// One loaded kernel module. Equality, ordering, and hashing are structural
/// over every field so snapshot diffs catch any change, not just renames.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub size: u64,
    pub ref_count: u64,
    pub state: ModuleState,
    pub dependencies: BTreeSet<String>,
    pub taint_flags: BTreeSet<TaintFlag>,
}

impl ModuleRecord {
    /// Parse one `/proc/modules` line. Returns `None` when the line does not
    /// match the grammar.
    pub fn from_proc_line(line: &str) -> Option<Self> {
        let caps = MODULE_LINE.captures(line.trim())?;

        let mut dependencies = BTreeSet::new();
        let deps = &caps[4];
        if deps != "-" {
            for dep in deps.split(',').filter(|dep| !dep.is_empty()) {
                dependencies.insert(dep.to_string());
            }
        }

        let mut taint_flags = BTreeSet::new();
        if let Some(letters) = caps.get(6) {
            for letter in letters.as_str().chars() {
                taint_flags.insert(TaintFlag::from_letter(letter));
            }
        }

        Some(Self {
            name: caps[1].to_string(),
            size: caps[2].parse().ok()?,
            ref_count: caps[3].parse().ok()?,
            state: ModuleState::parse(&caps[5]),
            dependencies,
            taint_flags,
        })
    }

    pub fn has_taint(&self, flag: TaintFlag) -> bool {
        self.taint_flags.contains(&flag)
    }
}

/// Read and parse the loaded module list. Blank lines are skipped; any
/// non-matching line rejects the whole source.
pub fn read_modules(path: &Path) -> Result<Vec<ModuleRecord>, SourceError> {
    let contents =
        fs::read_to_string(path).map_err(|err| SourceError::unavailable(path, err))?;
    parse_modules(&contents, path)
}

/// Parse module list text. `path` is only used for error context.
pub fn parse_modules(contents: &str, path: &Path) -> Result<Vec<ModuleRecord>, SourceError> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = ModuleRecord::from_proc_line(trimmed)
            .ok_or_else(|| SourceError::malformed(path, trimmed))?;
        out.push(record);
    }
    Ok(out)
}
