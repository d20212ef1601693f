use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors raised while turning a raw host-state source into typed records.
#[derive(Debug)]
pub enum SourceError {
    /// A required input file is missing or unreadable.
    Unavailable { path: PathBuf, source: io::Error },
    /// A single record failed its grammar; the whole source is rejected,
    /// carrying the offending raw content for diagnosis.
    Malformed { path: PathBuf, content: String },
    /// The external dump facility produced diagnostics outside its contract.
    ExternalTool { path: PathBuf, detail: String },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { path, source } => {
                write!(f, "source {} unavailable: {}", path.display(), source)
            }
            Self::Malformed { path, content } => {
                write!(f, "malformed record in {}: {}", path.display(), content)
            }
            Self::ExternalTool { path, detail } => {
                write!(f, "external dump of {} failed: {}", path.display(), detail)
            }
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl SourceError {
    pub(crate) fn unavailable(path: &std::path::Path, source: io::Error) -> Self {
        Self::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(path: &std::path::Path, content: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            content: content.into(),
        }
    }
}
