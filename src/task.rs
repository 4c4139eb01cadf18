//! Copy task value type

use std::fmt;
use std::path::PathBuf;

/// One unit of work for the copy worker.
///
/// An empty `filename` means "copy the whole source directory into the
/// destination". Equal tasks are collapsed by the queue, so equality covers
/// all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CopyTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub filename: String,
}

impl CopyTask {
    pub fn new(source: PathBuf, destination: PathBuf, filename: impl Into<String>) -> Self {
        Self {
            source,
            destination,
            filename: filename.into(),
        }
    }

    /// Task that mirrors the entire source directory
    pub fn everything(source: PathBuf, destination: PathBuf) -> Self {
        Self::new(source, destination, String::new())
    }

    pub fn is_everything(&self) -> bool {
        self.filename.is_empty()
    }
}

impl fmt::Display for CopyTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.is_everything() { "*" } else { &self.filename };
        write!(
            f,
            "{} -> {} [{}]",
            self.source.display(),
            self.destination.display(),
            name
        )
    }
}
