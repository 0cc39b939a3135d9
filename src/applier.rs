//! The contract between the consensus layer and the state it replicates.
//!
//! A replication group owns one [`Applier`]. The consensus engine drives it
//! from a single task, strictly in log order; the applier never needs its own
//! locking against the engine, only against concurrent readers.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::command::{Command, CommandOutput};

/// Why one command failed to apply. Scoped to that command's caller; the
/// engine keeps applying subsequent entries.
#[derive(Debug)]
pub enum ApplyError {
    /// The command family does not belong to this group.
    UnsupportedCommand { got: &'static str },
    /// The state rejected the command (unknown instance, SQL error, ...).
    Rejected { code: &'static str, message: String },
}

impl ApplyError {
    /// Stable machine-readable code carried back to the proposer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedCommand { .. } => "unsupported_command",
            Self::Rejected { code, .. } => code,
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedCommand { got } => {
                write!(f, "unsupported command family: {got}")
            }
            Self::Rejected { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for ApplyError {}

#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    /// The manifest does not list a file the applier requires.
    MissingFile { name: String },
    Corrupt { reason: String },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "snapshot io: {e}"),
            Self::MissingFile { name } => write!(f, "snapshot is missing file {name}"),
            Self::Corrupt { reason } => write!(f, "snapshot corrupt: {reason}"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Scratch directory handed to [`Applier::save_snapshot`]. The applier writes
/// whatever files it wants under the directory and registers each one; only
/// registered files enter the archive.
pub struct SnapshotWriter {
    dir: PathBuf,
    files: Vec<String>,
}

impl SnapshotWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
        }
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Register `name` as part of the snapshot. Unregistered files are
    /// discarded when the scratch directory is cleaned up.
    pub fn add_file(&mut self, name: &str) {
        if !self.files.iter().any(|f| f == name) {
            self.files.push(name.to_string());
        }
    }

    pub fn manifest(&self) -> &[String] {
        &self.files
    }
}

/// Unpacked snapshot handed to [`Applier::load_snapshot`]: the archive's files
/// materialized under a directory plus the manifest that was registered when
/// the snapshot was written.
pub struct SnapshotReader {
    dir: PathBuf,
    manifest: Vec<String>,
}

impl SnapshotReader {
    pub fn new(dir: &Path, manifest: Vec<String>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            manifest,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.manifest.iter().any(|f| f == name)
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn manifest(&self) -> &[String] {
        &self.manifest
    }
}

/// State replicated by one group.
///
/// `execute` is called once per committed entry, in log order, from a single
/// task. It must be deterministic: same command sequence, same state, on every
/// replica. `load_snapshot` replaces the current state wholesale.
pub trait Applier: Send + Sync + 'static {
    fn execute(&self, cmd: &Command) -> Result<CommandOutput, ApplyError>;

    fn save_snapshot(&self, writer: &mut SnapshotWriter) -> Result<(), SnapshotError>;

    fn load_snapshot(&self, reader: &SnapshotReader) -> Result<(), SnapshotError>;
}

/// Lock-free leadership hint fed by engine callbacks. Term 0 means "not
/// leader"; real terms start at 1.
#[derive(Debug, Default)]
pub struct LeaderState {
    term: AtomicU64,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_leader_start(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    pub fn on_leader_stop(&self) {
        self.term.store(0, Ordering::SeqCst);
    }

    /// The term this node is leading, or 0 if it is not leading.
    pub fn leader_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.leader_term() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_state_tracks_start_and_stop() {
        let state = LeaderState::new();
        assert!(!state.is_leader());

        state.on_leader_start(3);
        assert!(state.is_leader());
        assert_eq!(state.leader_term(), 3);

        state.on_leader_stop();
        assert!(!state.is_leader());
        assert_eq!(state.leader_term(), 0);
    }

    #[test]
    fn writer_registers_each_file_once() {
        let mut writer = SnapshotWriter::new(Path::new("/tmp/snap"));
        writer.add_file("state.json");
        writer.add_file("state.json");
        writer.add_file("extra.bin");

        assert_eq!(writer.manifest(), ["state.json", "extra.bin"]);
        assert_eq!(writer.file_path("state.json"), Path::new("/tmp/snap/state.json"));
    }

    #[test]
    fn reader_answers_manifest_membership() {
        let reader = SnapshotReader::new(Path::new("/tmp/snap"), vec!["state.json".to_string()]);
        assert!(reader.contains("state.json"));
        assert!(!reader.contains("other.json"));
    }
}
