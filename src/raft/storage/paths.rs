use std::path::{Path, PathBuf};

/// On-disk layout for one replication group under the node data dir:
/// `<data_dir>/<group>/raft/{wal,snapshots}`.
#[derive(Debug, Clone)]
pub struct GroupPaths {
    pub log_json: PathBuf,
    pub vote_json: PathBuf,
    pub committed_json: PathBuf,
    pub sm_meta_json: PathBuf,
    pub snapshot_meta_json: PathBuf,
    pub snapshot_archive: PathBuf,
    pub snapshot_build_dir: PathBuf,
    pub snapshot_install_dir: PathBuf,
}

impl GroupPaths {
    pub fn new(data_dir: &Path, group: &str) -> Self {
        let raft_dir = data_dir.join(group).join("raft");
        let wal_dir = raft_dir.join("wal");
        let snapshot_dir = raft_dir.join("snapshots");
        Self {
            log_json: wal_dir.join("log.json"),
            vote_json: wal_dir.join("vote.json"),
            committed_json: wal_dir.join("committed.json"),
            sm_meta_json: raft_dir.join("state_machine.json"),
            snapshot_meta_json: snapshot_dir.join("current_meta.json"),
            snapshot_archive: snapshot_dir.join("current_snapshot.bin"),
            snapshot_build_dir: snapshot_dir.join("build"),
            snapshot_install_dir: snapshot_dir.join("install"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.log_json.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.snapshot_meta_json.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_do_not_share_directories() {
        let registry = GroupPaths::new(Path::new("/data"), "registry");
        let sql = GroupPaths::new(Path::new("/data"), "sql");
        assert_ne!(registry.log_json, sql.log_json);
        assert!(registry.log_json.starts_with("/data/registry"));
        assert!(sql.snapshot_archive.starts_with("/data/sql"));
    }
}
