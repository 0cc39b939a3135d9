use std::{collections::BTreeMap, path::Path, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    applier::{Applier, SnapshotReader, SnapshotWriter},
    command::{CommandOutput, CommandResponse},
    raft::types::{NodeId, NodeMeta, TypeConfig},
};

use openraft::entry::RaftPayload as _;
use openraft::{
    storage::RaftStateMachine, EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot,
    SnapshotMeta, StoredMembership,
};

use super::{io_err, read_bytes, read_json, write_bytes, write_json, GroupPaths};

/// Packed form of one applier snapshot: the registered manifest plus the
/// contents of each registered file.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotArchive {
    manifest: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedMachineMeta {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

#[derive(Debug)]
struct MachineInner {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

/// Generic state machine for one replication group, driving an [`Applier`].
///
/// The consensus engine calls `apply` strictly in log order from a single
/// task. Per-entry application failures become error responses for that
/// entry's caller only; they never surface as storage faults.
pub struct StateMachineShell<A: Applier> {
    applier: Arc<A>,
    paths: GroupPaths,
    inner: Arc<Mutex<MachineInner>>,
}

impl<A: Applier> Clone for StateMachineShell<A> {
    fn clone(&self) -> Self {
        Self {
            applier: self.applier.clone(),
            paths: self.paths.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<A: Applier> StateMachineShell<A> {
    pub async fn open(
        data_dir: &Path,
        group: &str,
        applier: Arc<A>,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let paths = GroupPaths::new(data_dir, group);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let meta = read_json::<PersistedMachineMeta>(&paths.sm_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;

        let (last_applied, last_membership) = meta
            .map(|m| (m.last_applied, m.last_membership))
            .unwrap_or((None, StoredMembership::default()));

        Ok(Self {
            applier,
            paths,
            inner: Arc::new(Mutex::new(MachineInner {
                last_applied,
                last_membership,
            })),
        })
    }

    async fn persist_meta(&self) -> Result<(), openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        let meta = PersistedMachineMeta {
            last_applied: inner.last_applied,
            last_membership: inner.last_membership.clone(),
        };
        write_json(&self.paths.sm_meta_json, &meta)
            .await
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))
    }
}

pub struct ShellSnapshotBuilder<A: Applier> {
    applier: Arc<A>,
    paths: GroupPaths,
    inner: Arc<Mutex<MachineInner>>,
}

impl<A: Applier> openraft::RaftSnapshotBuilder<TypeConfig> for ShellSnapshotBuilder<A> {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        let (last_applied, last_membership) = {
            let inner = self.inner.lock().await;
            (inner.last_applied, inner.last_membership.clone())
        };

        // Export runs on a blocking thread; a failed attempt is discarded and
        // the log simply stays uncompacted.
        let applier = self.applier.clone();
        let build_dir = self.paths.snapshot_build_dir.clone();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, std::io::Error> {
            if build_dir.exists() {
                std::fs::remove_dir_all(&build_dir)?;
            }
            std::fs::create_dir_all(&build_dir)?;

            let mut writer = SnapshotWriter::new(&build_dir);
            applier
                .save_snapshot(&mut writer)
                .map_err(|e| std::io::Error::other(e.to_string()))?;

            let mut files = BTreeMap::new();
            for name in writer.manifest() {
                files.insert(name.clone(), std::fs::read(writer.file_path(name))?);
            }
            let archive = SnapshotArchive {
                manifest: writer.manifest().to_vec(),
                files,
            };
            let bytes = rmp_serde::to_vec(&archive).map_err(std::io::Error::other)?;
            let _ = std::fs::remove_dir_all(&build_dir);
            Ok(bytes)
        })
        .await
        .map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                std::io::Error::other(e),
            )
        })?
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: format!(
                "snapshot-{}",
                last_applied.as_ref().map(|l| l.index).unwrap_or(0)
            ),
        };

        write_json(&self.paths.snapshot_meta_json, &meta)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        write_bytes(&self.paths.snapshot_archive, &bytes)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        Ok(Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        })
    }
}

impl<A: Applier> RaftStateMachine<TypeConfig> for StateMachineShell<A> {
    type SnapshotBuilder = ShellSnapshotBuilder<A>;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let inner = self.inner.lock().await;
        Ok((inner.last_applied, inner.last_membership.clone()))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<CommandResponse>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            if let Some(membership) = entry.get_membership() {
                let mut inner = self.inner.lock().await;
                inner.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let resp = match entry.payload {
                EntryPayload::Normal(cmd) => match self.applier.execute(&cmd) {
                    Ok(result) => CommandResponse::Ok { result },
                    // Owned by this entry's caller; iteration continues.
                    Err(err) => CommandResponse::Err {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                },
                EntryPayload::Membership(_) | EntryPayload::Blank => CommandResponse::Ok {
                    result: CommandOutput::Applied,
                },
            };

            {
                let mut inner = self.inner.lock().await;
                inner.last_applied = Some(log_id);
            }

            responses.push(resp);
        }

        self.persist_meta().await?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        ShellSnapshotBuilder {
            applier: self.applier.clone(),
            paths: self.paths.clone(),
            inner: self.inner.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        mut snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

        let _ = snapshot.seek(std::io::SeekFrom::Start(0)).await;
        let mut buf = Vec::new();
        snapshot
            .read_to_end(&mut buf)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        // Unpack and hand the manifest to the applier; any failure fails the
        // install so the node resynchronizes by log replay instead of joining
        // with partial state.
        let applier = self.applier.clone();
        let install_dir = self.paths.snapshot_install_dir.clone();
        let archive_bytes = buf.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let archive: SnapshotArchive =
                rmp_serde::from_slice(&archive_bytes).map_err(std::io::Error::other)?;

            if install_dir.exists() {
                std::fs::remove_dir_all(&install_dir)?;
            }
            std::fs::create_dir_all(&install_dir)?;
            for (name, contents) in &archive.files {
                std::fs::write(install_dir.join(name), contents)?;
            }

            let reader = SnapshotReader::new(&install_dir, archive.manifest);
            let result = applier
                .load_snapshot(&reader)
                .map_err(|e| std::io::Error::other(e.to_string()));
            let _ = std::fs::remove_dir_all(&install_dir);
            result
        })
        .await
        .map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Read,
                std::io::Error::other(e),
            )
        })?
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        {
            let mut inner = self.inner.lock().await;
            inner.last_applied = meta.last_log_id;
            inner.last_membership = meta.last_membership.clone();
        }

        self.persist_meta().await?;
        write_json(&self.paths.snapshot_meta_json, meta)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        write_bytes(&self.paths.snapshot_archive, &buf)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        let meta = read_json::<SnapshotMeta<NodeId, NodeMeta>>(&self.paths.snapshot_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        let bytes = read_bytes(&self.paths.snapshot_archive)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        }))
    }
}
