//! Per-owner claim records on disk.
//!
//! Records are loaded synchronously at startup. Saving happens on a
//! background [`IoWorker`] fed with record snapshots taken on the tick
//! thread, so the tick never waits on the filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bevy::prelude::Resource;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::claim::MAIN_SUB_CONFIG;
use crate::ids::PlayerId;
use crate::manager::ClaimsManager;

/// Everything stored for one owner: chunks grouped by dimension and claim value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerClaimsRecord {
    pub owner: PlayerId,
    #[serde(default)]
    pub last_active_ms: u64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<ClaimGroupRecord>>,
}

impl OwnerClaimsRecord {
    pub fn empty(owner: PlayerId) -> Self {
        Self {
            owner,
            last_active_ms: 0,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn claim_count(&self) -> usize {
        self.dimensions
            .values()
            .flatten()
            .map(|group| group.positions.len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimGroupRecord {
    #[serde(default = "main_sub_config")]
    pub sub_config_index: i32,
    #[serde(default)]
    pub forceloadable: bool,
    pub positions: Vec<[i32; 2]>,
}

fn main_sub_config() -> i32 {
    MAIN_SUB_CONFIG
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("claims storage I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed claims record for {owner}: {source}")]
    Parse {
        owner: PlayerId,
        #[source]
        source: serde_json::Error,
    },
    #[error("record for the {owner} owner is unreadable; refusing to start")]
    CorruptGlobal {
        owner: PlayerId,
        #[source]
        source: Box<PersistenceError>,
    },
    #[error("claims I/O worker has stopped")]
    WorkerStopped,
}

/// Storage for owner records.
pub trait ClaimsBackend: Send {
    fn owners(&self) -> Result<Vec<PlayerId>, PersistenceError>;
    fn load(&self, owner: PlayerId) -> Result<Option<OwnerClaimsRecord>, PersistenceError>;
    fn save(&self, owner: PlayerId, record: &OwnerClaimsRecord) -> Result<(), PersistenceError>;
}

/// One pretty-printed JSON file per owner: `<dir>/<uuid>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirectoryBackend {
    dir: PathBuf,
}

impl JsonDirectoryBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, owner: PlayerId) -> PathBuf {
        self.dir.join(format!("{}.json", owner.0))
    }
}

impl ClaimsBackend for JsonDirectoryBackend {
    fn owners(&self) -> Result<Vec<PlayerId>, PersistenceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut owners = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Uuid::parse_str(stem) {
                Ok(id) => owners.push(PlayerId(id)),
                Err(_) => warn!(
                    target: "claims::persistence",
                    path = %path.display(),
                    "claims_file.ignored=bad_name"
                ),
            }
        }
        owners.sort();
        Ok(owners)
    }

    fn load(&self, owner: PlayerId) -> Result<Option<OwnerClaimsRecord>, PersistenceError> {
        let path = self.path_for(owner);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| PersistenceError::Parse { owner, source })
    }

    fn save(&self, owner: PlayerId, record: &OwnerClaimsRecord) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let json = serde_json::to_string_pretty(record)
            .map_err(|source| PersistenceError::Parse { owner, source })?;
        let path = self.path_for(owner);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(|source| PersistenceError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| PersistenceError::Io { path, source })
    }
}

/// In-memory backend holding raw JSON, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<BTreeMap<PlayerId, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw text for an owner, valid or not.
    pub fn insert_raw(&self, owner: PlayerId, json: impl Into<String>) {
        self.records
            .lock()
            .expect("memory backend mutex poisoned")
            .insert(owner, json.into());
    }

    pub fn raw(&self, owner: PlayerId) -> Option<String> {
        self.records
            .lock()
            .expect("memory backend mutex poisoned")
            .get(&owner)
            .cloned()
    }
}

impl ClaimsBackend for MemoryBackend {
    fn owners(&self) -> Result<Vec<PlayerId>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .expect("memory backend mutex poisoned")
            .keys()
            .copied()
            .collect())
    }

    fn load(&self, owner: PlayerId) -> Result<Option<OwnerClaimsRecord>, PersistenceError> {
        let Some(json) = self.raw(owner) else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| PersistenceError::Parse { owner, source })
    }

    fn save(&self, owner: PlayerId, record: &OwnerClaimsRecord) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(record)
            .map_err(|source| PersistenceError::Parse { owner, source })?;
        self.insert_raw(owner, json);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub owners: usize,
    pub claims: usize,
    pub skipped: usize,
}

/// Loads every stored owner into the manager.
///
/// An unreadable record for the server or expired owner aborts the load;
/// a player's unreadable record is skipped and that player starts empty.
pub fn load_all(
    backend: &dyn ClaimsBackend,
    manager: &mut ClaimsManager,
) -> Result<LoadSummary, PersistenceError> {
    let mut summary = LoadSummary::default();
    // reserved owners first so their claims win any overlap
    let mut owners = backend.owners()?;
    owners.sort_by_key(|owner| !owner.is_reserved());
    for owner in owners {
        match backend.load(owner) {
            Ok(Some(record)) => {
                if record.owner != owner {
                    warn!(
                        target: "claims::persistence",
                        %owner,
                        recorded = %record.owner,
                        "claims_record.owner_mismatch"
                    );
                }
                let record = OwnerClaimsRecord { owner, ..record };
                summary.claims += manager.load_owner_record(&record);
                summary.owners += 1;
            }
            Ok(None) => {}
            Err(err) if owner.is_reserved() => {
                return Err(PersistenceError::CorruptGlobal {
                    owner,
                    source: Box::new(err),
                });
            }
            Err(err) => {
                warn!(
                    target: "claims::persistence",
                    %owner,
                    error = %err,
                    "claims_record.skipped"
                );
                summary.skipped += 1;
            }
        }
    }
    info!(
        target: "claims::persistence",
        owners = summary.owners,
        claims = summary.claims,
        skipped = summary.skipped,
        "claims.loaded"
    );
    Ok(summary)
}

enum IoJob {
    Save(Vec<OwnerClaimsRecord>),
    Shutdown,
}

/// Outcome of one save batch, reported back to the tick thread.
#[derive(Debug, Default)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: Vec<PlayerId>,
}

/// Background thread writing record snapshots through a backend.
pub struct IoWorker {
    jobs: Sender<IoJob>,
    reports: Receiver<SaveReport>,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    pub fn spawn(backend: Box<dyn ClaimsBackend>) -> Self {
        let (jobs, job_rx) = unbounded::<IoJob>();
        let (report_tx, reports) = unbounded::<SaveReport>();
        let handle = thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let records = match job {
                    IoJob::Save(records) => records,
                    IoJob::Shutdown => break,
                };
                let mut report = SaveReport::default();
                for record in &records {
                    match backend.save(record.owner, record) {
                        Ok(()) => report.saved += 1,
                        Err(err) => {
                            warn!(
                                target: "claims::persistence",
                                owner = %record.owner,
                                error = %err,
                                "claims_record.save_failed"
                            );
                            report.failed.push(record.owner);
                        }
                    }
                }
                if report_tx.send(report).is_err() {
                    break;
                }
            }
            debug!(target: "claims::persistence", "io_worker.stopped");
        });
        Self {
            jobs,
            reports,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, records: Vec<OwnerClaimsRecord>) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        self.jobs
            .send(IoJob::Save(records))
            .map_err(|_| PersistenceError::WorkerStopped)
    }

    /// Reports of batches finished since the last poll.
    pub fn poll(&self) -> Vec<SaveReport> {
        self.reports.try_iter().collect()
    }

    /// Waits for every submitted batch to be written, then stops the thread.
    pub fn shutdown(&mut self) -> Vec<SaveReport> {
        let _ = self.jobs.send(IoJob::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "claims::persistence", "io_worker.panicked");
            }
        }
        self.poll()
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// Periodic saving state held by the app.
#[derive(Resource)]
pub struct ClaimsPersistence {
    worker: IoWorker,
    save_interval_ticks: u64,
    saved_total: usize,
    failed_total: usize,
}

impl ClaimsPersistence {
    pub fn new(worker: IoWorker, save_interval_ticks: u64) -> Self {
        Self {
            worker,
            save_interval_ticks: save_interval_ticks.max(1),
            saved_total: 0,
            failed_total: 0,
        }
    }

    pub fn save_due(&self, tick: u64) -> bool {
        tick > 0 && tick % self.save_interval_ticks == 0
    }

    pub fn submit(&self, records: Vec<OwnerClaimsRecord>) -> Result<(), PersistenceError> {
        self.worker.submit(records)
    }

    /// Collects finished reports and returns owners whose save failed.
    pub fn collect(&mut self) -> Vec<PlayerId> {
        let mut failed = Vec::new();
        for report in self.worker.poll() {
            self.saved_total += report.saved;
            self.failed_total += report.failed.len();
            failed.extend(report.failed);
        }
        failed
    }

    /// Writes everything still pending and stops the worker.
    pub fn flush(&mut self, manager: &mut ClaimsManager) -> Result<(), PersistenceError> {
        self.worker.submit(manager.take_dirty_records())?;
        for report in self.worker.shutdown() {
            self.saved_total += report.saved;
            self.failed_total += report.failed.len();
        }
        Ok(())
    }

    pub fn saved_total(&self) -> usize {
        self.saved_total
    }

    pub fn failed_total(&self) -> usize {
        self.failed_total
    }
}
