//! File-backed store for jobs and conversations.
//!
//! Each collection persists as a single JSON mapping file under the
//! base directory (`jobs.json`, `conversations.json`). Writes go
//! through an atomic replace — temp sibling, fsync, rename — keeping
//! the previous snapshot as a `.bak` sidecar; reads fall back to the
//! sidecar when the primary is unreadable or fails to parse.
//!
//! Mutation of a single job is serialized through a per-job async
//! mutex: [`FileStore::job_for_update`] hands out a [`JobTxn`] that
//! holds the job's lock until committed or dropped. The collection map
//! itself sits behind a short-lived `RwLock`, so snapshot reads are
//! never blocked by a long-running pipeline pass.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::model::{Conversation, Job, JobStatus};

const JOBS_FILE: &str = "jobs.json";
const CONVERSATIONS_FILE: &str = "conversations.json";

/// Thread-safe persistence for all jobs and conversations.
pub struct FileStore {
    jobs: Collection<Job>,
    conversations: Collection<Conversation>,
    /// Per-job write locks, created on first use.
    job_locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open (or initialize) the store under `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)
            .map_err(|e| StoreError::io(base_dir.display().to_string(), e))?;

        let jobs = Collection::load(base_dir.join(JOBS_FILE))?;
        let conversations = Collection::load(base_dir.join(CONVERSATIONS_FILE))?;

        info!(dir = %base_dir.display(), "Store opened");
        Ok(Self {
            jobs,
            conversations,
            job_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Upsert a job and persist the collection.
    pub async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut map = self.jobs.map.write().await;
        map.insert(job.id, job.clone());
        self.jobs.persist(&map)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .map
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::job_not_found(id))
    }

    /// Acquire the job's exclusive write lock and return a transaction.
    ///
    /// The returned [`JobTxn`] is the only handle allowed to mutate the
    /// job until [`JobTxn::commit`] persists the changes and releases
    /// the lock. Dropping the transaction uncommitted rolls back.
    pub async fn job_for_update(self: &Arc<Self>, id: Uuid) -> Result<JobTxn, StoreError> {
        let lock = {
            let mut locks = self.job_locks.lock().expect("job lock table poisoned");
            locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;

        // Re-read under the lock: the previous holder may have deleted
        // or rewritten the job while we waited.
        let job = match self.jobs.map.read().await.get(&id) {
            Some(job) => job.clone(),
            None => return Err(StoreError::job_not_found(id)),
        };

        Ok(JobTxn {
            job,
            store: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Snapshot of every job.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.map.read().await.values().cloned().collect()
    }

    /// Snapshot of one user's jobs.
    pub async fn jobs_by_user(&self, user_id: &str) -> Vec<Job> {
        self.jobs
            .map
            .read()
            .await
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Snapshot of jobs in a given status.
    pub async fn jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs
            .map
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect()
    }

    /// Remove a job and persist.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        let mut map = self.jobs.map.write().await;
        map.remove(&id);
        self.jobs.persist(&map)?;
        drop(map);
        self.job_locks
            .lock()
            .expect("job lock table poisoned")
            .remove(&id);
        Ok(())
    }

    pub(crate) async fn persist_job(&self, job: Job) -> Result<(), StoreError> {
        let mut map = self.jobs.map.write().await;
        map.insert(job.id, job);
        self.jobs.persist(&map)
    }

    // ── Conversations ───────────────────────────────────────────────

    pub async fn save_conversation(&self, conv: &Conversation) -> Result<(), StoreError> {
        let mut map = self.conversations.map.write().await;
        map.insert(conv.id, conv.clone());
        self.conversations.persist(&map)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation, StoreError> {
        self.conversations
            .map
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::conversation_not_found(id))
    }

    /// Fetch the conversation attached to a job.
    pub async fn conversation_by_job(&self, job_id: Uuid) -> Result<Conversation, StoreError> {
        self.conversations
            .map
            .read()
            .await
            .values()
            .find(|c| c.job_id == job_id)
            .cloned()
            .ok_or_else(|| StoreError::conversation_not_found(job_id))
    }

    pub async fn delete_conversation(&self, id: Uuid) -> Result<(), StoreError> {
        let mut map = self.conversations.map.write().await;
        map.remove(&id);
        self.conversations.persist(&map)
    }

    /// Delete every conversation attached to `job_id`.
    ///
    /// Used by retry-from-scratch (replace the thread) and job deletion.
    pub async fn delete_conversations_for_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut map = self.conversations.map.write().await;
        map.retain(|_, c| c.job_id != job_id);
        self.conversations.persist(&map)
    }
}

/// An exclusive, committable view of one job.
///
/// `commit` consumes the transaction, so a double commit cannot be
/// written; dropping without commit discards the working copy and
/// releases the lock.
pub struct JobTxn {
    /// Working copy; mutate freely, nothing is visible until commit.
    pub job: Job,
    store: Arc<FileStore>,
    _guard: OwnedMutexGuard<()>,
}

impl JobTxn {
    /// Persist the working copy and release the job's lock.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.store.persist_job(self.job).await
        // _guard drops here, releasing the per-job lock.
    }
}

// ── Collection ──────────────────────────────────────────────────────

/// One persisted mapping file plus its in-memory image.
struct Collection<T> {
    path: PathBuf,
    backup_path: PathBuf,
    map: RwLock<HashMap<Uuid, T>>,
}

impl<T> Collection<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn load(path: PathBuf) -> Result<Self, StoreError> {
        let backup_path = sibling_with_suffix(&path, ".bak");

        let map = if path.exists() {
            match read_map(&path) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Primary snapshot unreadable, trying backup"
                    );
                    read_map(&backup_path)?
                }
            }
        } else if backup_path.exists() {
            // Crash window between the two renames: the previous
            // snapshot survives as the backup.
            warn!(path = %path.display(), "Primary snapshot missing, recovering from backup");
            read_map(&backup_path)?
        } else {
            atomic_write(&path, &backup_path, b"{}")?;
            HashMap::new()
        };

        Ok(Self {
            path,
            backup_path,
            map: RwLock::new(map),
        })
    }

    /// Serialize the map and atomically replace the primary file,
    /// keeping the previous primary as the `.bak` sidecar.
    fn persist(&self, map: &HashMap<Uuid, T>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(map)?;
        atomic_write(&self.path, &self.backup_path, &data)
    }
}

fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<Uuid, T>, StoreError> {
    let data = fs::read(path).map_err(|e| StoreError::io(path.display().to_string(), e))?;
    if data.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_slice(&data)?)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `data` to a temp sibling, fsync, rotate the current primary to
/// `backup`, and rename the temp into place. A failure at any point
/// leaves either the old or the new snapshot fully readable.
fn atomic_write(path: &Path, backup: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = sibling_with_suffix(path, ".tmp");
    let io = |e| StoreError::io(tmp.display().to_string(), e);

    let mut file = File::create(&tmp).map_err(io)?;
    file.write_all(data).map_err(io)?;
    file.sync_all().map_err(io)?;
    drop(file);

    if path.exists() {
        fs::rename(path, backup).map_err(|e| StoreError::io(backup.display().to_string(), e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path.display().to_string(), e))
}
