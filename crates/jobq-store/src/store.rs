use crate::{RecordBackend, Result, RocksBackend, StoreError};
use chrono::{Duration, Utc};
use jobq_core::{DispatchError, JobId, JobRecord, JobResult, JobSpec, JobStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Configuration for the job store
#[derive(Debug, Clone, Default)]
pub struct JobStoreConfig {
    /// Directory for the RocksDB files; `None` keeps records in memory only
    pub data_dir: Option<PathBuf>,
}

/// Map from job id to its spec, lifecycle status and terminal result.
///
/// Every mutation runs under the store's own write lock and is written
/// through to the durable backend before it becomes visible to readers.
pub struct JobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    backend: Option<Box<dyn RecordBackend>>,
}

impl JobStore {
    /// Volatile store, nothing survives the process
    pub fn in_memory() -> Self {
        JobStore {
            records: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Open or create the store, recovering records left by a previous run
    pub fn open(config: JobStoreConfig) -> Result<Self> {
        let data_dir = match config.data_dir {
            Some(dir) => dir,
            None => return Ok(Self::in_memory()),
        };

        std::fs::create_dir_all(&data_dir)?;
        let backend = RocksBackend::open(&data_dir.join("jobs"))?;
        info!("Job store directory {:?}", data_dir);

        Self::with_backend(Box::new(backend))
    }

    /// Store on top of an already opened backend. Jobs that were on a slot
    /// when the previous process stopped go back to pending.
    pub fn with_backend(backend: Box<dyn RecordBackend>) -> Result<Self> {
        let mut records = HashMap::new();
        for record in backend.load_terminal()? {
            records.insert(record.id().clone(), record);
        }

        let mut released = 0;
        for mut record in backend.load_active()? {
            if record.status.release_after_restart() {
                warn!(
                    "Recovering job {} (was on a slot when the process stopped)",
                    record.id()
                );
                backend.put(&record)?;
                released += 1;
            }
            records.insert(record.id().clone(), record);
        }

        info!(
            "Opened job store ({} records, {} released)",
            records.len(),
            released
        );

        Ok(JobStore {
            records: RwLock::new(records),
            backend: Some(backend),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    /// Store a new record
    pub fn insert(&self, record: JobRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(record.id()) {
            return Err(DispatchError::DuplicateJob(record.id().clone()).into());
        }

        if let Some(backend) = &self.backend {
            backend.put(&record)?;
        }

        debug!("Stored job {} ({})", record.id(), record.status.state.name());
        records.insert(record.id().clone(), record);
        Ok(())
    }

    /// Apply `f` to a copy of the record and commit it only if `f` succeeds.
    pub fn update<T, F>(&self, job_id: &JobId, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobRecord) -> jobq_core::Result<T>,
    {
        let mut records = self.records.write();
        let current = records
            .get(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;

        let mut next = current.clone();
        let value = f(&mut next)?;

        if let Some(backend) = &self.backend {
            backend.put(&next)?;
        }

        records.insert(job_id.clone(), next);
        Ok(value)
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.records.read().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.records.read().contains_key(job_id)
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.records.read().get(job_id).map(|r| r.status.clone())
    }

    pub fn spec(&self, job_id: &JobId) -> Option<JobSpec> {
        self.records.read().get(job_id).map(|r| r.spec.clone())
    }

    pub fn result(&self, job_id: &JobId) -> Option<JobResult> {
        self.records.read().get(job_id).and_then(|r| r.result.clone())
    }

    /// Records waiting for a slot: pending ones and those backing off
    pub fn queued(&self) -> Vec<JobRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.status.state.is_queued())
            .cloned()
            .collect()
    }

    /// Count records by state name
    pub fn count_by_state(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for record in self.records.read().values() {
            *counts.entry(record.status.state.name()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete one finished record
    pub fn remove_terminal(&self, job_id: &JobId) -> Result<JobRecord> {
        let mut records = self.records.write();
        let record = records
            .get(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;

        if !record.status.is_terminal() {
            return Err(DispatchError::NotTerminal(job_id.clone()).into());
        }

        if let Some(backend) = &self.backend {
            backend.delete(job_id)?;
        }

        records
            .remove(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))
    }

    /// Delete finished records whose terminal transition is older than `age`
    pub fn purge_terminal_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - age;
        let mut records = self.records.write();

        let expired: Vec<JobId> = records
            .values()
            .filter(|r| matches!(r.status.finished_at, Some(at) if at < cutoff))
            .filter(|r| r.status.is_terminal())
            .map(|r| r.id().clone())
            .collect();

        for job_id in &expired {
            if let Some(backend) = &self.backend {
                backend.delete(job_id)?;
            }
            records.remove(job_id);
        }

        if !expired.is_empty() {
            info!("Purged {} finished jobs", expired.len());
        }

        Ok(expired.len())
    }

    /// Flush the durable backend to disk
    pub fn sync(&self) -> Result<()> {
        match &self.backend {
            Some(backend) => backend.flush(),
            None => Ok(()),
        }
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{JobState, Tier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Keeps records in a map and refuses the next `failures` writes
    #[derive(Default)]
    struct FlakyBackend {
        records: parking_lot::Mutex<HashMap<JobId, JobRecord>>,
        failures: Arc<AtomicU32>,
    }

    impl RecordBackend for FlakyBackend {
        fn put(&self, record: &JobRecord) -> Result<()> {
            let refuse = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(StoreError::Other("disk full".to_string()));
            }
            self.records.lock().insert(record.id().clone(), record.clone());
            Ok(())
        }

        fn delete(&self, job_id: &JobId) -> Result<()> {
            self.records.lock().remove(job_id);
            Ok(())
        }

        fn load_active(&self) -> Result<Vec<JobRecord>> {
            Ok(self
                .records
                .lock()
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect())
        }

        fn load_terminal(&self) -> Result<Vec<JobRecord>> {
            Ok(self
                .records
                .lock()
                .values()
                .filter(|r| r.status.is_terminal())
                .cloned()
                .collect())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn record(id: &str) -> JobRecord {
        let spec = JobSpec::builder("coder", b"data".to_vec())
            .id(id)
            .tier(Tier::Pro)
            .build()
            .unwrap();
        JobRecord::new(spec)
    }

    fn durable(dir: &TempDir) -> JobStore {
        JobStore::open(JobStoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
        })
        .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = JobStore::in_memory();
        store.insert(record("job-1")).unwrap();

        let status = store.status(&JobId::new("job-1")).unwrap();
        assert_eq!(status.state, JobState::Pending);
        assert!(store.result(&JobId::new("job-1")).is_none());
        assert!(store.status(&JobId::new("missing")).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = JobStore::in_memory();
        store.insert(record("job-1")).unwrap();

        match store.insert(record("job-1")) {
            Err(StoreError::JobError(DispatchError::DuplicateJob(id))) => {
                assert_eq!(id, JobId::new("job-1"))
            }
            other => panic!("Expected DuplicateJob, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_update_is_not_committed() {
        let store = JobStore::in_memory();
        let id = JobId::new("job-1");
        store.insert(record("job-1")).unwrap();

        // Pending cannot go straight to Running
        let result = store.update(&id, |r| r.status.start_attempt());
        assert!(result.is_err());
        assert_eq!(store.status(&id).unwrap().state, JobState::Pending);
        assert_eq!(store.status(&id).unwrap().attempts_used, 0);
    }

    #[test]
    fn test_write_failure_keeps_previous_record() {
        let backend = FlakyBackend::default();
        let failures = backend.failures.clone();
        let store = JobStore::with_backend(Box::new(backend)).unwrap();
        let id = JobId::new("job-1");
        store.insert(record("job-1")).unwrap();

        failures.store(1, Ordering::SeqCst);
        let err: DispatchError = store
            .update(&id, |r| r.status.assign("coder-0"))
            .unwrap_err()
            .into();
        assert!(matches!(err, DispatchError::Storage(_)));
        assert_eq!(store.status(&id).unwrap().state, JobState::Pending);

        // The same change goes through once the backend recovers
        store.update(&id, |r| r.status.assign("coder-0")).unwrap();
        assert_eq!(store.status(&id).unwrap().state.slot(), Some("coder-0"));
    }

    #[test]
    fn test_update_missing_job() {
        let store = JobStore::in_memory();
        let result = store.update(&JobId::new("nope"), |r| r.status.assign("coder-0"));

        let err: DispatchError = result.unwrap_err().into();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn test_recovery_releases_running_jobs() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = durable(&temp_dir);
            store.insert(record("running")).unwrap();
            store.insert(record("done")).unwrap();
            store.insert(record("waiting")).unwrap();

            let running = JobId::new("running");
            store.update(&running, |r| r.status.assign("coder-0")).unwrap();
            store.update(&running, |r| r.status.start_attempt()).unwrap();

            let done = JobId::new("done");
            store
                .update(&done, |r| {
                    r.status.assign("coder-0")?;
                    r.status.start_attempt()?;
                    r.status.succeed()?;
                    r.result = Some(JobResult::succeeded(&r.status, b"ok".to_vec()));
                    Ok(())
                })
                .unwrap();
            store.sync().unwrap();
        }

        let store = durable(&temp_dir);
        assert_eq!(store.len(), 3);

        let running = store.status(&JobId::new("running")).unwrap();
        assert_eq!(running.state, JobState::Pending);
        assert_eq!(running.attempts_used, 1);

        let done = store.result(&JobId::new("done")).unwrap();
        assert_eq!(done.output, Some(b"ok".to_vec()));

        let mut queued: Vec<String> = store
            .queued()
            .into_iter()
            .map(|r| r.spec.id.to_string())
            .collect();
        queued.sort();
        assert_eq!(queued, vec!["running", "waiting"]);
    }

    #[test]
    fn test_remove_terminal() {
        let store = JobStore::in_memory();
        let id = JobId::new("job-1");
        store.insert(record("job-1")).unwrap();

        let err: DispatchError = store.remove_terminal(&id).unwrap_err().into();
        assert!(matches!(err, DispatchError::NotTerminal(_)));

        store.update(&id, |r| Ok(r.status.cancel())).unwrap();
        store.remove_terminal(&id).unwrap();
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_purge_old_terminal_records() {
        let store = JobStore::in_memory();
        store.insert(record("old")).unwrap();
        store.insert(record("fresh")).unwrap();
        store.insert(record("active")).unwrap();

        let old = JobId::new("old");
        store
            .update(&old, |r| {
                r.status.cancel();
                r.status.finished_at = Some(Utc::now() - Duration::days(10));
                Ok(())
            })
            .unwrap();
        store
            .update(&JobId::new("fresh"), |r| Ok(r.status.cancel()))
            .unwrap();

        let purged = store.purge_terminal_older_than(Duration::days(7)).unwrap();
        assert_eq!(purged, 1);
        assert!(!store.contains(&old));
        assert_eq!(store.len(), 2);
    }
}
