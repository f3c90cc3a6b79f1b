use crate::{Result, StoreError};
use jobq_core::{JobId, JobRecord};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::info;

/// Durable home for job records behind a `JobStore`.
///
/// A failed `put` must leave the previously written record in place.
pub trait RecordBackend: Send + Sync {
    fn put(&self, record: &JobRecord) -> Result<()>;
    fn delete(&self, job_id: &JobId) -> Result<()>;
    /// Records that have not reached a terminal state
    fn load_active(&self) -> Result<Vec<JobRecord>>;
    fn load_terminal(&self) -> Result<Vec<JobRecord>>;
    fn flush(&self) -> Result<()>;
}

/// Column family names
const CF_ACTIVE: &str = "active";
const CF_TERMINAL: &str = "terminal";

/// Durable job records in RocksDB.
///
/// Non-terminal records live in `active`, finished ones in `terminal`, so a
/// restart only scans the jobs it has to resume.
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACTIVE, Options::default()),
            ColumnFamilyDescriptor::new(CF_TERMINAL, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        info!("Opened job database at {:?}", path);
        Ok(RocksBackend { db })
    }

    fn load_cf(&self, cf_name: &str) -> Result<Vec<JobRecord>> {
        let cf = self.cf(cf_name)?;

        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            records.push(JobRecord::from_bytes(&value)?);
        }

        Ok(records)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Other(format!("CF {} not found", name)))
    }
}

impl RecordBackend for RocksBackend {
    /// Write a record into the column family matching its state
    fn put(&self, record: &JobRecord) -> Result<()> {
        let key = record.id().as_str().as_bytes();
        let value = record.to_bytes()?;

        let active = self.cf(CF_ACTIVE)?;
        let terminal = self.cf(CF_TERMINAL)?;

        let mut batch = WriteBatch::default();
        if record.status.is_terminal() {
            batch.delete_cf(active, key);
            batch.put_cf(terminal, key, value);
        } else {
            batch.delete_cf(terminal, key);
            batch.put_cf(active, key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete(&self, job_id: &JobId) -> Result<()> {
        let key = job_id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ACTIVE)?, key);
        batch.delete_cf(self.cf(CF_TERMINAL)?, key);
        self.db.write(batch)?;
        Ok(())
    }

    fn load_active(&self) -> Result<Vec<JobRecord>> {
        self.load_cf(CF_ACTIVE)
    }

    fn load_terminal(&self) -> Result<Vec<JobRecord>> {
        self.load_cf(CF_TERMINAL)
    }

    /// Flush memtables to disk
    fn flush(&self) -> Result<()> {
        self.db.flush_cf(self.cf(CF_ACTIVE)?)?;
        self.db.flush_cf(self.cf(CF_TERMINAL)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{JobSpec, Tier};
    use tempfile::TempDir;

    #[test]
    fn test_records_move_between_column_families() {
        let temp_dir = TempDir::new().unwrap();
        let backend = RocksBackend::open(temp_dir.path()).unwrap();

        let spec = JobSpec::new("coder", b"data".to_vec(), Tier::Pro).unwrap();
        let mut record = JobRecord::new(spec);
        backend.put(&record).unwrap();

        assert_eq!(backend.load_active().unwrap().len(), 1);
        assert!(backend.load_terminal().unwrap().is_empty());

        record.status.cancel();
        backend.put(&record).unwrap();

        assert!(backend.load_active().unwrap().is_empty());
        let terminal = backend.load_terminal().unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0], record);

        backend.delete(record.id()).unwrap();
        assert!(backend.load_terminal().unwrap().is_empty());
    }
}
