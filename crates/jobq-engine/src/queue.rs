use chrono::{DateTime, Utc};
use jobq_core::{DispatchError, JobId, JobSpec, Result, Role, Tier};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ordering key: lower tier first, then earlier submission, then smaller id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    tier: Tier,
    submitted_at: DateTime<Utc>,
    id: JobId,
}

impl QueueKey {
    fn of(job: &JobSpec) -> Self {
        QueueKey {
            tier: job.tier,
            submitted_at: job.submitted_at,
            id: job.id.clone(),
        }
    }
}

#[derive(Default)]
struct QueueInner {
    by_role: HashMap<Role, BTreeMap<QueueKey, JobSpec>>,
    index: HashMap<JobId, (Role, QueueKey)>,
}

impl QueueInner {
    fn head_for(&self, roles: &HashSet<Role>) -> Option<(&QueueKey, &JobSpec)> {
        roles
            .iter()
            .filter_map(|role| self.by_role.get(role))
            .filter_map(|jobs| jobs.iter().next())
            .min_by(|a, b| a.0.cmp(b.0))
    }

    fn remove(&mut self, job_id: &JobId) -> Option<JobSpec> {
        let (role, key) = self.index.remove(job_id)?;
        let jobs = self.by_role.get_mut(&role)?;
        let job = jobs.remove(&key);
        if jobs.is_empty() {
            self.by_role.remove(&role);
        }
        job
    }

    fn insert(&mut self, job: JobSpec) {
        let key = QueueKey::of(&job);
        self.index.insert(job.id.clone(), (job.role.clone(), key.clone()));
        self.by_role.entry(job.role.clone()).or_default().insert(key, job);
    }
}

/// Pending jobs ordered by `(tier, submitted_at, id)`, partitioned by role.
pub struct PriorityQueue {
    inner: RwLock<QueueInner>,
    capacity: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PriorityQueue {
            inner: RwLock::new(QueueInner::default()),
            capacity,
        }
    }

    /// Insert a new job. Fails when the queue is at capacity.
    pub fn enqueue(&self, job: JobSpec) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(&job.id) {
            return Err(DispatchError::DuplicateJob(job.id));
        }
        if inner.index.len() >= self.capacity {
            return Err(DispatchError::QueueFull {
                max: self.capacity,
            });
        }

        inner.insert(job);
        Ok(())
    }

    /// Put back a job the store already holds, after a backoff or on restart.
    /// Capacity is not checked, so an accepted job is never dropped.
    pub fn requeue(&self, job: JobSpec) {
        let mut inner = self.inner.write();
        if !inner.index.contains_key(&job.id) {
            inner.insert(job);
        }
    }

    /// Highest-priority pending job whose role is in `available_roles`
    pub fn peek_eligible(&self, available_roles: &HashSet<Role>) -> Option<JobSpec> {
        let inner = self.inner.read();
        inner.head_for(available_roles).map(|(_, job)| job.clone())
    }

    /// `peek_eligible` and removal as one step
    pub fn pop_eligible(&self, available_roles: &HashSet<Role>) -> Option<JobSpec> {
        let mut inner = self.inner.write();
        let job_id = inner.head_for(available_roles).map(|(key, _)| key.id.clone())?;
        inner.remove(&job_id)
    }

    /// Remove a specific job by ID
    pub fn remove(&self, job_id: &JobId) -> Option<JobSpec> {
        self.inner.write().remove(job_id)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.inner.read().index.contains_key(job_id)
    }

    /// 1-indexed position among pending jobs of the same role
    pub fn position(&self, job_id: &JobId) -> Option<usize> {
        let inner = self.inner.read();
        let (role, key) = inner.index.get(job_id)?;
        let jobs = inner.by_role.get(role)?;
        Some(jobs.range(..key).count() + 1)
    }

    /// Get job count
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len_for_role(&self, role: &str) -> usize {
        self.inner.read().by_role.get(role).map_or(0, |jobs| jobs.len())
    }

    /// Get count by tier, every tier present
    pub fn count_by_tier(&self) -> BTreeMap<Tier, usize> {
        let inner = self.inner.read();
        let mut counts: BTreeMap<Tier, usize> = Tier::ALL.iter().map(|t| (*t, 0)).collect();

        for (_, key) in inner.index.values() {
            *counts.entry(key.tier).or_insert(0) += 1;
        }

        counts
    }

    pub fn count_by_role(&self) -> BTreeMap<Role, usize> {
        let inner = self.inner.read();
        inner
            .by_role
            .iter()
            .map(|(role, jobs)| (role.clone(), jobs.len()))
            .collect()
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
