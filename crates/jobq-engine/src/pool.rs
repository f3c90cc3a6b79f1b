use chrono::{DateTime, Utc};
use jobq_core::{JobId, Role, WorkerClient};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Snapshot of one slot, for listings and invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub slot_id: String,
    pub role: Role,
    pub client: String,
    pub busy: bool,
    pub current_job_id: Option<JobId>,
    pub busy_since: Option<DateTime<Utc>>,
    pub jobs_handled: u64,
}

/// One pool member, bound to a role and a client for its whole life
struct WorkerSlot {
    slot_id: String,
    role: Role,
    client: Arc<dyn WorkerClient>,
    busy: bool,
    current_job_id: Option<JobId>,
    busy_since: Option<DateTime<Utc>>,
    jobs_handled: u64,
}

impl WorkerSlot {
    fn info(&self) -> SlotInfo {
        SlotInfo {
            slot_id: self.slot_id.clone(),
            role: self.role.clone(),
            client: self.client.name().to_string(),
            busy: self.busy,
            current_job_id: self.current_job_id.clone(),
            busy_since: self.busy_since,
            jobs_handled: self.jobs_handled,
        }
    }
}

/// Fixed set of worker slots, created once and never resized.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<RwLock<Vec<WorkerSlot>>>,
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    /// Claim an idle slot for `role`. Check and claim happen under one write lock,
    /// so two callers never receive the same slot.
    pub fn acquire_free_slot(&self, role: &str) -> Option<SlotGuard> {
        let mut slots = self.slots.write();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.busy && s.role == role)?;

        slot.busy = true;
        slot.busy_since = Some(Utc::now());

        Some(SlotGuard {
            slots: self.slots.clone(),
            index,
            slot_id: slot.slot_id.clone(),
            role: slot.role.clone(),
            client: slot.client.clone(),
        })
    }

    /// Mark the slot idle again. Dropping the guard has the same effect.
    pub fn release(&self, slot: SlotGuard) {
        drop(slot);
    }

    /// Every role with at least one slot
    pub fn roles(&self) -> HashSet<Role> {
        self.slots.read().iter().map(|s| s.role.clone()).collect()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.slots.read().iter().any(|s| s.role == role)
    }

    /// Roles with at least one idle slot
    pub fn idle_roles(&self) -> HashSet<Role> {
        self.slots
            .read()
            .iter()
            .filter(|s| !s.busy)
            .map(|s| s.role.clone())
            .collect()
    }

    pub fn slots_for_role(&self, role: &str) -> usize {
        self.slots.read().iter().filter(|s| s.role == role).count()
    }

    pub fn total_slots(&self) -> usize {
        self.slots.read().len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.busy).count()
    }

    /// Slot counts keyed by role
    pub fn slots_by_role(&self) -> BTreeMap<Role, usize> {
        let mut counts = BTreeMap::new();
        for slot in self.slots.read().iter() {
            *counts.entry(slot.role.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.slots.read().iter().map(WorkerSlot::info).collect()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("slots", &self.snapshot())
            .finish()
    }
}

/// Builder for WorkerPool
#[derive(Default)]
pub struct WorkerPoolBuilder {
    slots: Vec<(Role, Arc<dyn WorkerClient>)>,
}

impl WorkerPoolBuilder {
    /// Add one slot for `role`
    pub fn slot(mut self, role: impl Into<Role>, client: Arc<dyn WorkerClient>) -> Self {
        self.slots.push((role.into(), client));
        self
    }

    /// Add `count` slots for `role` sharing one client
    pub fn slots(mut self, role: impl Into<Role>, count: usize, client: Arc<dyn WorkerClient>) -> Self {
        let role = role.into();
        for _ in 0..count {
            self.slots.push((role.clone(), client.clone()));
        }
        self
    }

    pub fn build(self) -> WorkerPool {
        let mut per_role: BTreeMap<Role, usize> = BTreeMap::new();
        let slots = self
            .slots
            .into_iter()
            .map(|(role, client)| {
                let n = per_role.entry(role.clone()).or_insert(0);
                let slot_id = format!("{}-{}", role, n);
                *n += 1;
                WorkerSlot {
                    slot_id,
                    role,
                    client,
                    busy: false,
                    current_job_id: None,
                    busy_since: None,
                    jobs_handled: 0,
                }
            })
            .collect();

        WorkerPool {
            slots: Arc::new(RwLock::new(slots)),
        }
    }
}

/// Exclusive claim on one slot. The slot returns to idle when the guard drops,
/// whichever way the job's execution ends.
pub struct SlotGuard {
    slots: Arc<RwLock<Vec<WorkerSlot>>>,
    index: usize,
    slot_id: String,
    role: Role,
    client: Arc<dyn WorkerClient>,
}

impl SlotGuard {
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn client(&self) -> Arc<dyn WorkerClient> {
        self.client.clone()
    }

    /// Record which job the slot is working on
    pub fn bind(&self, job_id: &JobId) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(self.index) {
            slot.current_job_id = Some(job_id.clone());
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(self.index) {
            if slot.current_job_id.take().is_some() {
                slot.jobs_handled += 1;
            }
            slot.busy = false;
            slot.busy_since = None;
        }
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("slot_id", &self.slot_id)
            .field("role", &self.role)
            .finish()
    }
}
