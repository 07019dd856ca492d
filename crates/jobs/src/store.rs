//! Job storage.
//!
//! The store is a keyed record store with one strong primitive:
//! [`JobStore::update_atomic`], which runs a closure against a job while
//! holding that job's row lock and only writes the result back if the closure
//! succeeds. Checks and writes that must not race go inside that closure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use inferlink_core::{ContentHash, ExternalJobId, JobId, TenantId};

use crate::job::{Job, JobStatus};

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A live job with the same unique key already exists.
    Existing(Job),
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a job with the same `(tenant, unique_key)` exists
    /// that is still live or succeeded. Check and insert are atomic.
    fn insert_unique(&self, job: Job) -> Result<InsertOutcome, JobStoreError>;

    /// Get a job by ID. A job owned by another tenant is an isolation error.
    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// All jobs carrying this external id, across tenants (at most one per tenant).
    fn find_by_external_id(&self, external_job_id: &ExternalJobId) -> Result<Vec<Job>, JobStoreError>;

    /// Run `f` on the job under its row lock; persist only if `f` returns `Ok`.
    ///
    /// The id, tenant and a previously set external id are immutable; an
    /// attempt to change them fails the whole update.
    fn update_atomic<T, E, F>(&self, tenant_id: TenantId, job_id: JobId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Job) -> Result<T, E>,
        E: From<JobStoreError>;

    /// List a tenant's jobs, oldest first.
    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Pending jobs whose retry time has come, any tenant, oldest first.
    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Non-terminal jobs created before `cutoff`, any tenant, oldest first.
    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Per-status counts for one tenant.
    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("external job id already used by this tenant: {0}")]
    DuplicateExternalId(ExternalJobId),
    #[error("immutable field changed on job {0}")]
    ImmutableField(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timeout: usize,
}

type Row = Arc<Mutex<Job>>;

#[derive(Debug, Default)]
struct Indexes {
    by_external: HashMap<ExternalJobId, Vec<(TenantId, JobId)>>,
    by_unique_key: HashMap<(TenantId, ContentHash), Vec<JobId>>,
}

/// In-memory job store for tests/dev.
///
/// Row-level locking: each job sits behind its own mutex. Lock order is
/// rows map → row → indexes, and no path holds two rows at once.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    rows: RwLock<HashMap<JobId, Row>>,
    indexes: Mutex<Indexes>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn row(&self, job_id: JobId) -> Result<Option<Row>, JobStoreError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(&job_id).cloned())
    }

    /// Snapshot every job matching `filter` without holding the map lock
    /// while rows are read.
    fn scan<F>(&self, filter: F) -> Result<Vec<Job>, JobStoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let rows: Vec<Row> = {
            let rows = self.rows.read().map_err(poisoned)?;
            rows.values().cloned().collect()
        };

        let mut out = Vec::new();
        for row in rows {
            let job = row.lock().map_err(poisoned)?;
            if filter(&job) {
                out.push(job.clone());
            }
        }
        out.sort_by_key(|j| (j.created_at, j.id));
        Ok(out)
    }

    fn blocks_duplicate(job: &Job) -> bool {
        !matches!(job.status, JobStatus::Failed | JobStatus::Timeout)
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_unique(&self, job: Job) -> Result<InsertOutcome, JobStoreError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        if rows.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        let unique = (job.tenant_id, job.unique_key.clone());
        let candidates: Vec<JobId> = {
            let idx = self.indexes.lock().map_err(poisoned)?;
            idx.by_unique_key.get(&unique).cloned().unwrap_or_default()
        };
        for id in candidates {
            if let Some(row) = rows.get(&id) {
                let existing = row.lock().map_err(poisoned)?;
                if Self::blocks_duplicate(&existing) {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
            }
        }

        let mut idx = self.indexes.lock().map_err(poisoned)?;
        if let Some(ext) = &job.external_job_id {
            let owners = idx.by_external.entry(ext.clone()).or_default();
            if owners.iter().any(|(t, _)| *t == job.tenant_id) {
                return Err(JobStoreError::DuplicateExternalId(ext.clone()));
            }
            owners.push((job.tenant_id, job.id));
        }
        idx.by_unique_key.entry(unique).or_default().push(job.id);

        rows.insert(job.id, Arc::new(Mutex::new(job.clone())));
        Ok(InsertOutcome::Inserted(job))
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let Some(row) = self.row(job_id)? else {
            return Ok(None);
        };
        let job = row.lock().map_err(poisoned)?;
        if job.tenant_id != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        Ok(Some(job.clone()))
    }

    fn find_by_external_id(&self, external_job_id: &ExternalJobId) -> Result<Vec<Job>, JobStoreError> {
        let owners: Vec<(TenantId, JobId)> = {
            let idx = self.indexes.lock().map_err(poisoned)?;
            idx.by_external.get(external_job_id).cloned().unwrap_or_default()
        };

        let mut out = Vec::with_capacity(owners.len());
        for (_, job_id) in owners {
            if let Some(row) = self.row(job_id)? {
                out.push(row.lock().map_err(poisoned)?.clone());
            }
        }
        Ok(out)
    }

    fn update_atomic<T, E, F>(&self, tenant_id: TenantId, job_id: JobId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Job) -> Result<T, E>,
        E: From<JobStoreError>,
    {
        let row = self.row(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        let mut guard = row.lock().map_err(poisoned)?;
        if guard.tenant_id != tenant_id {
            return Err(JobStoreError::TenantIsolation.into());
        }

        let mut working = guard.clone();
        let out = f(&mut working)?;

        if working.id != guard.id || working.tenant_id != guard.tenant_id {
            return Err(JobStoreError::ImmutableField(job_id).into());
        }
        match (&guard.external_job_id, &working.external_job_id) {
            (Some(before), after) if after.as_ref() != Some(before) => {
                return Err(JobStoreError::ImmutableField(job_id).into());
            }
            (None, Some(new)) => {
                let mut idx = self.indexes.lock().map_err(poisoned)?;
                let owners = idx.by_external.entry(new.clone()).or_default();
                if owners.iter().any(|(t, _)| *t == tenant_id) {
                    return Err(JobStoreError::DuplicateExternalId(new.clone()).into());
                }
                owners.push((tenant_id, job_id));
            }
            _ => {}
        }

        *guard = working;
        Ok(out)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.scan(|j| j.tenant_id == tenant_id && status.is_none_or(|s| j.status == s))?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.scan(|j| j.is_due(now))?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.scan(|j| !j.status.is_terminal() && j.created_at < cutoff)?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.scan(|j| j.tenant_id == tenant_id)? {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Timeout => stats.timeout += 1,
            }
        }
        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn insert_unique(&self, job: Job) -> Result<InsertOutcome, JobStoreError> {
        (**self).insert_unique(job)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn find_by_external_id(&self, external_job_id: &ExternalJobId) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_external_id(external_job_id)
    }

    fn update_atomic<T, E, F>(&self, tenant_id: TenantId, job_id: JobId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Job) -> Result<T, E>,
        E: From<JobStoreError>,
    {
        (**self).update_atomic(tenant_id, job_id, f)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_due(now, limit)
    }

    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_stale(cutoff, limit)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}
