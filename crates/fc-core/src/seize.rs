use std::collections::HashMap;

use crate::resource::{JobId, ResourceId};

/// Tracks which job is waiting on which resource it has chosen to seize.
/// Mirrors the source's `coordinating_job_records`: at most one entry per
/// job (Invariant 3), and entries are cleared either when the job accepts
/// its resource or when the resource's seize timer expires.
#[derive(Debug, Clone, Default)]
pub struct SeizeRecord {
    by_job: HashMap<JobId, ResourceId>,
}

impl SeizeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `job_id` is waiting on `resource`. Replaces any prior
    /// entry for the same job — a job only ever has one outstanding seize.
    pub fn record(&mut self, job_id: impl Into<JobId>, resource: impl Into<ResourceId>) {
        self.by_job.insert(job_id.into(), resource.into());
    }

    pub fn resource_for_job(&self, job_id: &str) -> Option<&ResourceId> {
        self.by_job.get(job_id)
    }

    pub fn is_seized_job(&self, job_id: &str) -> bool {
        self.by_job.contains_key(job_id)
    }

    /// Remove every record pointing at `resource`, regardless of job id.
    /// Called once the resource has actually transitioned (accepted or
    /// its seize timer expired), so stale job bookkeeping never survives
    /// the resource moving on to something else.
    pub fn clear_for_resource(&mut self, resource: &str) {
        self.by_job.retain(|_, r| r != resource);
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_query() {
        let mut sr = SeizeRecord::new();
        sr.record("job-1", "r1");
        assert!(sr.is_seized_job("job-1"));
        assert_eq!(sr.resource_for_job("job-1"), Some(&"r1".to_string()));
        assert!(!sr.is_seized_job("job-2"));
    }

    #[test]
    fn at_most_one_entry_per_job() {
        let mut sr = SeizeRecord::new();
        sr.record("job-1", "r1");
        sr.record("job-1", "r2");
        assert_eq!(sr.len(), 1);
        assert_eq!(sr.resource_for_job("job-1"), Some(&"r2".to_string()));
    }

    #[test]
    fn clear_for_resource_removes_all_matching_jobs() {
        let mut sr = SeizeRecord::new();
        sr.record("job-1", "r1");
        sr.record("job-2", "r1");
        sr.record("job-3", "r2");
        sr.clear_for_resource("r1");
        assert!(!sr.is_seized_job("job-1"));
        assert!(!sr.is_seized_job("job-2"));
        assert!(sr.is_seized_job("job-3"));
        assert_eq!(sr.len(), 1);
    }
}
