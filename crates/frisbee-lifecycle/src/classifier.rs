//! Classification of children by phase
//!
//! A [`Classifier`] is rebuilt on every reconcile from the children the parent
//! currently owns. Buckets are disjoint: a child lands in at most one of them.
//! Children being deleted go to `terminating` regardless of their phase, and
//! uninitialized children are not accounted at all.

use std::collections::BTreeMap;

use frisbee_common::crd::Phase;

use crate::status::ChildRef;

/// Children of one parent, bucketed by phase
#[derive(Clone, Debug, Default)]
pub struct Classifier {
    pending: BTreeMap<String, ChildRef>,
    running: BTreeMap<String, ChildRef>,
    successful: BTreeMap<String, ChildRef>,
    failed: BTreeMap<String, ChildRef>,
    terminating: BTreeMap<String, ChildRef>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every classified child
    pub fn reset(&mut self) {
        self.pending.clear();
        self.running.clear();
        self.successful.clear();
        self.failed.clear();
        self.terminating.clear();
    }

    fn remove(&mut self, name: &str) {
        self.pending.remove(name);
        self.running.remove(name);
        self.successful.remove(name);
        self.failed.remove(name);
        self.terminating.remove(name);
    }

    /// Account a child under the bucket of its phase.
    ///
    /// A child experiencing chaos is still alive and counts as running.
    pub fn classify(&mut self, name: &str, child: ChildRef) {
        self.remove(name);

        if child.terminating {
            self.terminating.insert(name.to_string(), child);
            return;
        }

        let bucket = match child.phase() {
            Phase::Uninitialized => return,
            Phase::Pending => &mut self.pending,
            Phase::Running | Phase::Chaos => &mut self.running,
            Phase::Success => &mut self.successful,
            Phase::Failed => &mut self.failed,
        };
        bucket.insert(name.to_string(), child);
    }

    /// Register a system service. It is not accounted unless it has failed.
    pub fn exclude(&mut self, name: &str, child: ChildRef) {
        if child.phase() == Phase::Failed {
            self.remove(name);
            self.failed.insert(name.to_string(), child);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Number of accounted children. Terminating children are not counted.
    pub fn count(&self) -> usize {
        self.pending.len() + self.running.len() + self.successful.len() + self.failed.len()
    }

    pub fn num_pending_jobs(&self) -> usize {
        self.pending.len()
    }

    pub fn num_running_jobs(&self) -> usize {
        self.running.len()
    }

    pub fn num_successful_jobs(&self) -> usize {
        self.successful.len()
    }

    pub fn num_failed_jobs(&self) -> usize {
        self.failed.len()
    }

    pub fn num_terminating_jobs(&self) -> usize {
        self.terminating.len()
    }

    pub fn list_pending_jobs(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn list_running_jobs(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn list_successful_jobs(&self) -> Vec<String> {
        self.successful.keys().cloned().collect()
    }

    pub fn list_failed_jobs(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }

    pub fn list_terminating_jobs(&self) -> Vec<String> {
        self.terminating.keys().cloned().collect()
    }

    pub fn get_pending_jobs(&self) -> Vec<&ChildRef> {
        self.pending.values().collect()
    }

    pub fn get_running_jobs(&self) -> Vec<&ChildRef> {
        self.running.values().collect()
    }

    pub fn get_successful_jobs(&self) -> Vec<&ChildRef> {
        self.successful.values().collect()
    }

    pub fn get_failed_jobs(&self) -> Vec<&ChildRef> {
        self.failed.values().collect()
    }

    pub fn get_terminating_jobs(&self) -> Vec<&ChildRef> {
        self.terminating.values().collect()
    }

    /// Whether every named job is pending
    pub fn is_pending<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.pending.contains_key(n.as_ref()))
    }

    /// Whether every named job is running
    pub fn is_running<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.running.contains_key(n.as_ref()))
    }

    /// Whether every named job completed successfully
    pub fn is_successful<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.successful.contains_key(n.as_ref()))
    }

    /// Whether every named job has failed
    pub fn is_failed<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.failed.contains_key(n.as_ref()))
    }

    /// Whether every named job is being deleted
    pub fn is_terminating<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.terminating.contains_key(n.as_ref()))
    }

    /// Look up a job that may be deleted by the user.
    ///
    /// Only pending or running jobs of the system under test qualify.
    pub fn is_deletable(&self, name: &str) -> (Option<&ChildRef>, bool) {
        let child = self.pending.get(name).or_else(|| self.running.get(name));
        match child {
            Some(c) => (Some(c), c.is_sut()),
            None => (None, false),
        }
    }

    /// All accounted and terminating jobs, grouped by bucket
    pub fn list_all(&self) -> String {
        format!(
            "pending: {:?}, running: {:?}, successful: {:?}, failed: {:?}, terminating: {:?}",
            self.list_pending_jobs(),
            self.list_running_jobs(),
            self.list_successful_jobs(),
            self.list_failed_jobs(),
            self.list_terminating_jobs(),
        )
    }

    /// Size of every bucket
    pub fn num_all(&self) -> String {
        format!(
            "pending: {}, running: {}, successful: {}, failed: {}, terminating: {}",
            self.pending.len(),
            self.running.len(),
            self.successful.len(),
            self.failed.len(),
            self.terminating.len(),
        )
    }
}
