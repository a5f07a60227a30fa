//! Concurrency budget for one run's in-flight jobs.

use std::collections::{BTreeMap, HashMap};

use crate::store::PipelineRun;

/// Tracks claimed slots, overall and per backend.
///
/// A slot is taken when a job is claimed and given back when the job
/// reaches a terminal or Retrying state.
#[derive(Debug, Clone)]
pub struct ConcurrencyBudget {
    max_total: usize,
    limits: BTreeMap<String, usize>,
    total: usize,
    per_backend: HashMap<String, usize>,
}

impl ConcurrencyBudget {
    /// Creates a budget allowing `max_total` jobs (at least one) in flight.
    #[must_use]
    pub fn new(max_total: usize, limits: BTreeMap<String, usize>) -> Self {
        Self {
            max_total: max_total.max(1),
            limits,
            total: 0,
            per_backend: HashMap::new(),
        }
    }

    /// Recounts in-flight jobs from a run record.
    pub fn rebuild(&mut self, run: &PipelineRun) {
        self.total = 0;
        self.per_backend.clear();
        for job in run.jobs.values().filter(|j| j.status.is_in_flight()) {
            self.total += 1;
            if let Some(ref backend) = job.backend {
                *self.per_backend.entry(backend.clone()).or_default() += 1;
            }
        }
    }

    /// Returns true if any slot is free.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.total < self.max_total
    }

    /// Returns true if a job could be claimed for `backend`.
    #[must_use]
    pub fn has_room(&self, backend: &str) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.limits
            .get(backend)
            .map_or(true, |&limit| self.in_flight_on(backend) < limit)
    }

    /// Takes a slot for `backend`, returning false if none is free.
    pub fn try_acquire(&mut self, backend: &str) -> bool {
        if !self.has_room(backend) {
            return false;
        }
        self.total += 1;
        *self.per_backend.entry(backend.to_string()).or_default() += 1;
        true
    }

    /// Returns a slot taken for `backend`.
    pub fn release(&mut self, backend: &str) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.per_backend.get_mut(backend) {
            *count = count.saturating_sub(1);
        }
    }

    /// Total jobs in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.total
    }

    /// Jobs in flight on `backend`.
    #[must_use]
    pub fn in_flight_on(&self, backend: &str) -> usize {
        self.per_backend.get(backend).copied().unwrap_or(0)
    }
}
