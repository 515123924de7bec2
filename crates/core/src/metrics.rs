use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::AdmissionError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub admitted: u64,
    pub not_applicable: u64,
    pub rejected_role: u64,
    pub rejected_size: u64,
    pub rejected_type: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    admitted: AtomicU64,
    not_applicable: AtomicU64,
    rejected_role: AtomicU64,
    rejected_size: AtomicU64,
    rejected_type: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            admitted: AtomicU64::new(0),
            not_applicable: AtomicU64::new(0),
            rejected_role: AtomicU64::new(0),
            rejected_size: AtomicU64::new(0),
            rejected_type: AtomicU64::new(0),
        })
    }

    pub fn inc_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_not_applicable(&self) {
        self.not_applicable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self, error: &AdmissionError) {
        let counter = match error {
            AdmissionError::RoleDenied => &self.rejected_role,
            AdmissionError::SizeExceeded { .. } => &self.rejected_size,
            AdmissionError::TypeUnverified => &self.rejected_type,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            admitted: self.admitted.load(Ordering::Relaxed),
            not_applicable: self.not_applicable.load(Ordering::Relaxed),
            rejected_role: self.rejected_role.load(Ordering::Relaxed),
            rejected_size: self.rejected_size.load(Ordering::Relaxed),
            rejected_type: self.rejected_type.load(Ordering::Relaxed),
        }
    }
}
