// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected_tasks: AtomicUsize,
    pub busy_accepts: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected_tasks: AtomicUsize::new(0),
            busy_accepts: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_busy(&self) {
        self.busy_accepts.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
            busy_accepts: self.busy_accepts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub rejected_tasks: usize,
    pub busy_accepts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ServerMetrics::new();
        metrics.inc_conn();
        metrics.inc_conn();
        metrics.dec_conn();
        metrics.inc_req();
        metrics.add_bytes(120);
        metrics.add_bytes(30);
        metrics.inc_rejected();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.req_count, 1);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.rejected_tasks, 1);
        assert_eq!(snap.busy_accepts, 0);
    }

    #[test]
    fn metrics_are_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<ServerMetrics>(), 64);
    }
}
