//! Runtime metrics: counters, running averages, and system load.
//!
//! Counters follow a single-writer discipline (the worker owns transcription
//! counters, the audio thread owns `processed_samples`) and are read
//! concurrently; momentary inconsistency between them is acceptable.

use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Shared metrics store.
pub struct Metrics {
    transcriptions_count: AtomicU64,
    processed_samples: AtomicU64,
    discarded_short: AtomicU64,
    queue_overflow: AtomicU64,
    model_errors: AtomicU64,
    dropped_sends: AtomicU64,
    averages: Mutex<Averages>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

#[derive(Default)]
struct Averages {
    avg_latency_ms: f64,
    avg_rtf: f64,
}

/// Point-in-time metrics view, serialized for `get_metrics`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub transcriptions_count: u64,
    pub processed_samples: u64,
    pub discarded_short: u64,
    pub queue_overflow: u64,
    pub model_errors: u64,
    pub dropped_sends: u64,
    pub avg_latency_ms: f64,
    pub avg_rtf: f64,
    /// System-wide CPU usage in percent.
    pub cpu_usage: f32,
    /// Resident memory of this process in MiB.
    pub memory_usage_mb: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            transcriptions_count: AtomicU64::new(0),
            processed_samples: AtomicU64::new(0),
            discarded_short: AtomicU64::new(0),
            queue_overflow: AtomicU64::new(0),
            model_errors: AtomicU64::new(0),
            dropped_sends: AtomicU64::new(0),
            averages: Mutex::new(Averages::default()),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Record one completed transcription with its latency and real-time
    /// factor, updating the running averages.
    pub fn record_transcription(&self, latency_ms: f64, rtf: f64) {
        let n = self.transcriptions_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut avg) = self.averages.lock() {
            avg.avg_latency_ms = (avg.avg_latency_ms * (n - 1) as f64 + latency_ms) / n as f64;
            avg.avg_rtf = (avg.avg_rtf * (n - 1) as f64 + rtf) / n as f64;
        }
    }

    /// Audio-thread counter; atomic add only.
    pub fn add_processed_samples(&self, n: u64) {
        self.processed_samples.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_discarded_short(&self) {
        self.discarded_short.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_queue_overflow(&self) {
        self.queue_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_model_errors(&self) {
        self.model_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_sends(&self) {
        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_overflow_count(&self) -> u64 {
        self.queue_overflow.load(Ordering::Relaxed)
    }

    pub fn transcriptions_count(&self) -> u64 {
        self.transcriptions_count.load(Ordering::Relaxed)
    }

    /// Take a snapshot, refreshing CPU and memory readings.
    ///
    /// CPU usage is system-wide; memory is this process's resident set.
    /// The first call after startup reports 0% CPU (sysinfo needs two
    /// refresh points to compute a delta).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (cpu_usage, memory_usage_mb) = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu_usage();
                let cpu = system.global_cpu_usage();
                let memory = self
                    .pid
                    .and_then(|pid| {
                        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                        system.process(pid).map(|p| p.memory() / (1024 * 1024))
                    })
                    .unwrap_or(0);
                (cpu, memory)
            }
            Err(_) => (0.0, 0),
        };

        let (avg_latency_ms, avg_rtf) = self
            .averages
            .lock()
            .map(|a| (a.avg_latency_ms, a.avg_rtf))
            .unwrap_or((0.0, 0.0));

        MetricsSnapshot {
            transcriptions_count: self.transcriptions_count.load(Ordering::Relaxed),
            processed_samples: self.processed_samples.load(Ordering::Relaxed),
            discarded_short: self.discarded_short.load(Ordering::Relaxed),
            queue_overflow: self.queue_overflow.load(Ordering::Relaxed),
            model_errors: self.model_errors.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
            avg_latency_ms,
            avg_rtf,
            cpu_usage,
            memory_usage_mb,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transcriptions_count, 0);
        assert_eq!(snapshot.processed_samples, 0);
        assert_eq!(snapshot.queue_overflow, 0);
        assert_eq!(snapshot.model_errors, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.avg_rtf, 0.0);
    }

    #[test]
    fn test_running_averages() {
        let metrics = Metrics::new();
        metrics.record_transcription(100.0, 0.5);
        metrics.record_transcription(300.0, 0.7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transcriptions_count, 2);
        assert!((snapshot.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!((snapshot.avg_rtf - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_processed_samples_accumulates() {
        let metrics = Metrics::new();
        metrics.add_processed_samples(480);
        metrics.add_processed_samples(480);
        assert_eq!(metrics.snapshot().processed_samples, 960);
    }

    #[test]
    fn test_error_counters() {
        let metrics = Metrics::new();
        metrics.incr_discarded_short();
        metrics.incr_queue_overflow();
        metrics.incr_queue_overflow();
        metrics.incr_model_errors();
        metrics.incr_dropped_sends();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.discarded_short, 1);
        assert_eq!(snapshot.queue_overflow, 2);
        assert_eq!(snapshot.model_errors, 1);
        assert_eq!(snapshot.dropped_sends, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.record_transcription(42.0, 0.1);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["transcriptions_count"], 1);
        assert!(json["memory_usage_mb"].is_u64());
    }
}
