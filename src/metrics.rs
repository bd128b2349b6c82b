//! Service counters for Ops observability.
//!
//! Atomic counters and a bounded latency window exposed via the `/stats`
//! endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Maximum latency samples to keep for P99 calculation
const LATENCY_WINDOW_SIZE: usize = 1000;

pub struct MetricsCollector {
    /// Upload sessions opened since startup
    pub uploads_initiated: AtomicU64,
    /// Chunks accepted (rejections not counted)
    pub chunks_accepted: AtomicU64,
    /// Jobs launched since startup
    pub jobs_launched: AtomicU64,
    /// Jobs that reached `succeeded`
    pub jobs_succeeded: AtomicU64,
    /// Jobs that reached `failed`
    pub jobs_failed: AtomicU64,
    /// Sliding window of recent compression durations (ms)
    compress_latencies: RwLock<VecDeque<f64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            uploads_initiated: AtomicU64::new(0),
            chunks_accepted: AtomicU64::new(0),
            jobs_launched: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            compress_latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
        }
    }

    pub fn record_upload_initiated(&self) {
        self.uploads_initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_accepted(&self) {
        self.chunks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_launched(&self) {
        self.jobs_launched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful compression with its duration
    pub fn record_job_succeeded(&self, latency_ms: f64) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut latencies) = self.compress_latencies.write() {
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                latencies.pop_front();
            }
            latencies.push_back(latency_ms);
        }
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate P99 compression latency from the sliding window
    pub fn get_p99_latency(&self) -> f64 {
        if let Ok(latencies) = self.compress_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }

            let mut sorted: Vec<f64> = latencies.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let p99_index = ((sorted.len() as f64) * 0.99).ceil() as usize - 1;
            let p99_index = p99_index.min(sorted.len() - 1);
            sorted[p99_index]
        } else {
            0.0
        }
    }

    /// Get average compression latency from the sliding window
    pub fn get_avg_latency(&self) -> f64 {
        if let Ok(latencies) = self.compress_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }
            latencies.iter().sum::<f64>() / latencies.len() as f64
        } else {
            0.0
        }
    }

    pub fn get_sample_count(&self) -> usize {
        if let Ok(latencies) = self.compress_latencies.read() {
            latencies.len()
        } else {
            0
        }
    }
}

/// Get current process memory usage in bytes (RSS)
/// Uses getrusage() which works on both Linux and macOS
pub fn get_memory_usage_bytes() -> u64 {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;

        let mut rusage = MaybeUninit::<libc::rusage>::uninit();
        let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) };

        if ret == 0 {
            let rusage = unsafe { rusage.assume_init() };
            // ru_maxrss is in kilobytes on Linux, bytes on macOS
            #[cfg(target_os = "macos")]
            {
                rusage.ru_maxrss as u64
            }
            #[cfg(not(target_os = "macos"))]
            {
                (rusage.ru_maxrss as u64) * 1024
            }
        } else {
            0
        }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_counters() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.uploads_initiated.load(Ordering::Relaxed), 0);

        metrics.record_upload_initiated();
        metrics.record_chunk_accepted();
        metrics.record_chunk_accepted();

        assert_eq!(metrics.uploads_initiated.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.chunks_accepted.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_job_counters_and_latency() {
        let metrics = MetricsCollector::new();

        metrics.record_job_launched();
        metrics.record_job_succeeded(1.0);
        metrics.record_job_succeeded(2.0);
        metrics.record_job_succeeded(10.0);
        metrics.record_job_failed();

        assert_eq!(metrics.jobs_succeeded.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.jobs_failed.load(Ordering::Relaxed), 1);

        // With only 3 samples, P99 should be the max
        let p99 = metrics.get_p99_latency();
        assert!((p99 - 10.0).abs() < 0.01);

        let avg = metrics.get_avg_latency();
        assert!((avg - 4.333).abs() < 0.01);
    }

    #[test]
    fn test_empty_latencies() {
        let metrics = MetricsCollector::new();

        assert_eq!(metrics.get_p99_latency(), 0.0);
        assert_eq!(metrics.get_avg_latency(), 0.0);
        assert_eq!(metrics.get_sample_count(), 0);
    }
}
