//! Asynchronous compression job manager.
//!
//! Each finalized upload becomes one job: a background task runs the
//! compressor while status polls read atomics. A job reaches a terminal
//! state exactly once and its result is retrievable exactly once.

use crate::config::{FAILED_JOB_GRACE_SECS, JOB_LINGER_SECS, QualityPreset, SWEEP_INTERVAL_SECS};
use crate::gs::{CompressError, Compressor, ProgressSink};
use crate::metrics::MetricsCollector;
use crate::scratch::ScratchDir;
use crate::upload::Handoff;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found")]
    JobNotFound,

    #[error("job still running")]
    NotReady,

    #[error("{message}")]
    Failed {
        code: &'static str,
        message: String,
    },

    #[error("result delivery failed: {0}")]
    StreamDelivery(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

const STATUS_RUNNING: u8 = 0;
const STATUS_SUCCEEDED: u8 = 1;
const STATUS_FAILED: u8 = 2;

#[derive(Debug, Clone)]
pub struct JobFailure {
    pub code: &'static str,
    pub message: String,
}

pub struct Job {
    pub id: Uuid,
    pub original_size: u64,
    pub quality: QualityPreset,
    output_path: PathBuf,
    status: AtomicU8,
    progress: AtomicU8,
    final_size: AtomicU64,
    failure: RwLock<Option<JobFailure>>,
    // Scratch ownership: taken on failure (immediate release) or at
    // result retrieval (released when the stream finishes).
    scratch: Mutex<Option<ScratchDir>>,
    finished_at: AtomicU64,
    grace_scheduled: AtomicBool,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_SUCCEEDED => JobStatus::Succeeded,
            STATUS_FAILED => JobStatus::Failed,
            _ => JobStatus::Running,
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn final_size(&self) -> u64 {
        self.final_size.load(Ordering::Relaxed)
    }

    pub fn failure(&self) -> Option<JobFailure> {
        self.failure.read().ok().and_then(|f| f.clone())
    }

    /// Progress only moves forward: concurrent polls never observe a
    /// decrease even if the capability emits out-of-order signals.
    fn observe_progress(&self, current: u64, total: u64) {
        let pct = if total > 0 {
            let p = ((current as f64 / total as f64) * 100.0).round() as u64;
            p.min(100) as u8
        } else {
            0
        };
        self.progress.fetch_max(pct, Ordering::Relaxed);
    }

    fn mark_succeeded(&self, final_size: u64) {
        self.final_size.store(final_size, Ordering::Relaxed);
        self.progress.store(100, Ordering::Relaxed);
        self.status.store(STATUS_SUCCEEDED, Ordering::Release);
        self.finished_at.store(now_secs(), Ordering::Relaxed);
    }

    fn mark_failed(&self, failure: JobFailure) {
        if let Ok(mut slot) = self.failure.write() {
            *slot = Some(failure);
        }
        self.status.store(STATUS_FAILED, Ordering::Release);
        self.finished_at.store(now_secs(), Ordering::Relaxed);
        // No result will ever be retrievable; release the directory now.
        if let Ok(mut scratch) = self.scratch.lock() {
            scratch.take();
        }
    }

    fn terminal_age_secs(&self) -> Option<u64> {
        let finished = self.finished_at.load(Ordering::Relaxed);
        if finished == 0 {
            None
        } else {
            Some(now_secs().saturating_sub(finished))
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Snapshot returned by status polls.
#[derive(Debug)]
pub struct StatusView {
    pub status: JobStatus,
    pub progress: u8,
    pub original_size: u64,
    pub final_size: Option<u64>,
    pub failure: Option<JobFailure>,
}

/// One-shot result handed to the HTTP layer for streaming. Dropping it
/// (stream complete or client gone) releases the scratch dir.
#[derive(Debug)]
pub struct JobResult {
    pub output_path: PathBuf,
    pub original_size: u64,
    pub final_size: u64,
    pub scratch: ScratchDir,
}

pub struct JobManager {
    jobs: Arc<DashMap<Uuid, Arc<Job>>>,
    compressor: Arc<dyn Compressor>,
    metrics: Arc<MetricsCollector>,
}

impl JobManager {
    pub fn new(compressor: Arc<dyn Compressor>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            compressor,
            metrics,
        }
    }

    /// Register a job for a finalized upload and schedule the compressor
    /// on a background task. Returns immediately with the job token.
    pub fn launch(&self, handoff: Handoff) -> Uuid {
        let id = Uuid::new_v4();
        let output_path = handoff.scratch.join("compressed.pdf");

        let job = Arc::new(Job {
            id,
            original_size: handoff.size,
            quality: handoff.quality,
            output_path: output_path.clone(),
            status: AtomicU8::new(STATUS_RUNNING),
            progress: AtomicU8::new(0),
            final_size: AtomicU64::new(0),
            failure: RwLock::new(None),
            scratch: Mutex::new(Some(handoff.scratch)),
            finished_at: AtomicU64::new(0),
            grace_scheduled: AtomicBool::new(false),
        });
        self.jobs.insert(id, job.clone());
        self.metrics.record_job_launched();

        let compressor = self.compressor.clone();
        let metrics = self.metrics.clone();
        let input = handoff.spool_path;
        let quality = handoff.quality;
        tokio::spawn(async move {
            let start = std::time::Instant::now();
            let sink: ProgressSink = {
                let job = job.clone();
                Arc::new(move |current, total| job.observe_progress(current, total))
            };

            match compressor.run(&input, &output_path, quality, sink).await {
                Ok(()) => match tokio::fs::metadata(&output_path).await {
                    Ok(meta) => {
                        job.mark_succeeded(meta.len());
                        metrics.record_job_succeeded(start.elapsed().as_secs_f64() * 1000.0);
                        info!(
                            "Job {} succeeded: {} -> {} bytes ({})",
                            job.id,
                            job.original_size,
                            meta.len(),
                            quality.as_str()
                        );
                    }
                    Err(e) => {
                        job.mark_failed(JobFailure {
                            code: "processing_failed",
                            message: format!("output missing after compression: {}", e),
                        });
                        metrics.record_job_failed();
                        error!("Job {}: compressor reported success but output is unreadable: {}", job.id, e);
                    }
                },
                Err(e) => {
                    let failure = JobFailure {
                        code: e.code(),
                        message: e.to_string(),
                    };
                    match e {
                        CompressError::Unavailable(_) => {
                            warn!("Job {} failed: {}", job.id, failure.message)
                        }
                        _ => error!("Job {} failed: {}", job.id, failure.message),
                    }
                    job.mark_failed(failure);
                    metrics.record_job_failed();
                }
            }
        });

        id
    }

    /// Fast in-memory status read. The first observation of a failed job
    /// starts the grace countdown after which the entry disappears.
    pub fn status(&self, id: &Uuid) -> Result<StatusView, JobError> {
        let job = self
            .jobs
            .get(id)
            .map(|e| e.clone())
            .ok_or(JobError::JobNotFound)?;

        let status = job.status();
        if status == JobStatus::Failed {
            self.schedule_failed_cleanup(&job);
        }

        Ok(StatusView {
            status,
            progress: job.progress(),
            original_size: job.original_size,
            final_size: (status == JobStatus::Succeeded).then(|| job.final_size()),
            failure: job.failure(),
        })
    }

    /// Consume a succeeded job, transferring output + scratch ownership
    /// to the caller. Running jobs are not ready; failed jobs surface the
    /// stored failure and stay readable until their grace window closes.
    pub fn take_result(&self, id: &Uuid) -> Result<JobResult, JobError> {
        let job = self
            .jobs
            .get(id)
            .map(|e| e.clone())
            .ok_or(JobError::JobNotFound)?;

        match job.status() {
            JobStatus::Running => Err(JobError::NotReady),
            JobStatus::Failed => {
                self.schedule_failed_cleanup(&job);
                let failure = job.failure().unwrap_or(JobFailure {
                    code: "processing_failed",
                    message: "compression failed".to_string(),
                });
                Err(JobError::Failed {
                    code: failure.code,
                    message: failure.message,
                })
            }
            JobStatus::Succeeded => {
                // Claim the scratch guard first: exactly one caller wins
                // even if two result requests race on the same token.
                let scratch = job
                    .scratch
                    .lock()
                    .ok()
                    .and_then(|mut s| s.take())
                    .ok_or(JobError::JobNotFound)?;
                self.jobs.remove(id);
                Ok(JobResult {
                    output_path: job.output_path.clone(),
                    original_size: job.original_size,
                    final_size: job.final_size(),
                    scratch,
                })
            }
        }
    }

    fn schedule_failed_cleanup(&self, job: &Arc<Job>) {
        if job.grace_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs = self.jobs.clone();
        let id = job.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(FAILED_JOB_GRACE_SECS)).await;
            jobs.remove(&id);
        });
    }

    /// Periodically drop terminal jobs that nobody ever collected.
    pub fn start_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let before = self.jobs.len();
                self.jobs.retain(|_, job| {
                    job.terminal_age_secs()
                        .map(|age| age < JOB_LINGER_SECS)
                        .unwrap_or(true)
                });
                let swept = before - self.jobs.len();
                if swept > 0 {
                    info!("Swept {} unclaimed terminal jobs", swept);
                }
            }
        });
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Drop every job record (shutdown path). Running compressions keep
    /// their spawned tasks but their scratch dirs are released here.
    pub fn purge_all(&self) {
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::upload::UploadManager;
    use async_trait::async_trait;
    use std::path::Path;

    /// Copies input to output, emitting page progress along the way.
    struct CopyCompressor;

    #[async_trait]
    impl Compressor for CopyCompressor {
        async fn run(
            &self,
            input: &Path,
            output: &Path,
            _quality: QualityPreset,
            progress: ProgressSink,
        ) -> Result<(), CompressError> {
            progress(0, 4);
            for page in 1..=4 {
                progress(page, 4);
            }
            let bytes = tokio::fs::read(input).await?;
            tokio::fs::write(output, &bytes).await?;
            Ok(())
        }
    }

    struct FailingCompressor;

    #[async_trait]
    impl Compressor for FailingCompressor {
        async fn run(
            &self,
            _input: &Path,
            _output: &Path,
            _quality: QualityPreset,
            _progress: ProgressSink,
        ) -> Result<(), CompressError> {
            Err(CompressError::Failed {
                exit_code: Some(1),
                stderr: "ioerror in pdf".to_string(),
            })
        }
    }

    struct MissingCompressor;

    #[async_trait]
    impl Compressor for MissingCompressor {
        async fn run(
            &self,
            _input: &Path,
            _output: &Path,
            _quality: QualityPreset,
            _progress: ProgressSink,
        ) -> Result<(), CompressError> {
            Err(CompressError::Unavailable("gs: not found".to_string()))
        }
    }

    async fn handoff_with(content: &[u8]) -> Handoff {
        let uploads = UploadManager::new(Limits::default());
        let id = uploads
            .initiate(content.len() as u64, 1, QualityPreset::Medium)
            .await
            .unwrap();
        uploads.submit_chunk(&id, 0, content).await.unwrap();
        uploads.finalize(&id).await.unwrap()
    }

    fn manager_with(compressor: Arc<dyn Compressor>) -> Arc<JobManager> {
        Arc::new(JobManager::new(
            compressor,
            Arc::new(MetricsCollector::new()),
        ))
    }

    async fn wait_terminal(manager: &Arc<JobManager>, id: &Uuid) -> StatusView {
        for _ in 0..200 {
            let view = manager.status(id).unwrap();
            if view.status != JobStatus::Running {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn test_success_pins_progress_and_sizes() {
        let manager = manager_with(Arc::new(CopyCompressor));
        let id = manager.launch(handoff_with(b"%PDF-1.4 test").await);

        let view = wait_terminal(&manager, &id).await;
        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.progress, 100);
        assert_eq!(view.original_size, 13);
        assert_eq!(view.final_size, Some(13));
        assert!(view.failure.is_none());
    }

    #[tokio::test]
    async fn test_result_is_one_shot() {
        let manager = manager_with(Arc::new(CopyCompressor));
        let id = manager.launch(handoff_with(b"%PDF-1.4 body").await);
        wait_terminal(&manager, &id).await;

        let result = manager.take_result(&id).unwrap();
        let dir = result.scratch.path().to_path_buf();
        assert_eq!(
            std::fs::read(&result.output_path).unwrap(),
            b"%PDF-1.4 body"
        );
        drop(result);
        assert!(!dir.exists());

        assert!(matches!(
            manager.take_result(&id).unwrap_err(),
            JobError::JobNotFound
        ));
        assert!(matches!(
            manager.status(&id).unwrap_err(),
            JobError::JobNotFound
        ));
    }

    #[tokio::test]
    async fn test_processing_failure_releases_scratch() {
        let manager = manager_with(Arc::new(FailingCompressor));
        let handoff = handoff_with(b"%PDF-1.4 broken").await;
        let dir = handoff.scratch.path().to_path_buf();
        let id = manager.launch(handoff);

        let view = wait_terminal(&manager, &id).await;
        assert_eq!(view.status, JobStatus::Failed);
        let failure = view.failure.unwrap();
        assert_eq!(failure.code, "processing_failed");
        assert!(failure.message.contains("ioerror"));
        assert!(!dir.exists());

        // Result surfaces the stored failure rather than a crash.
        match manager.take_result(&id).unwrap_err() {
            JobError::Failed { code, .. } => assert_eq!(code, "processing_failed"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_capability_is_distinct() {
        let manager = manager_with(Arc::new(MissingCompressor));
        let id = manager.launch(handoff_with(b"%PDF-1.4 x").await);

        let view = wait_terminal(&manager, &id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.failure.unwrap().code, "capability_unavailable");
    }

    #[tokio::test]
    async fn test_result_before_completion_is_not_ready() {
        // A compressor that never finishes within the test window.
        struct StallingCompressor;

        #[async_trait]
        impl Compressor for StallingCompressor {
            async fn run(
                &self,
                _input: &Path,
                _output: &Path,
                _quality: QualityPreset,
                _progress: ProgressSink,
            ) -> Result<(), CompressError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let manager = manager_with(Arc::new(StallingCompressor));
        let id = manager.launch(handoff_with(b"%PDF-1.4 slow").await);

        assert!(matches!(
            manager.take_result(&id).unwrap_err(),
            JobError::NotReady
        ));
        let view = manager.status(&id).unwrap();
        assert_eq!(view.status, JobStatus::Running);
    }

    #[test]
    fn test_progress_is_monotone() {
        let job = Job {
            id: Uuid::new_v4(),
            original_size: 10,
            quality: QualityPreset::Medium,
            output_path: PathBuf::from("/tmp/out.pdf"),
            status: AtomicU8::new(STATUS_RUNNING),
            progress: AtomicU8::new(0),
            final_size: AtomicU64::new(0),
            failure: RwLock::new(None),
            scratch: Mutex::new(None),
            finished_at: AtomicU64::new(0),
            grace_scheduled: AtomicBool::new(false),
        };

        job.observe_progress(2, 4);
        assert_eq!(job.progress(), 50);
        // Late or repeated lower signals never move progress backwards
        job.observe_progress(1, 4);
        assert_eq!(job.progress(), 50);
        job.observe_progress(4, 4);
        assert_eq!(job.progress(), 100);
        // Unknown total reports zero, which fetch_max ignores
        job.observe_progress(7, 0);
        assert_eq!(job.progress(), 100);
    }
}
