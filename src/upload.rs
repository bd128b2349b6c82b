//! Chunked-upload session manager.
//!
//! Sessions accept chunks strictly in order and append them to a spool
//! file inside a session-owned scratch directory. Finalizing a complete
//! session consumes it and hands spool + scratch ownership to the caller.

use crate::config::{Limits, QualityPreset, SESSION_IDLE_EXPIRY_SECS, SWEEP_INTERVAL_SECS};
use crate::scratch::ScratchDir;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("declared size {declared} exceeds the {limit} byte limit")]
    TotalTooLarge { declared: u64, limit: u64 },

    #[error("chunk count {count} outside allowed range 1..={limit}")]
    BadChunkCount { count: u32, limit: u32 },

    #[error("upload session not found")]
    SessionNotFound,

    #[error("expected chunk {expected}, got chunk {got}")]
    ChunkOutOfOrder { expected: u32, got: u32 },

    #[error("chunk of {size} bytes exceeds the {limit} byte chunk limit")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("only PDF artifacts are accepted")]
    UnsupportedType,

    #[error("received bytes would exceed the declared total of {declared}")]
    TotalExceeded { declared: u64 },

    #[error("upload incomplete: received {received} of {expected} chunks")]
    Incomplete { received: u32, expected: u32 },

    #[error("spool I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Mutable half of a session, serialized by one tokio Mutex. A rejected
/// submission must leave all of this untouched.
struct SessionState {
    next_chunk: u32,
    received_bytes: u64,
    // Set by finalize while the lock is held; a racing submit on a stale
    // Arc sees it and is turned away instead of writing into a handed-off
    // spool file.
    consumed: bool,
    scratch: Option<ScratchDir>,
}

pub struct UploadSession {
    pub id: Uuid,
    pub declared_size: u64,
    pub chunk_count: u32,
    pub quality: QualityPreset,
    spool_path: PathBuf,
    state: tokio::sync::Mutex<SessionState>,
    last_activity: AtomicU64,
}

impl UploadSession {
    fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One-time transfer of artifact ownership from a completed session to a
/// new job. Holding the `Handoff` means holding the scratch directory.
#[derive(Debug)]
pub struct Handoff {
    pub spool_path: PathBuf,
    pub scratch: ScratchDir,
    pub size: u64,
    pub quality: QualityPreset,
}

pub struct UploadManager {
    sessions: DashMap<Uuid, Arc<UploadSession>>,
    limits: Limits,
}

impl UploadManager {
    pub fn new(limits: Limits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Register a new session and allocate its scratch dir + empty spool.
    pub async fn initiate(
        &self,
        declared_size: u64,
        chunk_count: u32,
        quality: QualityPreset,
    ) -> Result<Uuid, UploadError> {
        if declared_size > self.limits.max_total_size {
            return Err(UploadError::TotalTooLarge {
                declared: declared_size,
                limit: self.limits.max_total_size,
            });
        }
        if chunk_count == 0 || chunk_count > self.limits.max_chunk_count {
            return Err(UploadError::BadChunkCount {
                count: chunk_count,
                limit: self.limits.max_chunk_count,
            });
        }

        let id = Uuid::new_v4();
        let scratch = ScratchDir::create("pdfpress-upload")?;
        let spool_path = scratch.join("input.pdf");
        tokio::fs::File::create(&spool_path).await?;

        let session = Arc::new(UploadSession {
            id,
            declared_size,
            chunk_count,
            quality,
            spool_path,
            state: tokio::sync::Mutex::new(SessionState {
                next_chunk: 0,
                received_bytes: 0,
                consumed: false,
                scratch: Some(scratch),
            }),
            last_activity: AtomicU64::new(now_secs()),
        });
        self.sessions.insert(id, session);

        debug!(
            "Upload session {} opened: {} bytes in {} chunks, quality={}",
            id,
            declared_size,
            chunk_count,
            quality.as_str()
        );
        Ok(id)
    }

    fn get(&self, id: &Uuid) -> Result<Arc<UploadSession>, UploadError> {
        self.sessions
            .get(id)
            .map(|e| e.clone())
            .ok_or(UploadError::SessionNotFound)
    }

    /// Append one chunk. Accepted iff `index` equals the session's next
    /// expected index; every rejection leaves the spool untouched.
    pub async fn submit_chunk(
        &self,
        id: &Uuid,
        index: u32,
        bytes: &[u8],
    ) -> Result<u32, UploadError> {
        let session = self.get(id)?;

        if bytes.len() > self.limits.max_chunk_size {
            return Err(UploadError::ChunkTooLarge {
                size: bytes.len(),
                limit: self.limits.max_chunk_size,
            });
        }

        let mut state = session.state.lock().await;
        if state.consumed {
            return Err(UploadError::SessionNotFound);
        }
        if index != state.next_chunk {
            return Err(UploadError::ChunkOutOfOrder {
                expected: state.next_chunk,
                got: index,
            });
        }
        // The artifact must open with the PDF magic; turning anything
        // else away up front keeps arbitrary byte streams away from
        // Ghostscript.
        if state.next_chunk == 0 {
            let n = bytes.len().min(4);
            if bytes[..n] != b"%PDF"[..n] {
                return Err(UploadError::UnsupportedType);
            }
        }
        if state.received_bytes + bytes.len() as u64 > session.declared_size {
            return Err(UploadError::TotalExceeded {
                declared: session.declared_size,
            });
        }

        // Append while holding the lock: the spool stays the exact
        // in-order concatenation of accepted chunks.
        let mut spool = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.spool_path)
            .await?;
        spool.write_all(bytes).await?;
        spool.flush().await?;

        state.next_chunk += 1;
        state.received_bytes += bytes.len() as u64;
        let next = state.next_chunk;
        drop(state);

        session.touch();
        Ok(next)
    }

    /// Consume a complete session, transferring spool + scratch ownership
    /// to the returned handoff. Incomplete sessions survive the attempt.
    pub async fn finalize(&self, id: &Uuid) -> Result<Handoff, UploadError> {
        let session = self.get(id)?;

        let mut state = session.state.lock().await;
        if state.consumed {
            return Err(UploadError::SessionNotFound);
        }
        if state.next_chunk != session.chunk_count {
            return Err(UploadError::Incomplete {
                received: state.next_chunk,
                expected: session.chunk_count,
            });
        }

        state.consumed = true;
        let scratch = state
            .scratch
            .take()
            .expect("consumed flag guards the scratch guard");
        let size = state.received_bytes;
        drop(state);

        self.sessions.remove(id);
        info!("Upload session {} finalized: {} bytes spooled", id, size);

        Ok(Handoff {
            spool_path: session.spool_path.clone(),
            scratch,
            size,
            quality: session.quality,
        })
    }

    /// Periodically drop sessions that went idle. Removing the entry drops
    /// the last Arc in the common case, which releases the scratch dir.
    pub fn start_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let before = self.sessions.len();
                self.sessions
                    .retain(|_, session| session.idle_secs() < SESSION_IDLE_EXPIRY_SECS);
                let swept = before - self.sessions.len();
                if swept > 0 {
                    info!("Swept {} abandoned upload sessions", swept);
                }
            }
        });
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every session (shutdown path). Scratch dirs are released by
    /// the guards as the Arcs unwind.
    pub fn purge_all(&self) {
        self.sessions.clear();
    }
}
