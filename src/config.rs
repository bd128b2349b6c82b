//! Tuning configuration for the compression service.

// Upload admission limits (defaults, overridable via CLI)
pub const MAX_TOTAL_SIZE: u64 = 100 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;
pub const MAX_CHUNK_COUNT: u32 = 4096;

// Reaping policy
// Sessions with no chunk activity past the expiry are swept together
// with their scratch directories.
pub const SESSION_IDLE_EXPIRY_SECS: u64 = 30 * 60;
// Failed jobs stay readable for the grace window after the client first
// observes the failure, then the registry entry is dropped.
pub const FAILED_JOB_GRACE_SECS: u64 = 30;
// Terminal jobs nobody ever collects are dropped after the linger window.
pub const JOB_LINGER_SECS: u64 = 10 * 60;
pub const SWEEP_INTERVAL_SECS: u64 = 60;

// Result streaming read size
pub const STREAM_BUF_SIZE: usize = 64 * 1024;

// Allowance for the multipart envelope around a single chunk body; the
// request body limit is the chunk ceiling plus this.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,      // /screen - smallest output, 72 dpi images
    #[default]
    Medium,   // /ebook
    High,     // /printer
    Max,      // /prepress - largest output, best fidelity
}

impl QualityPreset {
    /// Ghostscript -dPDFSETTINGS value for this preset.
    pub fn pdf_settings(&self) -> &'static str {
        match self {
            QualityPreset::Low => "/screen",
            QualityPreset::Medium => "/ebook",
            QualityPreset::High => "/printer",
            QualityPreset::Max => "/prepress",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Max => "max",
        }
    }
}

/// Admission limits enforced by the upload session manager.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_total_size: u64,
    pub max_chunk_size: usize,
    pub max_chunk_count: u32,
    pub default_quality: QualityPreset,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_total_size: MAX_TOTAL_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_chunk_count: MAX_CHUNK_COUNT,
            default_quality: QualityPreset::Medium,
        }
    }
}
