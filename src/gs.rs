//! Ghostscript compression capability.
//!
//! Wraps the external binary (gs / gswin64c etc.) behind the `Compressor`
//! trait with quality presets, page-progress parsing, and a candidate
//! command fallback for Windows installs that keep the executable off
//! the PATH.

use crate::config::QualityPreset;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("compression tool not available: {0}")]
    Unavailable(String),

    #[error("compression failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompressError {
    /// Machine-readable failure code carried through job status responses.
    pub fn code(&self) -> &'static str {
        match self {
            CompressError::Unavailable(_) => "capability_unavailable",
            CompressError::Failed { .. } | CompressError::Io(_) => "processing_failed",
        }
    }
}

/// Discrete progress signal: (units done, total units). A zero total
/// means the total is not yet known.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// The transformation capability the job manager schedules. Production
/// uses Ghostscript; tests substitute mocks.
#[async_trait::async_trait]
pub trait Compressor: Send + Sync + 'static {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        quality: QualityPreset,
        progress: ProgressSink,
    ) -> Result<(), CompressError>;
}

const DEFAULT_ARGS: &[&str] = &[
    "-sDEVICE=pdfwrite",
    "-dCompatibilityLevel=1.4",
    "-dNOPAUSE",
    "-dBATCH",
    "-dDetectDuplicateImages=true",
    "-dCompressFonts=true",
    "-dSubsetFonts=true",
];

pub struct Ghostscript;

impl Ghostscript {
    /// Invocation names to try, in order. GHOSTSCRIPT_PATH pins the exact
    /// executable; the Windows installer ships gswin64c/gswin32c which
    /// usually aren't on the PATH.
    fn candidate_commands() -> Vec<String> {
        if let Ok(cmd) = std::env::var("GHOSTSCRIPT_PATH") {
            if !cmd.is_empty() {
                return vec![cmd];
            }
        }
        if cfg!(windows) {
            vec![
                "gswin64c".to_string(),
                "gswin32c".to_string(),
                "gs".to_string(),
            ]
        } else {
            vec!["gs".to_string()]
        }
    }

    async fn run_command(
        command: &str,
        input: &Path,
        output: &Path,
        quality: QualityPreset,
        progress: &ProgressSink,
    ) -> Result<(), CompressError> {
        let mut child = tokio::process::Command::new(command)
            .args(DEFAULT_ARGS)
            .arg(format!("-dPDFSETTINGS={}", quality.pdf_settings()))
            .arg(format!("-sOutputFile={}", output.display()))
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CompressError::Unavailable(format!("{}: not found", command))
                } else {
                    CompressError::Io(e)
                }
            })?;

        // Stderr is drained concurrently so a chatty gs can't deadlock on
        // a full pipe while we read page lines from stdout.
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut total_pages: u64 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(total) = parse_total_pages(&line) {
                total_pages = total;
                progress(0, total_pages);
            } else if let Some(page) = parse_page_line(&line) {
                progress(page, total_pages);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            debug!("{} finished: {} pages", command, total_pages);
            Ok(())
        } else {
            let detail = if stderr.trim().is_empty() {
                format!("{} exited with code {:?}", command, status.code())
            } else {
                stderr.trim().to_string()
            };
            Err(CompressError::Failed {
                exit_code: status.code(),
                stderr: detail,
            })
        }
    }
}

#[async_trait::async_trait]
impl Compressor for Ghostscript {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        quality: QualityPreset,
        progress: ProgressSink,
    ) -> Result<(), CompressError> {
        // Only a "not found" spawn moves on to the next candidate. Any
        // other failure means the tool exists and genuinely failed, and
        // trying an alternate binary would mask it.
        let mut last_err = None;
        for command in Self::candidate_commands() {
            match Self::run_command(&command, input, output, quality, &progress).await {
                Ok(()) => return Ok(()),
                Err(e @ CompressError::Unavailable(_)) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CompressError::Unavailable("no candidates".to_string())))
    }
}

/// Parse "Processing pages 1 through 42." into the page total.
fn parse_total_pages(line: &str) -> Option<u64> {
    let rest = line.strip_prefix("Processing pages ")?;
    let through = rest.split_whitespace().nth(2)?;
    through.trim_end_matches('.').parse().ok()
}

/// Parse a Ghostscript "Page 7" progress line.
fn parse_page_line(line: &str) -> Option<u64> {
    let rest = line.strip_prefix("Page ")?;
    rest.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_total_pages() {
        assert_eq!(parse_total_pages("Processing pages 1 through 42."), Some(42));
        assert_eq!(parse_total_pages("Processing pages 1 through 1."), Some(1));
        assert_eq!(parse_total_pages("Page 3"), None);
        assert_eq!(parse_total_pages("random output"), None);
    }

    #[test]
    fn test_parse_page_line() {
        assert_eq!(parse_page_line("Page 7"), Some(7));
        assert_eq!(parse_page_line("Page 12"), Some(12));
        assert_eq!(parse_page_line("Pages done"), None);
        assert_eq!(parse_page_line("Processing pages 1 through 4."), None);
    }

    #[test]
    fn test_unavailable_vs_processing_codes() {
        let unavailable = CompressError::Unavailable("gs: not found".to_string());
        assert_eq!(unavailable.code(), "capability_unavailable");

        let failed = CompressError::Failed {
            exit_code: Some(1),
            stderr: "ioerror".to_string(),
        };
        assert_eq!(failed.code(), "processing_failed");
    }
}
