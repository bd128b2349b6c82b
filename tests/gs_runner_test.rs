//! Exercises the Ghostscript adapter against stub executables, covering
//! progress parsing, stderr capture, and the not-found fallback.

#![cfg(unix)]

use pdfpress::config::QualityPreset;
use pdfpress::gs::{CompressError, Compressor, Ghostscript, ProgressSink};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

// GHOSTSCRIPT_PATH is process-global; serialize the tests that set it.
fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn write_script(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn test_stub_gs_reports_page_progress() {
    let _guard = env_lock().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();

    // Mimics gs output: a page total line followed by per-page lines,
    // then copies input (last arg) to the -sOutputFile target.
    let script = write_script(
        dir.path(),
        "fake-gs",
        r#"#!/bin/sh
out=""
for a in "$@"; do
  case "$a" in
    -sOutputFile=*) out="${a#-sOutputFile=}" ;;
  esac
  in="$a"
done
echo "Processing pages 1 through 3."
echo "Page 1"
echo "Page 2"
echo "Page 3"
cp "$in" "$out"
"#,
    );
    std::env::set_var("GHOSTSCRIPT_PATH", &script);

    let input = dir.path().join("input.pdf");
    let output = dir.path().join("compressed.pdf");
    std::fs::write(&input, b"%PDF-1.4 fake").unwrap();

    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink: ProgressSink = {
        let seen = seen.clone();
        Arc::new(move |cur, total| seen.lock().unwrap().push((cur, total)))
    };

    Ghostscript
        .run(&input, &output, QualityPreset::Medium, sink)
        .await
        .unwrap();
    std::env::remove_var("GHOSTSCRIPT_PATH");

    assert_eq!(std::fs::read(&output).unwrap(), b"%PDF-1.4 fake");
    let seen = seen.lock().unwrap();
    assert_eq!(&seen[..], &[(0, 3), (1, 3), (2, 3), (3, 3)]);
}

#[tokio::test]
async fn test_stub_gs_failure_captures_stderr() {
    let _guard = env_lock().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let script = write_script(
        dir.path(),
        "broken-gs",
        r#"#!/bin/sh
echo "Error: /ioerror in --run--" >&2
exit 1
"#,
    );
    std::env::set_var("GHOSTSCRIPT_PATH", &script);

    let input = dir.path().join("input.pdf");
    std::fs::write(&input, b"%PDF-1.4").unwrap();
    let output = dir.path().join("compressed.pdf");

    let sink: ProgressSink = Arc::new(|_, _| {});
    let err = Ghostscript
        .run(&input, &output, QualityPreset::Low, sink)
        .await
        .unwrap_err();
    std::env::remove_var("GHOSTSCRIPT_PATH");

    match err {
        CompressError::Failed { exit_code, stderr } => {
            assert_eq!(exit_code, Some(1));
            assert!(stderr.contains("ioerror"));
        }
        other => panic!("expected Failed, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_binary_is_unavailable() {
    let _guard = env_lock().lock().unwrap();
    std::env::set_var("GHOSTSCRIPT_PATH", "/nonexistent/gs-binary");

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.pdf");
    std::fs::write(&input, b"%PDF-1.4").unwrap();
    let output = dir.path().join("compressed.pdf");

    let sink: ProgressSink = Arc::new(|_, _| {});
    let err = Ghostscript
        .run(&input, &output, QualityPreset::Medium, sink)
        .await
        .unwrap_err();
    std::env::remove_var("GHOSTSCRIPT_PATH");

    assert!(matches!(err, CompressError::Unavailable(_)));
    assert_eq!(err.code(), "capability_unavailable");
}
