//! Batch scan orchestrator with progress tracking.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, ScanError};
use crate::inference::{InferenceRuntime, Outcome};
use crate::report::ScanResult;

/// Configuration for a scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub model_dir: PathBuf,
    pub target_paths: Vec<PathBuf>,
    /// Skip files that do not start with the `MZ` magic.
    pub executables_only: bool,
    /// Files larger than this are reported as errors without being parsed.
    pub max_file_size: Option<u64>,
}

/// Atomic progress tracking, readable from another thread while a scan runs.
pub struct ScanProgress {
    pub total_files: AtomicUsize,
    pub scanned_files: AtomicUsize,
    pub malicious_count: AtomicUsize,
    pub legitimate_count: AtomicUsize,
    pub error_count: AtomicUsize,
    pub cancel: AtomicBool,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self {
            total_files: AtomicUsize::new(0),
            scanned_files: AtomicUsize::new(0),
            malicious_count: AtomicUsize::new(0),
            legitimate_count: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            cancel: AtomicBool::new(false),
        }
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Legitimate => &self.legitimate_count,
            Outcome::Malicious => &self.malicious_count,
            Outcome::Error => &self.error_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.scanned_files.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Check for the DOS `MZ` magic that every PE image starts with.
pub fn is_pe_candidate(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == b"MZ")
        .unwrap_or(false)
}

/// Collect all file paths from the given paths (expanding directories).
pub fn collect_files(paths: &[PathBuf], executables_only: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            if !executables_only || is_pe_candidate(path) {
                files.push(path.clone());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
                let p = entry.into_path();
                if p.is_file() && (!executables_only || is_pe_candidate(&p)) {
                    files.push(p);
                }
            }
        } else {
            // keep it so the report shows it as an error rather than dropping it
            files.push(path.clone());
        }
    }

    files
}

/// Run a full scan with progress tracking. Blocking; the artifact is loaded
/// once and shared by every worker. A scan cancelled through `progress`
/// returns `ScanError::Cancelled` instead of partial results.
pub fn run_scan(config: &ScanConfig, progress: &Arc<ScanProgress>) -> Result<Vec<ScanResult>> {
    let runtime = InferenceRuntime::load(&config.model_dir)?;

    let files = collect_files(&config.target_paths, config.executables_only);
    progress.total_files.store(files.len(), Ordering::Relaxed);
    info!(files = files.len(), "scan started");

    if files.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<ScanResult> = files
        .par_iter()
        .filter_map(|path| {
            if progress.cancel.load(Ordering::Relaxed) {
                return None;
            }
            let result = scan_file(&runtime, path, config.max_file_size);
            debug!(path = %path.display(), outcome = %result.outcome, "scanned");
            progress.record(result.outcome);
            Some(result)
        })
        .collect();

    if progress.cancel.load(Ordering::Relaxed) {
        info!(scanned = results.len(), of = files.len(), "scan cancelled");
        return Err(ScanError::Cancelled);
    }
    Ok(results)
}

fn scan_file(runtime: &InferenceRuntime, path: &Path, max_file_size: Option<u64>) -> ScanResult {
    let failed = |error: String| ScanResult {
        path: path.to_path_buf(),
        sha256: None,
        outcome: Outcome::Error,
        error: Some(error),
    };

    let meta = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return failed("not a regular file".into()),
        Err(e) => return failed(format!("cannot stat file: {e}")),
    };
    if let Some(limit) = max_file_size {
        if meta.len() > limit {
            return failed(format!("file is {} bytes, above the {limit} byte limit", meta.len()));
        }
    }
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => return failed(format!("read error: {e}")),
    };
    let sha256 = Some(hex::encode(Sha256::digest(&data)));

    match runtime.classify_bytes(path, &data) {
        Ok(verdict) => ScanResult {
            path: path.to_path_buf(),
            sha256,
            outcome: verdict.into(),
            error: None,
        },
        Err(e) => ScanResult {
            sha256,
            ..failed(e.to_string())
        },
    }
}
