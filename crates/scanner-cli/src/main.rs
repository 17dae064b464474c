//! pescan CLI - trains the PE classifier and scans files with it.
//!
//! Usage:
//!   pescan train --dataset data.csv --out model/
//!   pescan classify suspicious.exe --model-dir model/
//!   pescan scan /path/to/scan --model-dir model/ --format json --executables-only

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use pescan_core::artifact::save_report;
use pescan_core::dataset::Dataset;
use pescan_core::inference::{InferenceRuntime, Outcome};
use pescan_core::report::{print_results, print_training_report, OutputFormat};
use pescan_core::scan::{run_scan, ScanConfig, ScanProgress};
use pescan_core::train::{Trainer, TrainingConfig};

#[derive(Parser)]
#[command(name = "pescan")]
#[command(about = "Structural malware classifier for PE executables")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model from a labeled feature table and persist it
    Train {
        /// '|'-separated table with a `legitimate` label column
        #[arg(short, long)]
        dataset: PathBuf,

        /// Directory receiving classifier.bin, features.bin and report.json
        #[arg(short, long)]
        out: PathBuf,

        /// JSON training configuration (missing fields use defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Report format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Classify one file; exit code 0 = legitimate, 1 = malicious, 2 = error
    Classify {
        file: PathBuf,

        /// Directory holding a trained artifact
        #[arg(short, long)]
        model_dir: PathBuf,
    },

    /// Scan files and directories
    Scan {
        /// Paths to scan (files or directories)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory holding a trained artifact
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Only scan files starting with the MZ magic
        #[arg(long)]
        executables_only: bool,

        /// Report files larger than this many bytes as errors
        #[arg(long)]
        max_file_size: Option<u64>,
    },
}

fn init_logging(verbose: bool) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("pescan_core=debug,pescan=debug")
    } else {
        EnvFilter::new("pescan_core=info,pescan=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    debug!(verbose = cli.verbose, "logging initialized");

    match cli.command {
        Command::Classify { file, model_dir } => ExitCode::from(classify(&file, &model_dir) as u8),
        Command::Train { dataset, out, config, format } => {
            exit_on(train(&dataset, &out, config.as_deref(), format))
        }
        Command::Scan {
            paths,
            model_dir,
            format,
            executables_only,
            max_file_size,
        } => {
            let config = ScanConfig {
                model_dir,
                target_paths: paths,
                executables_only,
                max_file_size,
            };
            exit_on(scan(&config, format))
        }
    }
}

fn exit_on(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[!] {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn train(dataset: &Path, out: &Path, config: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = match config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("loading training config {}", path.display()))?,
        None => TrainingConfig::default(),
    };

    eprintln!("[*] Loading dataset from {}...", dataset.display());
    let data = Dataset::load(dataset, &config.dataset)
        .with_context(|| format!("loading dataset {}", dataset.display()))?;
    let (malicious, legitimate) = data.class_counts();
    eprintln!("[*] {} samples ({malicious} malicious, {legitimate} legitimate)", data.len());

    eprintln!("[*] Training...");
    let outcome = Trainer::new(config).train(&data).context("training failed")?;

    outcome
        .artifact
        .save(out)
        .with_context(|| format!("saving artifact to {}", out.display()))?;
    save_report(out, &outcome.report).context("saving training report")?;
    eprintln!("[*] Model saved to {}", out.display());

    print_training_report(&outcome.report, format);
    Ok(())
}

fn classify(file: &Path, model_dir: &Path) -> i32 {
    let runtime = match InferenceRuntime::load(model_dir) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[!] {e}");
            return Outcome::Error.code();
        }
    };

    let outcome = match runtime.classify(file) {
        Ok(verdict) => Outcome::from(verdict),
        Err(e) => {
            eprintln!("[!] {}: {e}", file.display());
            Outcome::Error
        }
    };
    println!("{}: {outcome}", file.display());
    outcome.code()
}

fn scan(config: &ScanConfig, format: OutputFormat) -> Result<()> {
    eprintln!("[*] Loading model from {}...", config.model_dir.display());
    let progress = Arc::new(ScanProgress::new());

    eprintln!("[*] Scanning...");
    let results = run_scan(config, &progress)
        .with_context(|| format!("scanning with model {}", config.model_dir.display()))?;

    let total = progress.total_files.load(Ordering::Relaxed);
    eprintln!("[*] Scanned {} files", total);

    if results.is_empty() {
        eprintln!("[*] No files to scan.");
        return Ok(());
    }

    print_results(&results, format);

    Ok(())
}
