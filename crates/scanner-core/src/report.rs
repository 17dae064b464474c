//! Output formatting for scan results and training reports.

use serde::Serialize;
use std::path::PathBuf;

use crate::inference::Outcome;
use crate::train::TrainingReport;

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub path: PathBuf,
    /// Hex SHA-256 of the file content, when it could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {s}. Use 'text' or 'json'.")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub total: usize,
    pub malicious: usize,
    pub legitimate: usize,
    pub errors: usize,
}

impl ScanSummary {
    pub fn from_results(results: &[ScanResult]) -> Self {
        let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            total: results.len(),
            malicious: count(Outcome::Malicious),
            legitimate: count(Outcome::Legitimate),
            errors: count(Outcome::Error),
        }
    }

    /// Share of analysed (non-error) files, in percent.
    fn percent(&self, n: usize) -> f64 {
        let analysed = self.malicious + self.legitimate;
        if analysed == 0 {
            0.0
        } else {
            100.0 * n as f64 / analysed as f64
        }
    }
}

pub fn print_results(results: &[ScanResult], format: OutputFormat) {
    match format {
        OutputFormat::Text => print_text(results),
        OutputFormat::Json => print_json(results),
    }
}

fn print_text(results: &[ScanResult]) {
    let summary = ScanSummary::from_results(results);

    println!("\n{}", "=".repeat(70));
    println!("SCAN RESULTS");
    println!("{}", "=".repeat(70));

    let malicious: Vec<_> = results.iter().filter(|r| r.outcome == Outcome::Malicious).collect();
    if !malicious.is_empty() {
        println!("\nMALICIOUS FILES ({}):", malicious.len());
        for r in &malicious {
            println!("  [{}] {}", r.sha256.as_deref().unwrap_or("-"), r.path.display());
        }
    }

    let errors: Vec<_> = results.iter().filter(|r| r.outcome == Outcome::Error).collect();
    if !errors.is_empty() {
        println!("\nERRORS ({}):", errors.len());
        for r in &errors {
            let err = r.error.as_deref().unwrap_or("unknown");
            println!("  [ERR ] {} -- {}", r.path.display(), err);
        }
    }

    println!("\nSUMMARY:");
    println!("  Total files scanned: {}", summary.total);
    println!(
        "  Malicious:           {} ({:.2}%)",
        summary.malicious,
        summary.percent(summary.malicious)
    );
    println!(
        "  Legitimate:          {} ({:.2}%)",
        summary.legitimate,
        summary.percent(summary.legitimate)
    );
    println!("  Errors:              {}", summary.errors);
    println!("{}", "=".repeat(70));
}

fn print_json(results: &[ScanResult]) {
    let output = serde_json::json!({
        "results": results,
        "summary": ScanSummary::from_results(results),
    });
    println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
}

pub fn print_training_report(report: &TrainingReport, format: OutputFormat) {
    match format {
        OutputFormat::Text => print_training_text(report),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
    }
}

fn print_training_text(report: &TrainingReport) {
    println!("\n{}", "=".repeat(70));
    println!("TRAINING REPORT");
    println!("{}", "=".repeat(70));
    println!(
        "\nDataset: {} samples ({} malicious, {} legitimate), {} features",
        report.samples, report.malicious, report.legitimate, report.feature_count
    );

    println!(
        "\nSELECTED FEATURES ({} of {}, threshold {:.6}):",
        report.selected_features.len(),
        report.feature_count,
        report.selection_threshold
    );
    for (n, f) in report
        .importance_ranking
        .iter()
        .filter(|f| report.selected_features.contains(&f.name))
        .enumerate()
    {
        println!("  {:>2}. {:<32} {:.6}", n + 1, f.name, f.importance);
    }

    let p = &report.best_params;
    println!("\nGRID SEARCH:");
    println!(
        "  Best: n_estimators={} max_depth={} max_features={} min_samples_split={}",
        p.n_estimators,
        p.max_depth.map_or("none".to_string(), |d| d.to_string()),
        p.max_features,
        p.min_samples_split
    );
    println!("  Mean CV ROC AUC:     {:.4}", report.best_cv_auc);
    println!("  Held-out accuracy:   {:.2}%", report.tuned_accuracy * 100.0);

    if !report.candidates.is_empty() {
        println!("\nCANDIDATES:");
        for c in &report.candidates {
            println!("  {:<20} {:.2}%", c.name, c.accuracy * 100.0);
        }
        if let Some(winner) = &report.winner {
            println!("  Winner (reported only): {winner}");
        }
    }

    println!("\nSANITY CHECK (full dataset, training rows included):");
    println!("  False positive rate: {:.4}%", report.sanity.false_positive_rate * 100.0);
    println!("  False negative rate: {:.4}%", report.sanity.false_negative_rate * 100.0);
    println!("{}", "=".repeat(70));
}
