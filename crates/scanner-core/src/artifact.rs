//! Durable model + selected-feature stores.
//!
//! The two stores are written independently, so every load re-checks that
//! they still describe the same model.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ScanError};
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::ml::{Forest, Predictor};
use crate::train::TrainingReport;

pub const MODEL_FILE: &str = "classifier.bin";
pub const FEATURES_FILE: &str = "features.bin";
pub const REPORT_FILE: &str = "report.json";

/// Ordered feature names the model consumes, tagged with the extractor
/// schema they were named against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedFeatureSet {
    pub schema_version: u32,
    pub names: Vec<String>,
}

impl SelectedFeatureSet {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            schema_version: FEATURE_SCHEMA_VERSION,
            names,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub model: Forest,
    pub features: SelectedFeatureSet,
}

impl Artifact {
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        write_store(&dir.join(MODEL_FILE), &self.model)?;
        write_store(&dir.join(FEATURES_FILE), &self.features)?;
        info!(
            dir = %dir.display(),
            features = self.features.len(),
            trees = self.model.n_trees(),
            "artifact saved"
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let model: Forest = read_store(&dir.join(MODEL_FILE))?;
        let features_path = dir.join(FEATURES_FILE);
        let features: SelectedFeatureSet = read_store(&features_path)?;

        if features.is_empty() {
            return Err(ScanError::artifact(&features_path, "selected feature set is empty"));
        }
        if features.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(ScanError::artifact(
                &features_path,
                format!(
                    "feature schema version {} does not match extractor version {}",
                    features.schema_version, FEATURE_SCHEMA_VERSION
                ),
            ));
        }
        if model.n_features() != features.len() {
            return Err(ScanError::artifact(
                dir,
                format!(
                    "model expects {} features but the feature store names {}",
                    model.n_features(),
                    features.len()
                ),
            ));
        }

        info!(dir = %dir.display(), features = features.len(), "artifact loaded");
        Ok(Self { model, features })
    }
}

/// Human-readable companion to the binary stores. Not read back.
pub fn save_report(dir: &Path, report: &TrainingReport) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(REPORT_FILE);
    let mut out = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut out, report)
        .map_err(|e| ScanError::artifact(&path, e.to_string()))?;
    out.flush()?;
    Ok(())
}

fn write_store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut out, value).map_err(|e| ScanError::artifact(path, e.to_string()))?;
    out.flush()?;
    Ok(())
}

fn read_store<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| ScanError::artifact(path, e.to_string()))?;
    bincode::deserialize_from(BufReader::new(file)).map_err(|e| ScanError::artifact(path, e.to_string()))
}
