//! Frozen-model inference over single files.
//!
//! A runtime loads the artifact once and holds no mutable state, so one
//! instance can classify independent files from many threads at once.

use std::fmt;
use std::path::Path;

use ndarray::Array1;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::artifact::Artifact;
use crate::dataset::LABEL_LEGITIMATE;
use crate::error::{Result, ScanError};
use crate::features::{extract, extract_file, FeatureVector};
use crate::ml::Predictor;
use crate::pe::parse_pe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Legitimate,
    Malicious,
}

impl Verdict {
    /// Models are trained on the corpus `legitimate` column, so label 1 is legitimate.
    pub fn from_label(label: u8) -> Self {
        if label == LABEL_LEGITIMATE {
            Verdict::Legitimate
        } else {
            Verdict::Malicious
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Legitimate => f.write_str("legitimate"),
            Verdict::Malicious => f.write_str("malicious"),
        }
    }
}

/// Result of one classification as seen by an outside caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Legitimate = 0,
    Malicious = 1,
    /// The file could not be analysed. Never a synonym for legitimate.
    Error = 2,
}

impl Outcome {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Legitimate => Outcome::Legitimate,
            Verdict::Malicious => Outcome::Malicious,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Legitimate => f.write_str("legitimate"),
            Outcome::Malicious => f.write_str("malicious"),
            Outcome::Error => f.write_str("error"),
        }
    }
}

pub struct InferenceRuntime {
    artifact: Artifact,
}

impl InferenceRuntime {
    /// Load the artifact stored in `dir`. Any store problem is `ArtifactLoad`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            artifact: Artifact::load(dir)?,
        })
    }

    pub fn from_artifact(artifact: Artifact) -> Self {
        Self { artifact }
    }

    pub fn selected_features(&self) -> &[String] {
        &self.artifact.features.names
    }

    pub fn classify(&self, path: &Path) -> Result<Verdict> {
        let features = extract_file(path)?;
        let verdict = self.classify_vector(&features)?;
        debug!(path = %path.display(), %verdict, "classified");
        Ok(verdict)
    }

    /// Classify an image already read into memory.
    pub fn classify_bytes(&self, path: &Path, data: &[u8]) -> Result<Verdict> {
        let view = parse_pe(path, data)?;
        self.classify_vector(&extract(&view))
    }

    pub fn classify_vector(&self, features: &FeatureVector) -> Result<Verdict> {
        let values = features.project(&self.artifact.features.names).map_err(|e| {
            if let ScanError::FeatureMismatch { name } = &e {
                error!(feature = %name, "artifact selects a feature the extractor does not produce");
            }
            e
        })?;
        let label = self.artifact.model.predict(Array1::from(values).view());
        Ok(Verdict::from_label(label))
    }

    /// Classify and fold any failure into [`Outcome::Error`].
    pub fn outcome(&self, path: &Path) -> Outcome {
        match self.classify(path) {
            Ok(verdict) => verdict.into(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "classification failed");
                Outcome::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::SelectedFeatureSet;
    use crate::dataset::Dataset;
    use crate::ml::search::ParamGrid;
    use crate::ml::{Forest, ForestParams};
    use crate::testutil::PeBuilder;
    use crate::train::{Trainer, TrainingConfig};
    use ndarray::Array2;
    use std::path::PathBuf;

    fn runtime_selecting(names: &[&str]) -> InferenceRuntime {
        let x = Array2::from_shape_fn((4, names.len()), |(i, _)| i as f64);
        let params = ForestParams { n_estimators: 2, ..ForestParams::random_forest() };
        let model = Forest::fit(params, x.view(), &[0, 0, 1, 1], &[0, 1, 2, 3], 0).unwrap();
        InferenceRuntime::from_artifact(Artifact {
            model,
            features: SelectedFeatureSet::new(names.iter().map(|s| s.to_string()).collect()),
        })
    }

    fn image_with_section(data: Vec<u8>) -> Vec<u8> {
        PeBuilder::new().section(".text", data).build()
    }

    #[test]
    fn label_mapping_follows_the_corpus() {
        assert_eq!(Verdict::from_label(1), Verdict::Legitimate);
        assert_eq!(Verdict::from_label(0), Verdict::Malicious);
        assert_eq!(Outcome::from(Verdict::Legitimate).code(), 0);
        assert_eq!(Outcome::from(Verdict::Malicious).code(), 1);
        assert_eq!(Outcome::Error.code(), 2);
    }

    #[test]
    fn missing_file_is_an_error_outcome() {
        let runtime = runtime_selecting(&["SectionsMaxEntropy"]);
        let outcome = runtime.outcome(&PathBuf::from("/definitely/not/here.exe"));
        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn unparsable_file_is_an_error_outcome() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"MZ but nothing else").unwrap();
        let runtime = runtime_selecting(&["SectionsMaxEntropy"]);
        assert!(matches!(runtime.classify(file.path()), Err(ScanError::MalformedInput { .. })));
        assert_eq!(runtime.outcome(file.path()), Outcome::Error);
    }

    #[test]
    fn unknown_selected_feature_is_a_mismatch() {
        let runtime = runtime_selecting(&["SectionsMaxEntropy", "NotAFeature"]);
        let image = image_with_section(vec![0x90; 512]);
        let err = runtime.classify_bytes(Path::new("sample.exe"), &image).unwrap_err();
        assert!(matches!(err, ScanError::FeatureMismatch { ref name } if name == "NotAFeature"));
    }

    #[test]
    fn trained_model_classifies_built_images() {
        let n = 40;
        let mut x = Array2::zeros((n, 3));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let legit = i % 2 == 0;
            x[[i, 0]] = 332.0;
            x[[i, 1]] = if legit { (i % 10) as f64 * 0.2 } else { 6.0 + (i % 10) as f64 * 0.15 };
            x[[i, 2]] = 0.0;
            labels.push(u8::from(legit));
        }
        let names = vec!["Machine".into(), "SectionsMaxEntropy".into(), "ResourcesNb".into()];
        let data = Dataset::from_parts(names, x, labels).unwrap();
        let config = TrainingConfig {
            importance_estimators: 40,
            cv_folds: 3,
            grid: ParamGrid {
                n_estimators: vec![5],
                min_samples_split: vec![2],
                max_features: vec![1],
                max_depth: vec![None],
            },
            candidates: Vec::new(),
            workers: Some(2),
            ..TrainingConfig::default()
        };
        let outcome = Trainer::new(config).train(&data).unwrap();
        assert_eq!(outcome.artifact.features.names, vec!["SectionsMaxEntropy".to_string()]);

        let runtime = InferenceRuntime::from_artifact(outcome.artifact);
        let quiet = image_with_section(vec![0x90; 512]);
        let noisy = image_with_section((0..=255u8).chain(0..=255u8).collect());
        assert_eq!(runtime.classify_bytes(Path::new("quiet.exe"), &quiet).unwrap(), Verdict::Legitimate);
        assert_eq!(runtime.classify_bytes(Path::new("noisy.exe"), &noisy).unwrap(), Verdict::Malicious);
    }
}
