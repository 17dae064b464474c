//! Offline training pipeline: importance ranking, feature selection,
//! cross-validated grid search, candidate comparison and a sanity check.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::ArrayView2;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{Artifact, SelectedFeatureSet};
use crate::dataset::{Dataset, DatasetSchema};
use crate::error::{Result, ScanError};
use crate::ml::metrics::{accuracy, ConfusionMatrix};
use crate::ml::search::{grid_search, GridPoint, GridPointScore, ParamGrid};
use crate::ml::split::stratified_split;
use crate::ml::{Forest, ForestParams, MaxFeatures, ModelSpec, Predictor, TreeParams};

/// Importances within this distance below the mean still count as reaching it.
const SELECTION_TOLERANCE: f64 = 1e-12;

/// A named model trained on the same split as the tuned forest, scored by
/// held-out accuracy for the report only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub model: ModelSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub seed: u64,
    pub test_fraction: f64,
    pub cv_folds: usize,
    /// Trees in the extremely randomised forest used to rank features.
    pub importance_estimators: usize,
    pub grid: ParamGrid,
    pub candidates: Vec<Candidate>,
    #[serde(flatten)]
    pub dataset: DatasetSchema,
    /// Worker threads for fitting; rayon's default when unset.
    pub workers: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 3_195_567,
            test_fraction: 0.3,
            cv_folds: 5,
            importance_estimators: 100,
            grid: ParamGrid::default(),
            candidates: default_candidates(),
            dataset: DatasetSchema::default(),
            workers: None,
        }
    }
}

fn default_candidates() -> Vec<Candidate> {
    vec![
        Candidate {
            name: "DecisionTree".into(),
            model: ModelSpec::DecisionTree(TreeParams {
                max_depth: Some(100),
                ..TreeParams::default()
            }),
        },
        Candidate {
            name: "RandomForest1".into(),
            model: ModelSpec::RandomForest(ForestParams {
                n_estimators: 44,
                ..ForestParams::random_forest()
            }),
        },
        Candidate {
            name: "RandomForest2".into(),
            model: ModelSpec::RandomForest(ForestParams {
                n_estimators: 44,
                max_depth: Some(24),
                max_features: MaxFeatures::Fixed(4),
                min_samples_split: 2,
                ..ForestParams::random_forest()
            }),
        },
    ]
}

impl TrainingConfig {
    /// Read a JSON config; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ScanError::configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ScanError::configuration(format!(
                "test_fraction must be in (0, 1), got {}",
                self.test_fraction
            )));
        }
        if self.cv_folds < 2 {
            return Err(ScanError::configuration("cv_folds must be at least 2"));
        }
        if self.importance_estimators == 0 {
            return Err(ScanError::configuration("importance_estimators must be at least 1"));
        }
        if self.grid.points().is_empty() {
            return Err(ScanError::configuration("parameter grid is empty"));
        }
        if self.workers == Some(0) {
            return Err(ScanError::configuration("workers must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedFeature {
    pub name: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub name: String,
    pub accuracy: f64,
}

/// Evaluation on the full selected dataset, training rows included. A sanity
/// check, not a generalisation estimate.
#[derive(Debug, Clone, Serialize)]
pub struct SanityCheck {
    pub confusion: ConfusionMatrix,
    /// Malicious samples predicted legitimate.
    pub false_positive_rate: f64,
    /// Legitimate samples predicted malicious.
    pub false_negative_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub samples: usize,
    pub malicious: usize,
    pub legitimate: usize,
    pub feature_count: usize,
    /// Every input feature, most important first.
    pub importance_ranking: Vec<RankedFeature>,
    pub selection_threshold: f64,
    pub selected_features: Vec<String>,
    pub grid_scores: Vec<GridPointScore>,
    pub best_params: GridPoint,
    pub best_cv_auc: f64,
    pub tuned_accuracy: f64,
    pub candidates: Vec<CandidateScore>,
    /// Highest-accuracy candidate. Reported only; the tuned forest is what gets persisted.
    pub winner: Option<String>,
    pub sanity: SanityCheck,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: Artifact,
    pub report: TrainingReport,
}

pub struct Trainer {
    config: TrainingConfig,
    cancel: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned flag; setting it stops training at the next task boundary.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn train(&self, dataset: &Dataset) -> Result<TrainingOutcome> {
        let config = &self.config;
        config.validate()?;
        self.check_dataset(dataset)?;

        let split = stratified_split(&dataset.labels, config.test_fraction, config.seed);
        for class in [0u8, 1] {
            let in_train = split.train.iter().filter(|&&i| dataset.labels[i] == class).count();
            if in_train < config.cv_folds {
                return Err(ScanError::configuration(format!(
                    "class {class} has {in_train} training samples, fewer than {} folds",
                    config.cv_folds
                )));
            }
        }

        let pool = self.build_pool()?;
        let (malicious, legitimate) = dataset.class_counts();
        info!(
            samples = dataset.len(),
            malicious,
            legitimate,
            features = dataset.feature_names.len(),
            "training started"
        );

        // Rank and select features
        self.checkpoint()?;
        let importance_params = ForestParams {
            n_estimators: config.importance_estimators,
            ..ForestParams::extra_trees()
        };
        let all_rows: Vec<usize> = (0..dataset.len()).collect();
        let ranker = pool.install(|| {
            Forest::fit(importance_params, dataset.features.view(), &dataset.labels, &all_rows, config.seed)
        })?;
        let importances = ranker.feature_importances();
        let importance_ranking = rank(&dataset.feature_names, importances);
        let (selection_threshold, selected) = select_from_importances(importances);
        if selected.is_empty() {
            return Err(ScanError::configuration("feature selection kept no features"));
        }
        let selected_names: Vec<String> =
            selected.iter().map(|&i| dataset.feature_names[i].clone()).collect();
        info!(
            selected = selected_names.len(),
            of = dataset.feature_names.len(),
            "features selected"
        );
        for (n, feature) in importance_ranking.iter().enumerate() {
            debug!(rank = n + 1, feature = %feature.name, importance = feature.importance);
        }

        let x = dataset.select_columns(&selected);
        let x = x.view();
        let y = &dataset.labels;

        // Tune the persisted model
        let search = grid_search(
            x,
            y,
            &split.train,
            &config.grid,
            config.cv_folds,
            config.seed,
            &self.cancel,
            &pool,
        )?;
        let best = search.best().clone();
        let tuned = search.best_model;
        let tuned_accuracy = held_out_accuracy(&tuned, x, y, &split.test);
        info!(
            params = ?best.point,
            cv_auc = best.mean_auc,
            accuracy = tuned_accuracy,
            "grid search finished"
        );

        // Compare named candidates
        let mut candidates = Vec::with_capacity(config.candidates.len());
        for candidate in &config.candidates {
            self.checkpoint()?;
            let model = pool.install(|| candidate.model.fit(x, y, &split.train, config.seed))?;
            let score = held_out_accuracy(model.as_ref(), x, y, &split.test);
            info!(candidate = %candidate.name, accuracy = score, "candidate scored");
            candidates.push(CandidateScore {
                name: candidate.name.clone(),
                accuracy: score,
            });
        }
        let winner = candidates
            .iter()
            .fold(None::<&CandidateScore>, |best, c| match best {
                Some(b) if b.accuracy >= c.accuracy => Some(b),
                _ => Some(c),
            })
            .map(|c| c.name.clone());
        if let Some(name) = &winner {
            info!(winner = %name, "best candidate (reported only)");
        }

        let predicted = tuned.predict_rows(x, &all_rows);
        let confusion = ConfusionMatrix::from_predictions(y, &predicted);
        let sanity = SanityCheck {
            confusion,
            false_positive_rate: confusion.class0_miss_rate(),
            false_negative_rate: confusion.class1_miss_rate(),
        };
        info!(
            false_positive_rate = sanity.false_positive_rate,
            false_negative_rate = sanity.false_negative_rate,
            "sanity check on full dataset"
        );

        let report = TrainingReport {
            samples: dataset.len(),
            malicious,
            legitimate,
            feature_count: dataset.feature_names.len(),
            importance_ranking,
            selection_threshold,
            selected_features: selected_names.clone(),
            grid_scores: search.scores,
            best_params: best.point,
            best_cv_auc: best.mean_auc,
            tuned_accuracy,
            candidates,
            winner,
            sanity,
        };
        Ok(TrainingOutcome {
            artifact: Artifact {
                model: tuned,
                features: SelectedFeatureSet::new(selected_names),
            },
            report,
        })
    }

    fn check_dataset(&self, dataset: &Dataset) -> Result<()> {
        if dataset.is_empty() {
            return Err(ScanError::configuration("training dataset is empty"));
        }
        if dataset.feature_names.is_empty() {
            return Err(ScanError::configuration("training dataset has no feature columns"));
        }
        let (malicious, legitimate) = dataset.class_counts();
        if malicious == 0 || legitimate == 0 {
            return Err(ScanError::configuration(format!(
                "training dataset has a single class ({malicious} malicious, {legitimate} legitimate)"
            )));
        }
        if malicious < 2 || legitimate < 2 {
            return Err(ScanError::configuration(
                "each class needs at least two samples for a stratified split",
            ));
        }
        Ok(())
    }

    fn build_pool(&self) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.config.workers.unwrap_or(0))
            .thread_name(|i| format!("pescan-train-{i}"))
            .build()
            .map_err(|e| ScanError::configuration(format!("cannot start worker pool: {e}")))
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn rank(names: &[String], importances: &[f64]) -> Vec<RankedFeature> {
    let mut order: Vec<usize> = (0..names.len()).collect();
    order.sort_by(|&a, &b| importances[b].total_cmp(&importances[a]));
    order
        .into_iter()
        .map(|i| RankedFeature {
            name: names[i].clone(),
            importance: importances[i],
        })
        .collect()
}

/// Columns whose importance is positive and reaches the mean importance, in
/// column order, together with that mean.
fn select_from_importances(importances: &[f64]) -> (f64, Vec<usize>) {
    if importances.is_empty() {
        return (0.0, Vec::new());
    }
    let threshold = importances.iter().sum::<f64>() / importances.len() as f64;
    let selected = importances
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0 && v >= threshold - SELECTION_TOLERANCE)
        .map(|(i, _)| i)
        .collect();
    (threshold, selected)
}

fn held_out_accuracy<P: Predictor + ?Sized>(
    model: &P,
    x: ArrayView2<'_, f64>,
    y: &[u8],
    rows: &[usize],
) -> f64 {
    let truth: Vec<u8> = rows.iter().map(|&i| y[i]).collect();
    accuracy(&truth, &model.predict_rows(x, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Column 0 carries the label, column 1 is constant, the rest is noise.
    fn synthetic(n: usize, columns: usize) -> Dataset {
        let mut x = Array2::zeros((n, columns));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = u8::from(i % 2 == 0);
            x[[i, 0]] = if label == 1 { 20.0 + (i % 5) as f64 } else { (i % 5) as f64 };
            x[[i, 1]] = 7.0;
            for c in 2..columns {
                x[[i, c]] = ((i * (c + 3)) % 17) as f64;
            }
            labels.push(label);
        }
        let names = (0..columns).map(|c| format!("f{c}")).collect();
        Dataset::from_parts(names, x, labels).unwrap()
    }

    fn fast_config() -> TrainingConfig {
        TrainingConfig {
            importance_estimators: 60,
            cv_folds: 3,
            grid: ParamGrid {
                n_estimators: vec![4, 8],
                min_samples_split: vec![2],
                max_features: vec![2],
                max_depth: vec![Some(6)],
            },
            candidates: vec![
                Candidate {
                    name: "tree".into(),
                    model: ModelSpec::DecisionTree(TreeParams::default()),
                },
                Candidate {
                    name: "forest".into(),
                    model: ModelSpec::RandomForest(ForestParams {
                        n_estimators: 5,
                        ..ForestParams::random_forest()
                    }),
                },
            ],
            workers: Some(2),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.grid.points().len(), 5);
        assert_eq!(config.candidates.len(), 3);
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{"seed": 9, "cv_folds": 3}"#).unwrap();
        let config = TrainingConfig::load(file.path()).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.cv_folds, 3);
        assert_eq!(config.test_fraction, 0.3);
        assert_eq!(config.dataset.label_column, "legitimate");
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let config = TrainingConfig { test_fraction: 1.0, ..TrainingConfig::default() };
        assert!(matches!(config.validate(), Err(ScanError::Configuration { .. })));
    }

    #[test]
    fn single_class_is_a_configuration_error() {
        let x = Array2::from_elem((10, 3), 1.0);
        let data = Dataset::from_parts(vec!["a".into(), "b".into(), "c".into()], x, vec![1; 10]).unwrap();
        let err = Trainer::new(fast_config()).train(&data).unwrap_err();
        assert!(matches!(err, ScanError::Configuration { .. }));
    }

    #[test]
    fn empty_dataset_is_a_configuration_error() {
        let data = Dataset::from_parts(vec!["a".into()], Array2::zeros((0, 1)), Vec::new()).unwrap();
        let err = Trainer::new(fast_config()).train(&data).unwrap_err();
        assert!(matches!(err, ScanError::Configuration { .. }));
    }

    #[test]
    fn too_few_samples_for_the_folds() {
        let data = synthetic(6, 4);
        let err = Trainer::new(fast_config()).train(&data).unwrap_err();
        assert!(matches!(err, ScanError::Configuration { .. }));
    }

    #[test]
    fn all_constant_columns_collapse_selection() {
        let x = Array2::from_elem((30, 3), 2.0);
        let labels = (0..30).map(|i| (i % 2) as u8).collect();
        let data = Dataset::from_parts(vec!["a".into(), "b".into(), "c".into()], x, labels).unwrap();
        let err = Trainer::new(fast_config()).train(&data).unwrap_err();
        assert!(matches!(err, ScanError::Configuration { .. }));
    }

    #[test]
    fn selection_drops_the_constant_column() {
        let outcome = Trainer::new(fast_config()).train(&synthetic(60, 5)).unwrap();
        let names = &outcome.artifact.features.names;
        assert!(names.len() < 5);
        assert!(names.contains(&"f0".to_string()));
        assert!(!names.contains(&"f1".to_string()));
        assert_eq!(outcome.artifact.model.n_features(), names.len());
        let last = outcome.report.importance_ranking.last().unwrap();
        assert_eq!((last.name.as_str(), last.importance), ("f1", 0.0));
        assert_eq!(outcome.report.candidates.len(), 2);
        assert!(outcome.report.winner.is_some());
    }

    #[test]
    fn same_seed_same_outcome() {
        let data = synthetic(60, 8);
        let a = Trainer::new(fast_config()).train(&data).unwrap();
        let b = Trainer::new(fast_config()).train(&data).unwrap();
        assert_eq!(a.artifact.features, b.artifact.features);
        assert_eq!(a.report.best_params, b.report.best_params);
        let rows: Vec<usize> = (0..data.len()).collect();
        let columns: Vec<usize> = b
            .artifact
            .features
            .names
            .iter()
            .filter_map(|n| data.feature_names.iter().position(|f| f == n))
            .collect();
        let x = data.select_columns(&columns);
        assert_eq!(a.artifact.model.feature_importances(), b.artifact.model.feature_importances());
        assert_eq!(
            a.artifact.model.predict_proba_rows(x.view(), &rows),
            b.artifact.model.predict_proba_rows(x.view(), &rows)
        );
    }

    #[test]
    fn cancelled_before_start() {
        let cancel = Arc::new(AtomicBool::new(true));
        let err = Trainer::new(fast_config())
            .with_cancel_flag(cancel)
            .train(&synthetic(60, 8))
            .unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
    }

    #[test]
    fn selection_rule() {
        let (threshold, kept) = select_from_importances(&[0.5, 0.0, 0.25, 0.25]);
        assert_eq!(threshold, 0.25);
        assert_eq!(kept, vec![0, 2, 3]);
        assert!(select_from_importances(&[0.0, 0.0]).1.is_empty());
    }
}
