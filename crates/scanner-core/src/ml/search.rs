//! Exhaustive hyperparameter search for random forests, scored by
//! cross-validated ROC AUC.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::ArrayView2;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::forest::{Forest, ForestParams};
use super::metrics::roc_auc;
use super::split::stratified_kfold;
use super::tree::MaxFeatures;
use super::Predictor;
use crate::error::{Result, ScanError};

/// Candidate values per hyperparameter. Every combination is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub min_samples_split: Vec<usize>,
    pub max_features: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![10, 44, 50, 100, 1000],
            min_samples_split: vec![2],
            max_features: vec![4],
            max_depth: vec![Some(24)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPoint {
    pub max_depth: Option<usize>,
    pub max_features: usize,
    pub min_samples_split: usize,
    pub n_estimators: usize,
}

impl GridPoint {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            max_features: MaxFeatures::Fixed(self.max_features),
            ..ForestParams::random_forest()
        }
    }
}

impl ParamGrid {
    /// Combinations with keys in alphabetical order, the last key varying fastest.
    pub fn points(&self) -> Vec<GridPoint> {
        let mut points = Vec::new();
        for &max_depth in &self.max_depth {
            for &max_features in &self.max_features {
                for &min_samples_split in &self.min_samples_split {
                    for &n_estimators in &self.n_estimators {
                        points.push(GridPoint {
                            max_depth,
                            max_features,
                            min_samples_split,
                            n_estimators,
                        });
                    }
                }
            }
        }
        points
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridPointScore {
    pub point: GridPoint,
    pub fold_auc: Vec<f64>,
    pub mean_auc: f64,
}

#[derive(Debug, Clone)]
pub struct GridSearchResult {
    pub scores: Vec<GridPointScore>,
    pub best_index: usize,
    /// The best point refit on every row passed to the search.
    pub best_model: Forest,
}

impl GridSearchResult {
    pub fn best(&self) -> &GridPointScore {
        &self.scores[self.best_index]
    }
}

/// Evaluate every grid point with stratified `folds`-fold cross-validation
/// over `rows`, pick the highest mean AUC (earliest point on ties) and refit
/// it on all of `rows`.
///
/// One task per (point, fold) runs on `pool`. `cancel` is polled before each
/// task and before the refit.
#[allow(clippy::too_many_arguments)]
pub fn grid_search(
    x: ArrayView2<'_, f64>,
    y: &[u8],
    rows: &[usize],
    grid: &ParamGrid,
    folds: usize,
    seed: u64,
    cancel: &AtomicBool,
    pool: &ThreadPool,
) -> Result<GridSearchResult> {
    let points = grid.points();
    if points.is_empty() {
        return Err(ScanError::configuration("parameter grid is empty"));
    }
    if folds < 2 {
        return Err(ScanError::configuration("cross-validation needs at least 2 folds"));
    }

    let partitions = stratified_kfold(y, rows, folds);
    let tasks: Vec<(usize, usize)> = (0..points.len())
        .flat_map(|p| (0..folds).map(move |f| (p, f)))
        .collect();

    let fold_scores: Vec<f64> = pool.install(|| {
        tasks
            .par_iter()
            .map(|&(p, f)| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(ScanError::Cancelled);
                }
                let partition = &partitions[f];
                let model = Forest::fit(
                    points[p].forest_params(),
                    x,
                    y,
                    &partition.train,
                    seed.wrapping_add(p as u64),
                )?;
                let truth: Vec<u8> = partition.test.iter().map(|&i| y[i]).collect();
                let proba = model.predict_proba_rows(x, &partition.test);
                // a fold without both classes carries no ranking signal
                Ok(roc_auc(&truth, &proba).unwrap_or(0.5))
            })
            .collect::<Result<Vec<f64>>>()
    })?;

    let scores: Vec<GridPointScore> = points
        .iter()
        .zip(fold_scores.chunks(folds))
        .map(|(&point, fold_auc)| {
            let mean_auc = fold_auc.iter().sum::<f64>() / folds as f64;
            debug!(?point, mean_auc, "grid point scored");
            GridPointScore {
                point,
                fold_auc: fold_auc.to_vec(),
                mean_auc,
            }
        })
        .collect();

    let mut best_index = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if score.mean_auc > scores[best_index].mean_auc {
            best_index = i;
        }
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(ScanError::Cancelled);
    }
    let best_model = pool.install(|| {
        Forest::fit(
            points[best_index].forest_params(),
            x,
            y,
            rows,
            seed.wrapping_add(best_index as u64),
        )
    })?;

    Ok(GridSearchResult {
        scores,
        best_index,
        best_model,
    })
}
