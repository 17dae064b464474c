//! Bagged tree ensembles: random forest (bootstrap rows, column subset per
//! tree) and the extremely randomised variant used to rank features (all
//! rows, column subset per tree).

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::tree::{DecisionTree, MaxFeatures, TreeParams};
use super::{normalize, Predictor};
use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
}

impl ForestParams {
    pub fn random_forest() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
        }
    }

    pub fn extra_trees() -> Self {
        Self {
            bootstrap: false,
            ..Self::random_forest()
        }
    }

    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            max_features: self.max_features,
        }
    }
}

impl Default for ForestParams {
    fn default() -> Self {
        Self::random_forest()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    params: ForestParams,
    trees: Vec<DecisionTree>,
    n_features: usize,
    importances: Vec<f64>,
}

impl Forest {
    /// Fit on `rows` of `x`. Per-tree seeds are drawn up front from `seed`, so
    /// the result does not depend on how rayon schedules the trees.
    pub fn fit(
        params: ForestParams,
        x: ArrayView2<'_, f64>,
        y: &[u8],
        rows: &[usize],
        seed: u64,
    ) -> Result<Self> {
        if params.n_estimators == 0 {
            return Err(ScanError::configuration("n_estimators must be at least 1"));
        }
        if rows.is_empty() {
            return Err(ScanError::configuration("cannot fit a forest on zero samples"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..params.n_estimators).map(|_| rng.gen()).collect();
        let tree_params = params.tree_params();

        let trees = seeds
            .par_iter()
            .map(|&tree_seed| {
                let mut rng = StdRng::seed_from_u64(tree_seed);
                let sample: Vec<usize> = if params.bootstrap {
                    (0..rows.len()).map(|_| rows[rng.gen_range(0..rows.len())]).collect()
                } else {
                    rows.to_vec()
                };
                DecisionTree::fit(tree_params, x, y, &sample, &mut rng)
            })
            .collect::<Result<Vec<DecisionTree>>>()?;

        let n_features = x.ncols();
        let mut importances = vec![0.0; n_features];
        for tree in &trees {
            for (acc, v) in importances.iter_mut().zip(tree.feature_importances()) {
                *acc += v;
            }
        }
        normalize(&mut importances);

        Ok(Self {
            params,
            trees,
            n_features,
            importances,
        })
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Mean impurity-decrease importance per column; sums to 1 unless every tree is a leaf.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }
}

impl Predictor for Forest {
    /// Share of trees voting for class 1.
    fn predict_proba(&self, row: ArrayView1<'_, f64>) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.predict_proba(row)).sum();
        sum / self.trees.len() as f64
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba_rows(&self, x: ArrayView2<'_, f64>, rows: &[usize]) -> Vec<f64> {
        let mut votes = vec![0usize; rows.len()];
        for tree in &self.trees {
            let classes = tree.classes(x, rows);
            for (acc, &class) in votes.iter_mut().zip(classes.iter()) {
                *acc += class;
            }
        }
        let n = self.trees.len() as f64;
        votes.into_iter().map(|v| v as f64 / n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Column 0 decides the label, column 1 is noise, column 2 is constant.
    fn separable(n: usize) -> (Array2<f64>, Vec<u8>) {
        let mut rng = StdRng::seed_from_u64(1);
        let mut x = Array2::zeros((n, 3));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let label = (i % 2) as u8;
            x[[i, 0]] = if label == 1 { rng.gen_range(9.0..10.0) } else { rng.gen_range(0.0..1.0) };
            x[[i, 1]] = rng.gen_range(0.0..1.0);
            x[[i, 2]] = 3.0;
            y.push(label);
        }
        (x, y)
    }

    #[test]
    fn random_forest_learns_separable_data() {
        let (x, y) = separable(60);
        let rows: Vec<usize> = (0..60).collect();
        let params = ForestParams {
            n_estimators: 15,
            max_features: MaxFeatures::All,
            ..ForestParams::random_forest()
        };
        let forest = Forest::fit(params, x.view(), &y, &rows, 3).unwrap();
        assert_eq!(forest.n_trees(), 15);
        assert_eq!(forest.predict_rows(x.view(), &rows), y);
        assert_eq!(forest.predict(x.row(1)), 1);
    }

    #[test]
    fn constant_columns_get_zero_importance() {
        let (x, y) = separable(80);
        let rows: Vec<usize> = (0..80).collect();
        let params = ForestParams {
            n_estimators: 20,
            max_features: MaxFeatures::All,
            ..ForestParams::random_forest()
        };
        let forest = Forest::fit(params, x.view(), &y, &rows, 11).unwrap();
        let imp = forest.feature_importances();
        assert_eq!(imp[2], 0.0);
        assert!(imp[0] > imp[1]);
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn extra_trees_use_every_row() {
        let (x, y) = separable(40);
        let rows: Vec<usize> = (0..40).collect();
        let params = ForestParams { n_estimators: 30, ..ForestParams::extra_trees() };
        let forest = Forest::fit(params, x.view(), &y, &rows, 5).unwrap();
        // every tree sees one of the three columns; only the constant one never splits
        assert_eq!(forest.feature_importances()[2], 0.0);
        assert!(forest.feature_importances()[0] > 0.0);
    }

    #[test]
    fn same_seed_same_forest() {
        let (x, y) = separable(40);
        let rows: Vec<usize> = (0..40).collect();
        let params = ForestParams { n_estimators: 8, ..ForestParams::random_forest() };
        let a = Forest::fit(params, x.view(), &y, &rows, 99).unwrap();
        let b = Forest::fit(params, x.view(), &y, &rows, 99).unwrap();
        assert_eq!(a.feature_importances(), b.feature_importances());
        assert_eq!(a.predict_proba_rows(x.view(), &rows), b.predict_proba_rows(x.view(), &rows));
    }

    #[test]
    fn zero_estimators_is_a_configuration_error() {
        let (x, y) = separable(10);
        let params = ForestParams { n_estimators: 0, ..ForestParams::random_forest() };
        let err = Forest::fit(params, x.view(), &y, &[0, 1], 0).unwrap_err();
        assert!(matches!(err, ScanError::Configuration { .. }));
    }
}
