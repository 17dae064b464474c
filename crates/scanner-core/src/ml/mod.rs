//! Tree-ensemble learners, evaluation metrics and model selection.
//!
//! Single trees are grown by `linfa-trees`; bagging, column subsampling and
//! vote averaging are layered on top here.

pub mod forest;
pub mod metrics;
pub mod search;
pub mod split;
pub mod tree;

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

pub use forest::{Forest, ForestParams};
pub use tree::{DecisionTree, MaxFeatures, TreeParams};

/// A fitted binary classifier. Class 1 is the positive class.
pub trait Predictor: Send + Sync {
    /// Probability that `row` belongs to class 1.
    fn predict_proba(&self, row: ArrayView1<'_, f64>) -> f64;

    fn n_features(&self) -> usize;

    fn predict(&self, row: ArrayView1<'_, f64>) -> u8 {
        u8::from(self.predict_proba(row) > 0.5)
    }

    fn predict_rows(&self, x: ArrayView2<'_, f64>, rows: &[usize]) -> Vec<u8> {
        self.predict_proba_rows(x, rows)
            .into_iter()
            .map(|p| u8::from(p > 0.5))
            .collect()
    }

    fn predict_proba_rows(&self, x: ArrayView2<'_, f64>, rows: &[usize]) -> Vec<f64> {
        rows.iter().map(|&i| self.predict_proba(x.row(i))).collect()
    }
}

/// Estimator family and hyperparameters of one candidate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    DecisionTree(TreeParams),
    RandomForest(ForestParams),
}

impl ModelSpec {
    /// Fit on `rows` of `x`.
    pub fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: &[u8],
        rows: &[usize],
        seed: u64,
    ) -> crate::Result<Box<dyn Predictor>> {
        use rand::SeedableRng;

        let model: Box<dyn Predictor> = match self {
            ModelSpec::DecisionTree(params) => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                Box::new(DecisionTree::fit(*params, x, y, rows, &mut rng)?)
            }
            ModelSpec::RandomForest(params) => Box::new(Forest::fit(*params, x, y, rows, seed)?),
        };
        Ok(model)
    }
}

/// Scale `values` to sum to 1; all-zero input is left as is.
pub(crate) fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|v| *v /= total);
    }
}
