//! CART decision tree over binary labels, grown by `linfa-trees` with Gini
//! impurity on a (possibly random) subset of the input columns.

use linfa::prelude::*;
use linfa_trees::{DecisionTree as Cart, SplitQuality};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

use super::{normalize, Predictor};
use crate::error::{Result, ScanError};

/// How many input columns one tree is grown on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxFeatures {
    All,
    Sqrt,
    Fixed(usize),
}

impl MaxFeatures {
    pub fn resolve(self, n_features: usize) -> usize {
        let n = n_features.max(1);
        match self {
            MaxFeatures::All => n,
            MaxFeatures::Sqrt => ((n as f64).sqrt() as usize).max(1),
            MaxFeatures::Fixed(k) => k.clamp(1, n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub max_features: MaxFeatures,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            max_features: MaxFeatures::All,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    params: TreeParams,
    cart: Cart<f64, usize>,
    /// Input columns the tree was grown on, ascending.
    columns: Vec<usize>,
    n_features: usize,
    importances: Vec<f64>,
}

impl DecisionTree {
    /// Fit on the rows listed in `samples`. Repeated indices act as sample
    /// weights. When `max_features` is below the column count, `rng` picks
    /// which columns the tree sees.
    pub fn fit(
        params: TreeParams,
        x: ArrayView2<'_, f64>,
        y: &[u8],
        samples: &[usize],
        rng: &mut StdRng,
    ) -> Result<Self> {
        if samples.is_empty() {
            return Err(ScanError::configuration("cannot fit a tree on zero samples"));
        }
        let n_features = x.ncols();
        let k = params.max_features.resolve(n_features);
        let mut columns = if k < n_features {
            index::sample(rng, n_features, k).into_vec()
        } else {
            (0..n_features).collect()
        };
        columns.sort_unstable();

        let records = x.select(Axis(0), samples).select(Axis(1), &columns);
        let targets: Array1<usize> = samples.iter().map(|&i| usize::from(y[i])).collect();
        let cart = Cart::<f64, usize>::params()
            .split_quality(SplitQuality::Gini)
            .max_depth(params.max_depth)
            .min_weight_split(params.min_samples_split.max(2) as f32)
            .min_weight_leaf(1.0)
            .fit(&Dataset::new(records, targets))
            .map_err(|e| ScanError::Fit(e.to_string()))?;

        // a single-leaf tree reports 0/0 importances
        let mut importances = vec![0.0; n_features];
        for (&column, value) in columns.iter().zip(cart.feature_importance()) {
            if value.is_finite() {
                importances[column] = value;
            }
        }
        normalize(&mut importances);

        Ok(Self {
            params,
            cart,
            columns,
            n_features,
            importances,
        })
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Impurity-decrease importances over all input columns, summing to 1
    /// unless the tree is a single leaf.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    /// Predicted class of each row of `x` listed in `rows`.
    pub fn classes(&self, x: ArrayView2<'_, f64>, rows: &[usize]) -> Array1<usize> {
        if rows.is_empty() {
            return Array1::zeros(0);
        }
        let records = x.select(Axis(0), rows).select(Axis(1), &self.columns);
        self.cart.predict(&records)
    }
}

impl Predictor for DecisionTree {
    fn predict_proba(&self, row: ArrayView1<'_, f64>) -> f64 {
        let record: Array2<f64> = row.select(Axis(0), &self.columns).insert_axis(Axis(0));
        let class = self.cart.predict(&record);
        class.iter().next().map_or(0.0, |&c| c as f64)
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba_rows(&self, x: ArrayView2<'_, f64>, rows: &[usize]) -> Vec<f64> {
        self.classes(x, rows).iter().map(|&c| c as f64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn fit(params: TreeParams, x: &Array2<f64>, y: &[u8]) -> DecisionTree {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<usize> = (0..y.len()).collect();
        DecisionTree::fit(params, x.view(), y, &samples, &mut rng).unwrap()
    }

    #[test]
    fn separates_on_the_informative_feature() {
        let x = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [10.0, 5.0], [11.0, 5.0], [12.0, 5.0]];
        let y = [0, 0, 0, 1, 1, 1];
        let tree = fit(TreeParams::default(), &x, &y);

        let rows: Vec<usize> = (0..6).collect();
        assert_eq!(tree.predict_rows(x.view(), &rows), y);
        assert_eq!(tree.predict(array![9.0, 0.0].view()), 1);
        assert_eq!(tree.predict(array![-3.0, 0.0].view()), 0);
        assert_eq!(tree.feature_importances(), &[1.0, 0.0]);
    }

    #[test]
    fn pure_node_is_a_single_leaf() {
        let x = array![[1.0], [2.0], [3.0]];
        let tree = fit(TreeParams::default(), &x, &[1, 1, 1]);
        assert_eq!(tree.predict_proba(x.row(0)), 1.0);
        assert_eq!(tree.feature_importances(), &[0.0]);
    }

    #[test]
    fn max_depth_limits_growth() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0], [6.0], [7.0]];
        let y = [0, 1, 0, 1, 0, 1, 0, 1];
        let rows: Vec<usize> = (0..8).collect();
        let shallow = fit(TreeParams { max_depth: Some(1), ..TreeParams::default() }, &x, &y);
        assert_ne!(shallow.predict_rows(x.view(), &rows), y);
    }

    #[test]
    fn max_features_restricts_the_columns_seen() {
        let x = array![[0.0, 3.0, 1.0], [1.0, 2.0, 0.0], [9.0, 1.0, 1.0], [10.0, 0.0, 0.0]];
        let y = [0, 0, 1, 1];
        let tree = fit(TreeParams { max_features: MaxFeatures::Fixed(1), ..TreeParams::default() }, &x, &y);
        assert_eq!(tree.columns().len(), 1);
        let used = tree.columns()[0];
        for (c, &v) in tree.feature_importances().iter().enumerate() {
            if c != used {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn max_features_resolution() {
        assert_eq!(MaxFeatures::All.resolve(60), 60);
        assert_eq!(MaxFeatures::Sqrt.resolve(60), 7);
        assert_eq!(MaxFeatures::Fixed(4).resolve(60), 4);
        assert_eq!(MaxFeatures::Fixed(4).resolve(2), 2);
        assert_eq!(MaxFeatures::Sqrt.resolve(1), 1);
    }
}
