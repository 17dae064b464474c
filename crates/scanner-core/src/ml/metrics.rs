//! Classification metrics. Accuracy and ROC AUC come from `linfa`; the
//! fixed 2x2 counts are kept here so the report can serialise them.

use linfa::dataset::Pr;
use linfa::prelude::*;
use ndarray::Array1;
use serde::Serialize;

pub fn accuracy(truth: &[u8], predicted: &[u8]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let truth: Array1<usize> = truth.iter().map(|&t| usize::from(t)).collect();
    let predicted: Array1<usize> = predicted.iter().map(|&p| usize::from(p)).collect();
    predicted
        .view()
        .confusion_matrix(truth.view())
        .map_or(0.0, |cm| f64::from(cm.accuracy()))
}

/// Area under the ROC curve for class 1. Tied scores share one curve point.
/// `None` when either class is absent from `truth`.
pub fn roc_auc(truth: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = truth.iter().filter(|&&t| t == 1).count();
    if positives == 0 || positives == truth.len() {
        return None;
    }
    // a single threshold gives a one-point curve with no area
    if scores.iter().all(|&s| s == scores[0]) {
        return Some(0.5);
    }

    let probabilities: Array1<Pr> = scores.iter().map(|&s| Pr::new(s.clamp(0.0, 1.0) as f32)).collect();
    let truth: Vec<bool> = truth.iter().map(|&t| t == 1).collect();
    let roc = probabilities.roc(truth.as_slice()).ok()?;
    Some(f64::from(roc.area_under_curve()))
}

/// 2x2 confusion matrix indexed `[truth][predicted]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub counts: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[u8], predicted: &[u8]) -> Self {
        let mut counts = [[0usize; 2]; 2];
        for (&t, &p) in truth.iter().zip(predicted) {
            counts[t.min(1) as usize][p.min(1) as usize] += 1;
        }
        Self { counts }
    }

    /// Share of class-0 samples predicted as class 1.
    pub fn class0_miss_rate(&self) -> f64 {
        ratio(self.counts[0][1], self.counts[0][0] + self.counts[0][1])
    }

    /// Share of class-1 samples predicted as class 0.
    pub fn class1_miss_rate(&self) -> f64 {
        ratio(self.counts[1][0], self.counts[1][0] + self.counts[1][1])
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
