//! Labeled training corpus: a delimited text table with one row per sample.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ScanError};

/// Corpus label: 1 = legitimate, 0 = malicious.
pub const LABEL_MALICIOUS: u8 = 0;
pub const LABEL_LEGITIMATE: u8 = 1;

/// Which columns of the table carry the label and the sample identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetSchema {
    pub separator: char,
    pub label_column: String,
    /// Dropped from the feature set when present.
    pub id_columns: Vec<String>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            separator: '|',
            label_column: "legitimate".to_string(),
            id_columns: vec!["Name".to_string(), "md5".to_string()],
        }
    }
}

/// Identity columns of one sample, in `id_columns` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleKey(pub Vec<String>);

/// Immutable feature matrix plus labels. Rows are samples, columns follow `feature_names`.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub labels: Vec<u8>,
    pub keys: Vec<SampleKey>,
}

impl Dataset {
    pub fn from_parts(feature_names: Vec<String>, features: Array2<f64>, labels: Vec<u8>) -> Result<Self> {
        if features.ncols() != feature_names.len() {
            return Err(ScanError::configuration(format!(
                "{} feature names for {} columns",
                feature_names.len(),
                features.ncols()
            )));
        }
        if features.nrows() != labels.len() {
            return Err(ScanError::configuration(format!(
                "{} labels for {} rows",
                labels.len(),
                features.nrows()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l > LABEL_LEGITIMATE) {
            return Err(ScanError::configuration(format!("label {bad} is not 0 or 1")));
        }
        if let Some(((row, col), v)) = features.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(ScanError::configuration(format!(
                "row {row}: column `{}` has non-finite value {v}",
                feature_names[col]
            )));
        }
        let keys = (0..labels.len()).map(|i| SampleKey(vec![i.to_string()])).collect();
        Ok(Self { feature_names, features, labels, keys })
    }

    pub fn load(path: &Path, schema: &DatasetSchema) -> Result<Self> {
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(ScanError::configuration(format!("{} is empty", path.display()))),
        };
        let columns: Vec<String> = header
            .trim_end_matches('\r')
            .split(schema.separator)
            .map(|c| c.trim().to_string())
            .collect();

        let label_at = columns
            .iter()
            .position(|c| *c == schema.label_column)
            .ok_or_else(|| {
                ScanError::configuration(format!("label column `{}` not found", schema.label_column))
            })?;
        let id_at: Vec<usize> = schema
            .id_columns
            .iter()
            .filter_map(|id| columns.iter().position(|c| c == id))
            .collect();
        let feature_at: Vec<usize> = (0..columns.len())
            .filter(|i| *i != label_at && !id_at.contains(i))
            .collect();
        let feature_names = feature_at.iter().map(|&i| columns[i].clone()).collect();

        let mut values = Vec::new();
        let mut labels = Vec::new();
        let mut keys = Vec::new();
        for (row, line) in lines.enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let line_no = row + 2;
            let fields: Vec<&str> = line.split(schema.separator).collect();
            if fields.len() != columns.len() {
                return Err(ScanError::configuration(format!(
                    "line {line_no}: expected {} columns, found {}",
                    columns.len(),
                    fields.len()
                )));
            }

            let label = parse_number(fields[label_at], line_no, &schema.label_column)?;
            labels.push(match label {
                l if l == LABEL_MALICIOUS as f64 => LABEL_MALICIOUS,
                l if l == LABEL_LEGITIMATE as f64 => LABEL_LEGITIMATE,
                other => {
                    return Err(ScanError::configuration(format!(
                        "line {line_no}: label {other} is not 0 or 1"
                    )))
                }
            });
            for &i in &feature_at {
                values.push(parse_number(fields[i], line_no, &columns[i])?);
            }
            keys.push(SampleKey(id_at.iter().map(|&i| fields[i].to_string()).collect()));
        }

        let features = Array2::from_shape_vec((labels.len(), feature_at.len()), values)
            .map_err(|e| ScanError::configuration(e.to_string()))?;
        info!(
            path = %path.display(),
            samples = labels.len(),
            features = feature_at.len(),
            "loaded training dataset"
        );
        Ok(Self { feature_names, features, labels, keys })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// (malicious, legitimate) sample counts.
    pub fn class_counts(&self) -> (usize, usize) {
        let legit = self.labels.iter().filter(|&&l| l == LABEL_LEGITIMATE).count();
        (self.labels.len() - legit, legit)
    }

    /// Matrix restricted to the given column indices, in that order.
    pub fn select_columns(&self, columns: &[usize]) -> Array2<f64> {
        self.features.select(Axis(1), columns)
    }
}

/// Finite numbers only; `inf` and `NaN` parse as floats but cannot be split on.
fn parse_number(field: &str, line: usize, column: &str) -> Result<f64> {
    match field.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ScanError::configuration(format!(
            "line {line}: column `{column}` has non-numeric value `{field}`"
        ))),
    }
}
