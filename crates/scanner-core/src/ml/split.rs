//! Label-stratified train/test and k-fold partitions.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Row indices of one partition, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn rows_by_class(labels: &[u8], rows: impl Iterator<Item = usize>) -> [Vec<usize>; 2] {
    let mut classes = [Vec::new(), Vec::new()];
    for i in rows {
        classes[labels[i].min(1) as usize].push(i);
    }
    classes
}

/// Shuffle each class with `seed` and hold out `round(n_c * test_fraction)`
/// of it, keeping at least one row of every class on each side.
/// Every class present must have at least two rows.
pub fn stratified_split(labels: &[u8], test_fraction: f64, seed: u64) -> Partition {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for mut class in rows_by_class(labels, 0..labels.len()) {
        if class.is_empty() {
            continue;
        }
        class.shuffle(&mut rng);
        let n = class.len();
        let held = ((n as f64 * test_fraction).round() as usize).clamp(1, n.saturating_sub(1).max(1));
        test.extend_from_slice(&class[..held]);
        train.extend_from_slice(&class[held..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    Partition { train, test }
}

/// Deal each class of `rows` round-robin over `k` folds, in row order.
pub fn stratified_kfold(labels: &[u8], rows: &[usize], k: usize) -> Vec<Partition> {
    let mut seen = [0usize; 2];
    let fold_of: Vec<usize> = rows
        .iter()
        .map(|&row| {
            let class = labels[row].min(1) as usize;
            let fold = seen[class] % k;
            seen[class] += 1;
            fold
        })
        .collect();

    (0..k)
        .map(|fold| {
            let mut partition = Partition { train: Vec::new(), test: Vec::new() };
            for (&row, &f) in rows.iter().zip(&fold_of) {
                if f == fold {
                    partition.test.push(row);
                } else {
                    partition.train.push(row);
                }
            }
            partition
        })
        .collect()
}
