//! Outlier detectors over raw readings: the interquartile-range fence on the
//! power column and a seeded isolation forest over every numeric feature.

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::stats::quantile;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Flags values below `Q1 - m*IQR` or above `Q3 + m*IQR`.
pub(crate) fn iqr_outliers(values: &[f64], multiplier: f64) -> Vec<bool> {
    let (Some(q1), Some(q3)) = (quantile(values, 0.25), quantile(values, 0.75)) else {
        return vec![false; values.len()];
    };
    let iqr = q3 - q1;
    let lower = q1 - multiplier * iqr;
    let upper = q3 + multiplier * iqr;
    values.iter().map(|v| *v < lower || *v > upper).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct IsolationForestConfig {
    pub trees: usize,
    pub sample_size: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            contamination: 0.1,
            seed: 42,
        }
    }
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// Flags rows whose isolation score lies above the `1 - contamination` quantile.
pub(crate) fn isolation_forest_outliers(rows: &[Vec<f64>], cfg: &IsolationForestConfig) -> Vec<bool> {
    let n = rows.len();
    if n < 2 || cfg.trees == 0 {
        return vec![false; n];
    }

    let psi = cfg.sample_size.clamp(2, n);
    let max_depth = (psi as f64).log2().ceil() as usize;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut all: Vec<usize> = (0..n).collect();

    let forest: Vec<Node> = (0..cfg.trees)
        .map(|_| {
            all.shuffle(&mut rng);
            let sample = all[..psi].to_vec();
            build_tree(rows, sample, 0, max_depth, &mut rng)
        })
        .collect();

    let norm = average_path_length(psi);
    let scores: Vec<f64> = rows
        .iter()
        .map(|row| {
            let mean_path = forest
                .iter()
                .map(|tree| path_length(row, tree, 0))
                .sum::<f64>()
                / forest.len() as f64;
            if norm > 0.0 {
                2f64.powf(-mean_path / norm)
            } else {
                0.5
            }
        })
        .collect();

    let Some(threshold) = quantile(&scores, 1.0 - cfg.contamination) else {
        return vec![false; n];
    };
    scores.iter().map(|s| *s > threshold).collect()
}

fn build_tree(
    rows: &[Vec<f64>],
    indices: Vec<usize>,
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if indices.len() <= 1 || depth >= max_depth {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let width = rows[indices[0]].len();
    let candidates: Vec<(usize, f64, f64)> = (0..width)
        .filter_map(|feature| {
            let (min, max) = indices.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), idx| {
                    let v = rows[*idx][feature];
                    (lo.min(v), hi.max(v))
                },
            );
            (min < max).then_some((feature, min, max))
        })
        .collect();

    if candidates.is_empty() {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let (feature, min, max) = candidates[rng.random_range(0..candidates.len())];
    let threshold = min + rng.random::<f64>() * (max - min);
    let (left, right): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .partition(|idx| rows[**idx][feature] < threshold);

    if left.is_empty() || right.is_empty() {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(rows, left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(rows, right, depth + 1, max_depth, rng)),
    }
}

fn path_length(row: &[f64], node: &Node, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if row[*feature] < *threshold {
                path_length(row, left, depth + 1)
            } else {
                path_length(row, right, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
