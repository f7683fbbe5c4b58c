//! Learned impact model
//!
//! A bagged ensemble of CART trees (gini impurity, random feature subsets)
//! over standardized features. Training is deterministic for a given seed;
//! the fitted model is an immutable value that serializes to JSON.

use super::features::{FeatureVector, FEATURE_COUNT};
use super::DetectionError;
use serde::{Deserialize, Serialize};

/// Ensemble parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Features tried per split; None = sqrt(feature count)
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 50,
            max_depth: 8,
            min_samples_split: 2,
            max_features: None,
            seed: 42,
        }
    }
}

impl ForestParams {
    fn features_per_split(&self) -> usize {
        self.max_features
            .unwrap_or_else(|| (FEATURE_COUNT as f64).sqrt().round() as usize)
            .clamp(1, FEATURE_COUNT)
    }
}

/// xorshift64* generator; small and reproducible across platforms
#[derive(Debug, Clone)]
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift
        Self(seed ^ 0x9E37_79B9_7F4A_7C15)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// `k` distinct indices from `0..n`
    fn choose(&mut self, n: usize, k: usize) -> Vec<usize> {
        let mut pool: Vec<usize> = (0..n).collect();
        for i in 0..k.min(n) {
            let j = i + self.below(n - i);
            pool.swap(i, j);
        }
        pool.truncate(k.min(n));
        pool
    }
}

/// Per-feature standardization fitted on the training set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: [f32; FEATURE_COUNT],
    pub scale: [f32; FEATURE_COUNT],
}

impl StandardScaler {
    pub fn fit(rows: &[[f32; FEATURE_COUNT]]) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = [0.0f32; FEATURE_COUNT];
        let mut scale = [1.0f32; FEATURE_COUNT];
        for j in 0..FEATURE_COUNT {
            let m = rows.iter().map(|r| r[j] as f64).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[j] as f64 - m).powi(2)).sum::<f64>() / n;
            mean[j] = m as f32;
            let std = var.sqrt();
            scale[j] = if std > 1e-12 { std as f32 } else { 1.0 };
        }
        Self { mean, scale }
    }

    pub fn transform(&self, row: &[f32; FEATURE_COUNT]) -> [f32; FEATURE_COUNT] {
        let mut out = [0.0f32; FEATURE_COUNT];
        for j in 0..FEATURE_COUNT {
            out[j] = (row[j] - self.mean[j]) / self.scale[j];
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum Node {
    Leaf {
        /// Fraction of positive samples that reached this leaf
        positive: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

/// One decision tree stored as a flat node arena, root at index 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    pub fn predict(&self, row: &[f32; FEATURE_COUNT]) -> f32 {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(Node::Leaf { positive }) => return *positive,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            match nodes.get(index) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    fn fit(
        rows: &[[f32; FEATURE_COUNT]],
        labels: &[bool],
        indices: Vec<usize>,
        params: &ForestParams,
        rng: &mut Rng,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(rows, labels, indices, 0, params, rng);
        tree
    }

    fn grow(
        &mut self,
        rows: &[[f32; FEATURE_COUNT]],
        labels: &[bool],
        indices: Vec<usize>,
        depth: usize,
        params: &ForestParams,
        rng: &mut Rng,
    ) -> usize {
        let id = self.nodes.len();
        let positives = indices.iter().filter(|&&i| labels[i]).count();
        let positive = positives as f32 / indices.len().max(1) as f32;
        self.nodes.push(Node::Leaf { positive });

        let pure = positives == 0 || positives == indices.len();
        if pure || depth >= params.max_depth || indices.len() < params.min_samples_split.max(2) {
            return id;
        }

        let Some((feature, threshold)) = best_split(rows, labels, &indices, params, rng) else {
            return id;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| rows[i][feature] <= threshold);

        let left = self.grow(rows, labels, left_idx, depth + 1, params, rng);
        let right = self.grow(rows, labels, right_idx, depth + 1, params, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }
}

fn gini(positives: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = positives as f64 / total as f64;
    2.0 * p * (1.0 - p)
}

/// Lowest weighted-gini split among a random feature subset
fn best_split(
    rows: &[[f32; FEATURE_COUNT]],
    labels: &[bool],
    indices: &[usize],
    params: &ForestParams,
    rng: &mut Rng,
) -> Option<(usize, f32)> {
    let total = indices.len();
    let total_pos = indices.iter().filter(|&&i| labels[i]).count();
    let parent = gini(total_pos, total);

    let mut best: Option<(f64, usize, f32)> = None;
    for feature in rng.choose(FEATURE_COUNT, params.features_per_split()) {
        let mut sorted: Vec<(f32, bool)> = indices.iter().map(|&i| (rows[i][feature], labels[i])).collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_pos = 0;
        for k in 1..total {
            if sorted[k - 1].1 {
                left_pos += 1;
            }
            let (lo, hi) = (sorted[k - 1].0, sorted[k].0);
            if lo == hi {
                continue;
            }
            let left_n = k;
            let right_n = total - k;
            let impurity = (left_n as f64 * gini(left_pos, left_n)
                + right_n as f64 * gini(total_pos - left_pos, right_n))
                / total as f64;
            if impurity < parent && best.map_or(true, |(b, _, _)| impurity < b) {
                best = Some((impurity, feature, lo + (hi - lo) / 2.0));
            }
        }
    }
    best.map(|(_, feature, threshold)| (feature, threshold))
}

/// Bagged tree ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Fit on already standardized rows
    pub fn fit(rows: &[[f32; FEATURE_COUNT]], labels: &[bool], params: &ForestParams) -> Self {
        let mut rng = Rng::new(params.seed);
        let n = rows.len();
        let trees = (0..params.n_trees.max(1))
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.below(n)).collect();
                DecisionTree::fit(rows, labels, bootstrap, params, &mut rng)
            })
            .collect();
        Self { trees }
    }

    /// Mean positive fraction over all trees
    pub fn predict(&self, row: &[f32; FEATURE_COUNT]) -> f32 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.trees.iter().map(|t| t.predict(row)).sum();
        sum / self.trees.len() as f32
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(|t| t.depth()).max().unwrap_or(0)
    }
}

/// Scaler plus forest, swapped into the classifier as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedModel {
    pub scaler: StandardScaler,
    pub forest: RandomForest,
    pub n_samples: usize,
    pub n_positive: usize,
    pub trained_at: chrono::DateTime<chrono::Utc>,
}

impl LearnedModel {
    /// Train on labeled feature vectors. Needs both labels present.
    pub fn train(samples: &[(FeatureVector, bool)], params: &ForestParams) -> Result<Self, DetectionError> {
        let n_positive = samples.iter().filter(|(_, l)| *l).count();
        if n_positive == 0 || n_positive == samples.len() {
            return Err(DetectionError::SingleClass);
        }

        let raw: Vec<[f32; FEATURE_COUNT]> = samples.iter().map(|(f, _)| f.to_array()).collect();
        if raw.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DetectionError::Model("non-finite feature value".to_string()));
        }
        let labels: Vec<bool> = samples.iter().map(|(_, l)| *l).collect();

        let scaler = StandardScaler::fit(&raw);
        let rows: Vec<[f32; FEATURE_COUNT]> = raw.iter().map(|r| scaler.transform(r)).collect();
        let forest = RandomForest::fit(&rows, &labels, params);

        Ok(Self {
            scaler,
            forest,
            n_samples: samples.len(),
            n_positive,
            trained_at: chrono::Utc::now(),
        })
    }

    /// Probability-like confidence that the features are an impact
    pub fn confidence(&self, features: &FeatureVector) -> f32 {
        let row = features.to_array();
        if row.iter().any(|v| !v.is_finite()) {
            return 0.0;
        }
        self.forest.predict(&self.scaler.transform(&row)).clamp(0.0, 1.0)
    }
}
