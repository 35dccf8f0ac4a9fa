use serde_json::json;

use crate::feature::{Feature, FeatureSet, FeatureVec};
use crate::rng::Rng;
use crate::util;

/// One retained input together with what its execution taught us.
#[derive(Debug, Clone)]
pub struct CorpusRecord {
    pub data: Vec<u8>,
    pub features: FeatureVec,
    /// Raw CMP pair stream captured when this input ran. Not persisted in
    /// shard files; empty after a reload until the input runs again.
    pub cmp_args: Vec<u8>,
}

/// The set of functions that are close to, but not yet, fully covered.
///
/// Computed externally from symbolization data; the corpus only needs
/// membership queries to boost weights and shield records from pruning.
pub trait CoverageFrontier {
    /// Recomputes the frontier from the current corpus.
    fn compute(&mut self, corpus: &Corpus);

    /// True iff `feature` belongs to a frontier function.
    fn is_in_frontier(&self, feature: Feature) -> bool;

    /// Number of functions currently in the frontier (stats only).
    fn num_functions_in_frontier(&self) -> usize;
}

/// Frontier that is always empty; used when `use_coverage_frontier` is
/// off or no symbolization is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCoverageFrontier;

impl CoverageFrontier for NullCoverageFrontier {
    fn compute(&mut self, _corpus: &Corpus) {}

    fn is_in_frontier(&self, _feature: Feature) -> bool {
        false
    }

    fn num_functions_in_frontier(&self) -> usize {
        0
    }
}

/// Cumulative-weight table supporting O(log n) weighted index draws.
#[derive(Debug, Default)]
struct WeightedDistribution {
    weights: Vec<u64>,
    cumulative: Vec<u64>,
    cumulative_valid: bool,
}

impl WeightedDistribution {
    fn add_weight(&mut self, weight: u64) {
        self.weights.push(weight);
        let total = self.cumulative.last().copied().unwrap_or(0);
        self.cumulative.push(total + weight);
    }

    fn change_weight(&mut self, idx: usize, weight: u64) {
        if self.weights[idx] != weight {
            self.weights[idx] = weight;
            self.cumulative_valid = false;
        }
    }

    fn recompute(&mut self) {
        let mut total = 0;
        for (idx, &weight) in self.weights.iter().enumerate() {
            total += weight;
            self.cumulative[idx] = total;
        }
        self.cumulative_valid = true;
    }

    fn remove_subset(&mut self, sorted_indices: &[usize]) {
        util::remove_subset(sorted_indices, &mut self.weights);
        self.cumulative.truncate(self.weights.len());
        self.cumulative_valid = false;
    }

    fn weights(&self) -> &[u64] {
        &self.weights
    }

    /// Draws an index with probability proportional to its weight;
    /// uniform when the total weight is zero.
    fn random_index(&self, random: u64) -> usize {
        debug_assert!(self.cumulative_valid);
        debug_assert!(!self.weights.is_empty());
        let total = *self.cumulative.last().unwrap();
        if total == 0 {
            return (random % self.weights.len() as u64) as usize;
        }
        let target = random % total;
        self.cumulative.partition_point(|&c| c <= target)
    }
}

/// The evolving collection of interesting inputs of one shard.
///
/// Every retained record had at least one unseen feature when it was
/// admitted; the caller establishes that via
/// [`FeatureSet::count_unseen_and_prune_frequent`] before calling
/// [`Corpus::add`].
#[derive(Debug, Default)]
pub struct Corpus {
    records: Vec<CorpusRecord>,
    weighted: WeightedDistribution,
    num_pruned: usize,
}

/// Weight of one record: the rarity of its rarest feature, boosted when
/// the record touches the coverage frontier. Records whose features have
/// all gone frequent weigh zero and are the first to be pruned.
fn compute_weight(
    features: &FeatureVec,
    fs: &FeatureSet,
    frontier: &dyn CoverageFrontier,
) -> u64 {
    let threshold = u64::from(fs.frequency_threshold());
    let mut weight = 0;
    let mut in_frontier = false;
    for &feature in features {
        let frequency = u64::from(fs.frequency(feature));
        weight = weight.max(threshold.saturating_sub(frequency));
        in_frontier = in_frontier || frontier.is_in_frontier(feature);
    }
    if in_frontier {
        weight *= 256;
    }
    weight
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record. `features` must be the already-pruned vector the
    /// admission check ran on.
    pub fn add(
        &mut self,
        data: Vec<u8>,
        features: FeatureVec,
        cmp_args: Vec<u8>,
        fs: &FeatureSet,
        frontier: &dyn CoverageFrontier,
    ) {
        debug_assert!(!data.is_empty());
        let weight = compute_weight(&features, fs, frontier);
        self.weighted.add_weight(weight);
        self.records.push(CorpusRecord {
            data,
            features,
            cmp_args,
        });
    }

    pub fn num_active(&self) -> usize {
        self.records.len()
    }

    /// Active records plus everything pruned over the lifetime of the
    /// shard.
    pub fn num_total(&self) -> usize {
        self.records.len() + self.num_pruned
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        &self.records[idx].data
    }

    pub fn records(&self) -> &[CorpusRecord] {
        &self.records
    }

    /// Uniformly random record.
    ///
    /// # Panics
    /// Panics if the corpus is empty; the loop seeds a dummy input first.
    pub fn uniform_random(&self, rng: &mut Rng) -> &CorpusRecord {
        &self.records[rng.below(self.records.len() as u64) as usize]
    }

    /// Weight-proportional random record (rare features win).
    pub fn weighted_random(&mut self, rng: &mut Rng) -> &CorpusRecord {
        if !self.weighted.cumulative_valid {
            self.weighted.recompute();
        }
        &self.records[self.weighted.random_index(rng.next())]
    }

    /// Prunes the corpus down to `max_corpus_size` records, discarding
    /// zero-weight records unconditionally and low-weight records
    /// preferentially. Returns the number of records removed.
    pub fn prune(
        &mut self,
        fs: &FeatureSet,
        frontier: &dyn CoverageFrontier,
        max_corpus_size: usize,
        rng: &mut Rng,
    ) -> usize {
        assert!(max_corpus_size > 0);
        if self.records.len() < 2 {
            return 0;
        }
        for idx in 0..self.records.len() {
            let weight = compute_weight(&self.records[idx].features, fs, frontier);
            self.weighted.change_weight(idx, weight);
        }
        let to_remove =
            util::random_weighted_subset(self.weighted.weights(), max_corpus_size, rng);
        // Never prune the corpus to nothing: mutation needs a seed.
        if to_remove.len() >= self.records.len() {
            return 0;
        }
        util::remove_subset(&to_remove, &mut self.records);
        self.weighted.remove_subset(&to_remove);
        self.weighted.recompute();
        self.num_pruned += to_remove.len();
        to_remove.len()
    }

    /// Largest and average record size in bytes.
    pub fn max_and_avg_size(&self) -> (usize, usize) {
        if self.records.is_empty() {
            return (0, 0);
        }
        let max = self.records.iter().map(|r| r.data.len()).max().unwrap_or(0);
        let total: usize = self.records.iter().map(|r| r.data.len()).sum();
        (max, total / self.records.len())
    }

    /// JSON stats: per-record sizes and feature frequencies, consumed by
    /// the corpus-stats telemetry file.
    pub fn stats_json(&self, fs: &FeatureSet) -> serde_json::Value {
        let records: Vec<serde_json::Value> = self
            .records
            .iter()
            .map(|record| {
                let frequencies: Vec<u64> = record
                    .features
                    .iter()
                    .map(|&f| u64::from(fs.frequency(f)))
                    .collect();
                json!({
                    "size": record.data.len(),
                    "num_features": record.features.len(),
                    "frequencies": frequencies,
                })
            })
            .collect();
        json!({
            "num_active": self.num_active(),
            "num_total": self.num_total(),
            "corpus_stats": records,
        })
    }
}
