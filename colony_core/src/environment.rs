use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::util;

fn default_seed() -> u64 {
    1
}
fn default_total_shards() -> usize {
    1
}
fn default_num_runs() -> usize {
    1_000_000
}
fn default_batch_size() -> usize {
    1000
}
fn default_mutate_batch_size() -> usize {
    2
}
fn default_use_corpus_weights() -> bool {
    true
}
fn default_feature_frequency_threshold() -> u8 {
    100
}
fn default_prune_frequency() -> usize {
    100
}
fn default_max_corpus_size() -> usize {
    100_000
}
fn default_load_other_shard_frequency() -> usize {
    10
}
fn default_max_num_crash_reports() -> usize {
    5
}
fn default_crossover_level() -> u32 {
    50
}
fn default_fork_server() -> bool {
    true
}
fn default_log_level() -> usize {
    1
}

/// Immutable per-shard configuration, threaded through the whole engine.
///
/// Loadable from TOML (kebab-case keys); every field has a default so a
/// config file only needs to say what differs.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Environment {
    /// PRNG seed; 0 means "pick one from time and pid".
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Shared work directory; all shard files live here.
    #[serde(default)]
    pub workdir: PathBuf,
    /// The fuzz target. Used for naming shard files and passed to the
    /// execution callback.
    #[serde(default)]
    pub binary: String,
    /// Additional binaries to run every batch on; their failures count.
    #[serde(default)]
    pub extra_binaries: Vec<String>,
    #[serde(default = "default_total_shards")]
    pub total_shards: usize,
    #[serde(default)]
    pub my_shard_index: usize,
    /// Total target executions for this shard.
    #[serde(default = "default_num_runs")]
    pub num_runs: usize,
    /// Mutants per execution batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Corpus records drawn per batch to seed the mutator.
    #[serde(default = "default_mutate_batch_size")]
    pub mutate_batch_size: usize,
    /// Probability (0..=100) that a mutant is crossed over with another
    /// input before mutation.
    #[serde(default = "default_crossover_level")]
    pub crossover_level: u32,
    /// Weighted (rarity-driven) vs uniform corpus selection.
    #[serde(default = "default_use_corpus_weights")]
    pub use_corpus_weights: bool,
    /// Frequency at which a feature stops being informative.
    #[serde(default = "default_feature_frequency_threshold")]
    pub feature_frequency_threshold: u8,
    /// Prune after this many new corpus records; 0 disables pruning.
    #[serde(default = "default_prune_frequency")]
    pub prune_frequency: usize,
    #[serde(default = "default_max_corpus_size")]
    pub max_corpus_size: usize,
    #[serde(default)]
    pub use_coverage_frontier: bool,
    /// Synthesize quadratic PC-pair features. Experimental.
    #[serde(default)]
    pub use_pcpair_features: bool,
    /// Load a peer shard every this many batches; 0 disables.
    #[serde(default = "default_load_other_shard_frequency")]
    pub load_other_shard_frequency: usize,
    /// Serialize peer-shard loads within this process (memory pressure).
    #[serde(default)]
    pub serialize_shard_loads: bool,
    /// Load all shards at startup instead of just our own.
    #[serde(default)]
    pub full_sync: bool,
    /// Shards with index below this value write a distilled corpus.
    #[serde(default)]
    pub distill_shards: usize,
    /// If non-empty: a workdir to merge our shard index from at startup.
    #[serde(default)]
    pub merge_from: String,
    /// External input-filter program; empty means no filtering.
    #[serde(default)]
    pub input_filter: String,
    /// Ask the execution callback to keep a fork server alive.
    #[serde(default = "default_fork_server")]
    pub fork_server: bool,
    #[serde(default)]
    pub exit_on_crash: bool,
    #[serde(default = "default_max_num_crash_reports")]
    pub max_num_crash_reports: usize,
    /// Only corpus-admit inputs touching these functions; empty = all.
    #[serde(default)]
    pub function_filter: String,
    /// Binary built with source-based coverage; consumed by external
    /// report tooling.
    #[serde(default)]
    pub clang_coverage_binary: String,
    /// Extra directories that mirror every new corpus input.
    #[serde(default)]
    pub corpus_dir: Vec<PathBuf>,
    #[serde(default)]
    pub experiment_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: usize,
    /// 0: no periodic telemetry; n > 0: every n batches; negative:
    /// power-of-two batches.
    #[serde(default)]
    pub telemetry_frequency: i64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            workdir: PathBuf::new(),
            binary: String::new(),
            extra_binaries: Vec::new(),
            total_shards: default_total_shards(),
            my_shard_index: 0,
            num_runs: default_num_runs(),
            batch_size: default_batch_size(),
            mutate_batch_size: default_mutate_batch_size(),
            crossover_level: default_crossover_level(),
            use_corpus_weights: default_use_corpus_weights(),
            feature_frequency_threshold: default_feature_frequency_threshold(),
            prune_frequency: default_prune_frequency(),
            max_corpus_size: default_max_corpus_size(),
            use_coverage_frontier: false,
            use_pcpair_features: false,
            load_other_shard_frequency: default_load_other_shard_frequency(),
            serialize_shard_loads: false,
            full_sync: false,
            distill_shards: 0,
            merge_from: String::new(),
            input_filter: String::new(),
            fork_server: default_fork_server(),
            exit_on_crash: false,
            max_num_crash_reports: default_max_num_crash_reports(),
            function_filter: String::new(),
            clang_coverage_binary: String::new(),
            corpus_dir: Vec::new(),
            experiment_name: String::new(),
            log_level: default_log_level(),
            telemetry_frequency: 0,
        }
    }
}

impl Environment {
    /// Loads an environment from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {path:?}: {e}"))?;
        let env: Environment = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse TOML config {path:?}: {e}"))?;
        Ok(env)
    }

    /// Hash tying shard files to the target binary: features computed for
    /// one binary are meaningless for another.
    pub fn binary_hash(&self) -> String {
        util::hash(self.binary.as_bytes())
    }

    /// `<workdir>/corpus.<binary-hash>.<shard>`
    pub fn corpus_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join(format!("corpus.{}.{:06}", self.binary_hash(), shard_index))
    }

    /// `<workdir>/features.<binary-hash>.<shard>`
    pub fn features_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join(format!("features.{}.{:06}", self.binary_hash(), shard_index))
    }

    /// `<workdir>/distilled-<binary-hash>.<shard>`
    pub fn distilled_path(&self) -> PathBuf {
        self.workdir.join(format!(
            "distilled-{}.{:06}",
            self.binary_hash(),
            self.my_shard_index
        ))
    }

    /// `<workdir>/crashes`
    pub fn crash_reproducer_dir(&self) -> PathBuf {
        self.workdir.join("crashes")
    }

    /// `<workdir>/coverage-report-<annotation>.txt`
    pub fn coverage_report_path(&self, annotation: &str) -> PathBuf {
        self.workdir.join(format!("coverage-report-{annotation}.txt"))
    }

    /// `<workdir>/corpus-stats-<annotation>.json`
    pub fn corpus_stats_path(&self, annotation: &str) -> PathBuf {
        self.workdir.join(format!("corpus-stats-{annotation}.json"))
    }

    /// True iff this shard writes a distilled corpus this run.
    pub fn distilling_in_this_shard(&self) -> bool {
        self.my_shard_index < self.distill_shards
    }

    /// Telemetry cadence; see `telemetry_frequency`.
    pub fn dump_telemetry_for_this_batch(&self, batch_index: usize) -> bool {
        match self.telemetry_frequency {
            0 => false,
            n if n > 0 => batch_index % (n as usize) == 0,
            _ => batch_index.wrapping_sub(1) & batch_index == 0,
        }
    }
}
