use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::blob::{read_blob_file, BlobFileAppender, BlobFrameIter};
use crate::corpus::{Corpus, CoverageFrontier, NullCoverageFrontier};
use crate::environment::Environment;
use crate::executor::{BatchResult, Executor};
use crate::feature::{domains, feature_to_pc_index, pc_pair_feature, FeatureSet, FeatureVec};
use crate::knobs::Knobs;
use crate::mutator::ByteArrayMutator;
use crate::remote_file::{FileSystem, LocalFileSystem, OpenMode};
use crate::rng::Rng;
use crate::shard_reader::read_shard;
use crate::util;

/// Errors that abort a shard.
///
/// Soft failures (peer loads, telemetry, infeasible mutations) never
/// surface here; a shard dies only on bad configuration or on a failed
/// write to its own shard files, without which its work would be lost.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shard file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// External filter deciding whether a new-coverage input may enter the
/// corpus. Typically a subprocess runner; the engine only sees pass/fail.
pub trait InputFilter: Send {
    fn passes(&mut self, input: &[u8]) -> bool;
}

/// External function filter: true iff a feature vector touches the
/// functions the campaign is focused on. Needs symbolization, so it
/// lives behind a seam.
pub trait FunctionFilter: Send {
    fn filter(&self, features: &FeatureVec) -> bool;
}

/// Peer chosen when syncing: never ourselves, uniform over the rest.
fn peer_shard_index(my_shard_index: usize, total_shards: usize, random: u64) -> usize {
    debug_assert!(total_shards > 1);
    let offset = 1 + (random % (total_shards as u64 - 1)) as usize;
    (my_shard_index + offset) % total_shards
}

/// One shard of the fuzzing colony.
///
/// Owns the corpus, the feature frequency table, the mutator, and this
/// shard's append-only files; absorbs peers by reading theirs.
pub struct Engine {
    env: Environment,
    callbacks: Box<dyn Executor>,
    filesystem: Arc<dyn FileSystem>,
    feature_set: FeatureSet,
    corpus: Corpus,
    frontier: Box<dyn CoverageFrontier>,
    mutator: ByteArrayMutator,
    rng: Rng,
    input_filter: Option<Box<dyn InputFilter>>,
    function_filter: Option<Box<dyn FunctionFilter>>,
    num_pcs: usize,
    num_runs: usize,
    num_crash_reports: usize,
    fuzz_start: Instant,
}

impl Engine {
    /// Creates an engine over the local filesystem.
    pub fn new(env: Environment, callbacks: Box<dyn Executor>) -> Result<Self, EngineError> {
        Self::with_filesystem(env, callbacks, Arc::new(LocalFileSystem))
    }

    /// Creates an engine over an arbitrary filesystem driver.
    /// Fails fast on inconsistent configuration.
    pub fn with_filesystem(
        mut env: Environment,
        callbacks: Box<dyn Executor>,
        filesystem: Arc<dyn FileSystem>,
    ) -> Result<Self, EngineError> {
        if env.workdir.as_os_str().is_empty() {
            return Err(EngineError::Config("workdir must be set".into()));
        }
        if env.total_shards == 0 || env.my_shard_index >= env.total_shards {
            return Err(EngineError::Config(format!(
                "shard index {} out of range for {} shards",
                env.my_shard_index, env.total_shards
            )));
        }
        if env.batch_size == 0 || env.mutate_batch_size == 0 {
            return Err(EngineError::Config("batch sizes must be positive".into()));
        }
        if env.crossover_level > 100 {
            return Err(EngineError::Config(format!(
                "crossover_level {} not in 0..=100",
                env.crossover_level
            )));
        }
        if env.feature_frequency_threshold == 0 {
            return Err(EngineError::Config(
                "feature_frequency_threshold must be positive".into(),
            ));
        }
        env.seed = util::get_random_seed(env.seed);
        filesystem.mkdir(&env.workdir)?;

        // Give the mutator its own stream, derived from but distinct
        // from the loop's.
        let mutator_seed = env.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let num_pcs = callbacks.num_pcs();
        Ok(Self {
            feature_set: FeatureSet::new(env.feature_frequency_threshold),
            corpus: Corpus::new(),
            frontier: Box::new(NullCoverageFrontier),
            mutator: ByteArrayMutator::new(Knobs::uniform(), mutator_seed),
            rng: Rng::new(env.seed),
            input_filter: None,
            function_filter: None,
            num_pcs,
            num_runs: 0,
            num_crash_reports: 0,
            fuzz_start: Instant::now(),
            env,
            callbacks,
            filesystem,
        })
    }

    pub fn set_coverage_frontier(&mut self, frontier: Box<dyn CoverageFrontier>) {
        self.frontier = frontier;
    }

    pub fn set_input_filter(&mut self, filter: Box<dyn InputFilter>) {
        self.input_filter = Some(filter);
    }

    pub fn set_function_filter(&mut self, filter: Box<dyn FunctionFilter>) {
        self.function_filter = Some(filter);
    }

    /// The mutator, for dictionary loading and size constraints.
    pub fn mutator_mut(&mut self) -> &mut ByteArrayMutator {
        &mut self.mutator
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.feature_set
    }

    /// Runs the shard until `num_runs` executions have happened or an
    /// early exit is requested. Always finalizes with an "end-fuzz"
    /// stat line.
    pub fn fuzzing_loop(&mut self) -> Result<(), EngineError> {
        info!(
            shard = self.env.my_shard_index,
            total_shards = self.env.total_shards,
            seed = self.env.seed,
            binary = %self.env.binary,
            "shard starting"
        );

        // Warm up the execution subsystem with one known-good input.
        {
            let binary = self.env.binary.clone();
            let dummy = self.callbacks.dummy_valid_input();
            let mut warmup = BatchResult::default();
            self.callbacks.execute(&binary, &[dummy], &mut warmup);
        }

        self.update_and_maybe_log_stats("begin-fuzz", 0);

        let env = self.env.clone();
        if env.full_sync || env.distilling_in_this_shard() {
            let mut shards: Vec<usize> = (0..env.total_shards).collect();
            self.rng.shuffle(&mut shards);
            for (loaded, shard) in shards.into_iter().enumerate() {
                self.load_shard(&env, shard, shard == env.my_shard_index)?;
                if (loaded + 1) % 100 == 0 {
                    info!(num_shards_loaded = loaded + 1, "loading shards");
                }
            }
        } else {
            self.load_shard(&env, env.my_shard_index, true)?;
        }

        if !env.merge_from.is_empty() {
            let merge_from = PathBuf::from(&env.merge_from);
            self.merge_from_other_corpus(&merge_from, env.my_shard_index)?;
        }

        let mut corpus_file =
            BlobFileAppender::open(&self.filesystem, &env.corpus_path(env.my_shard_index))?;
        let mut features_file =
            BlobFileAppender::open(&self.filesystem, &env.features_path(env.my_shard_index))?;

        if self.corpus.num_total() == 0 {
            let dummy = self.callbacks.dummy_valid_input();
            self.corpus.add(
                dummy,
                FeatureVec::new(),
                Vec::new(),
                &self.feature_set,
                self.frontier.as_ref(),
            );
        }

        self.update_and_maybe_log_stats("init-done", 0);

        // Pre-init work must not count against the fuzzing rate.
        self.fuzz_start = Instant::now();
        self.num_runs = 0;

        if env.distilling_in_this_shard() {
            self.distill(&env)?;
        }

        self.maybe_generate_telemetry("initial", 0);

        let number_of_batches = env.num_runs.div_ceil(env.batch_size);
        let mut new_runs = 0;
        let mut corpus_size_at_last_prune = self.corpus.num_active();
        let mut inputs: Vec<Vec<u8>> = Vec::with_capacity(env.mutate_batch_size);
        let mut mutants: Vec<Vec<u8>> = Vec::new();

        for batch_index in 0..number_of_batches {
            if util::early_exit_requested() {
                break;
            }
            let batch_size = env.batch_size.min(env.num_runs - new_runs);

            inputs.clear();
            for i in 0..env.mutate_batch_size {
                let record = if env.use_corpus_weights {
                    self.corpus.weighted_random(&mut self.rng)
                } else {
                    self.corpus.uniform_random(&mut self.rng)
                };
                // Only the first input donates its CMP args; per-mutant
                // dictionaries would churn the mutator for little gain.
                if i == 0 {
                    let cmp_args = record.cmp_args.clone();
                    self.mutator.set_cmp_dictionary(&cmp_args);
                }
                inputs.push(record.data.clone());
            }

            self.mutator
                .mutate_many(&inputs, batch_size, env.crossover_level, &mut mutants);

            let gained = self.run_batch(
                &mutants,
                Some(&mut corpus_file),
                Some(&mut features_file),
                None,
            )?;
            new_runs += mutants.len();

            if gained {
                self.update_and_maybe_log_stats("new-feature", 1);
            } else if batch_index.wrapping_sub(1) & batch_index == 0 {
                self.update_and_maybe_log_stats("pulse", 1);
            }

            self.maybe_generate_telemetry("latest", batch_index);

            if env.load_other_shard_frequency != 0
                && batch_index != 0
                && batch_index % env.load_other_shard_frequency == 0
                && env.total_shards > 1
            {
                let other =
                    peer_shard_index(env.my_shard_index, env.total_shards, self.rng.next());
                self.load_shard(&env, other, false)?;
            }

            if env.prune_frequency != 0
                && self.corpus.num_active() > corpus_size_at_last_prune + env.prune_frequency
            {
                if env.use_coverage_frontier {
                    self.frontier.compute(&self.corpus);
                }
                self.corpus.prune(
                    &self.feature_set,
                    self.frontier.as_ref(),
                    env.max_corpus_size,
                    &mut self.rng,
                );
                corpus_size_at_last_prune = self.corpus.num_active();
            }
        }

        corpus_file.close()?;
        features_file.close()?;

        self.maybe_generate_telemetry("latest", number_of_batches);
        self.update_and_maybe_log_stats("end-fuzz", 0);
        Ok(())
    }

    /// Executes one batch on the primary and extra binaries, grades the
    /// results, and appends survivors. Returns true iff any input gained
    /// new coverage.
    fn run_batch(
        &mut self,
        inputs: &[Vec<u8>],
        mut corpus_file: Option<&mut BlobFileAppender>,
        mut features_file: Option<&mut BlobFileAppender>,
        mut unconditional_features_file: Option<&mut BlobFileAppender>,
    ) -> Result<bool, EngineError> {
        let mut batch_result = BatchResult::default();
        let binary = self.env.binary.clone();
        let mut success = self.execute_and_report_crash(&binary, inputs, &mut batch_result)?;

        for extra_binary in self.env.extra_binaries.clone() {
            let mut extra_result = BatchResult::default();
            success =
                self.execute_and_report_crash(&extra_binary, inputs, &mut extra_result)? && success;
        }

        if !success && self.env.exit_on_crash {
            info!("exit_on_crash is enabled; exiting soon");
            util::request_early_exit(1);
            return Ok(false);
        }

        assert_eq!(
            batch_result.results.len(),
            inputs.len(),
            "executor must produce one result per input"
        );
        self.num_runs += inputs.len();

        let mut batch_gained_new_coverage = false;
        for i in 0..inputs.len() {
            if util::early_exit_requested() {
                break;
            }
            let mut fv = std::mem::take(&mut batch_result.results[i].features);
            let function_filter_passed =
                self.function_filter.as_ref().map_or(true, |f| f.filter(&fv));
            let mut input_gained_new_coverage =
                self.feature_set.count_unseen_and_prune_frequent(&mut fv) > 0;
            if self.env.use_pcpair_features && self.add_pc_pair_features(&mut fv) > 0 {
                input_gained_new_coverage = true;
            }
            if let Some(ref mut file) = unconditional_features_file {
                file.append(&util::pack_features_and_hash(&inputs[i], &fv))?;
            }
            if input_gained_new_coverage {
                if !self.input_passes_filter(&inputs[i]) {
                    continue;
                }
                self.feature_set.increment_frequencies(&fv);
                batch_gained_new_coverage = true;
                debug_assert!(!fv.is_empty());
                if function_filter_passed {
                    let cmp_args = std::mem::take(&mut batch_result.results[i].cmp_args);
                    self.corpus.add(
                        inputs[i].clone(),
                        fv.clone(),
                        cmp_args,
                        &self.feature_set,
                        self.frontier.as_ref(),
                    );
                }
                if let Some(ref mut file) = corpus_file {
                    file.append(&inputs[i])?;
                }
                if let Some(dir) = self.env.corpus_dir.first() {
                    let dir = dir.clone();
                    self.write_hashed_input(&dir, &inputs[i])?;
                }
                if let Some(ref mut file) = features_file {
                    file.append(&util::pack_features_and_hash(&inputs[i], &fv))?;
                }
            }
        }
        Ok(batch_gained_new_coverage)
    }

    fn execute_and_report_crash(
        &mut self,
        binary: &str,
        inputs: &[Vec<u8>],
        batch_result: &mut BatchResult,
    ) -> Result<bool, EngineError> {
        let success = self.callbacks.execute(binary, inputs, batch_result);
        if !success {
            self.report_crash(binary, inputs, batch_result)?;
        }
        Ok(success)
    }

    /// Loads one shard's files into the corpus; with `rerun`, inputs
    /// whose features are unknown are re-executed. Peer files may be
    /// partial or missing; that is absorbed, not an error.
    fn load_shard(
        &mut self,
        load_env: &Environment,
        shard_index: usize,
        rerun: bool,
    ) -> Result<(), EngineError> {
        let corpus_path = load_env.corpus_path(shard_index);
        let features_path = load_env.features_path(shard_index);

        let mut to_rerun: Vec<Vec<u8>> = Vec::new();
        let mut added_to_corpus = 0usize;
        {
            let feature_set = &mut self.feature_set;
            let corpus = &mut self.corpus;
            let frontier = self.frontier.as_ref();
            let callback = |input: Vec<u8>, mut features: FeatureVec| {
                if util::early_exit_requested() {
                    return;
                }
                if features.is_empty() {
                    if rerun {
                        to_rerun.push(input);
                    }
                } else if feature_set.count_unseen_and_prune_frequent(&mut features) > 0 {
                    feature_set.increment_frequencies(&features);
                    // cmp_args are not persisted in shard files; reloaded
                    // records start without them.
                    corpus.add(input, features, Vec::new(), feature_set, frontier);
                    added_to_corpus += 1;
                }
            };

            let read_result = if self.env.serialize_shard_loads {
                static LOAD_SHARD_MUTEX: Mutex<()> = Mutex::new(());
                let _guard = LOAD_SHARD_MUTEX
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                read_shard(&self.filesystem, &corpus_path, &features_path, callback)
            } else {
                read_shard(&self.filesystem, &corpus_path, &features_path, callback)
            };
            if let Err(err) = read_result {
                warn!(shard = shard_index, %err, "failed to read shard; skipping");
            }
        }

        if added_to_corpus > 0 {
            self.update_and_maybe_log_stats("load-shard", 1);
        }
        self.rerun(to_rerun)
    }

    /// Re-executes inputs with unknown features, appending fresh feature
    /// records to our own features file.
    fn rerun(&mut self, mut to_rerun: Vec<Vec<u8>>) -> Result<(), EngineError> {
        if to_rerun.is_empty() {
            return Ok(());
        }
        let features_path = self.env.features_path(self.env.my_shard_index);
        let mut features_file = BlobFileAppender::open(&self.filesystem, &features_path)?;

        info!(count = to_rerun.len(), "inputs to rerun");
        while !to_rerun.is_empty() {
            if util::early_exit_requested() {
                break;
            }
            let batch_size = to_rerun.len().min(self.env.batch_size);
            let batch = to_rerun.split_off(to_rerun.len() - batch_size);
            if self.run_batch(&batch, None, None, Some(&mut features_file))? {
                self.update_and_maybe_log_stats("rerun-old", 1);
            }
        }
        features_file.close()?;
        Ok(())
    }

    /// Merges the same-index shard of another workdir into this one,
    /// appending the newly discovered inputs to our corpus file.
    fn merge_from_other_corpus(
        &mut self,
        merge_from_dir: &Path,
        shard_index_to_merge: usize,
    ) -> Result<(), EngineError> {
        info!(from = %merge_from_dir.display(), "merging from other corpus");
        let mut merge_env = self.env.clone();
        merge_env.workdir = merge_from_dir.to_path_buf();

        let initial_corpus_size = self.corpus.num_active();
        self.load_shard(&merge_env, shard_index_to_merge, true)?;
        let new_corpus_size = self.corpus.num_active();
        // Loading never prunes, so the corpus cannot shrink here.
        assert!(new_corpus_size >= initial_corpus_size);

        if new_corpus_size > initial_corpus_size {
            let corpus_path = self.env.corpus_path(self.env.my_shard_index);
            let mut appender = BlobFileAppender::open(&self.filesystem, &corpus_path)?;
            for idx in initial_corpus_size..new_corpus_size {
                appender.append(self.corpus.get(idx))?;
            }
            appender.close()?;
            info!(
                new_inputs = new_corpus_size - initial_corpus_size,
                "merge complete"
            );
        }
        Ok(())
    }

    /// Writes the currently-active corpus to the distilled file.
    fn distill(&mut self, env: &Environment) -> Result<(), EngineError> {
        let distilled_path = env.distilled_path();
        let mut appender = BlobFileAppender::open(&self.filesystem, &distilled_path)?;
        for idx in 0..self.corpus.num_active() {
            appender.append(self.corpus.get(idx))?;
            if let Some(dir) = env.corpus_dir.first() {
                let data = self.corpus.get(idx).to_vec();
                self.write_hashed_input(dir, &data)?;
            }
        }
        appender.close()?;
        info!(
            path = %distilled_path.display(),
            distilled_size = self.corpus.num_active(),
            "distilled corpus written"
        );
        Ok(())
    }

    /// Synthesizes a feature for every previously-unseen pair of PCs in
    /// `fv`. Quadratic in the input's distinct PCs; gated by
    /// `use_pcpair_features` and a known PC table size.
    fn add_pc_pair_features(&mut self, fv: &mut FeatureVec) -> usize {
        if self.num_pcs == 0 {
            return 0;
        }
        let pcs: Vec<usize> = fv
            .iter()
            .filter(|&&f| domains::EIGHT_BIT_COUNTERS.contains(f))
            .map(|&f| feature_to_pc_index(f))
            .collect();
        let mut num_added_pairs = 0;
        for i in 0..pcs.len() {
            for j in i + 1..pcs.len() {
                let feature = pc_pair_feature(pcs[i], pcs[j], self.num_pcs);
                if self.feature_set.frequency(feature) > 0 {
                    continue;
                }
                fv.push(feature);
                num_added_pairs += 1;
            }
        }
        num_added_pairs
    }

    fn input_passes_filter(&mut self, input: &[u8]) -> bool {
        match &mut self.input_filter {
            Some(filter) => filter.passes(input),
            None => true,
        }
    }

    /// Logs a crash, hunts for a single-input reproducer (suspect
    /// first), and writes it to `<workdir>/crashes/<hash>`.
    fn report_crash(
        &mut self,
        binary: &str,
        inputs: &[Vec<u8>],
        batch_result: &BatchResult,
    ) -> Result<(), EngineError> {
        if self.num_crash_reports >= self.env.max_num_crash_reports {
            return Ok(());
        }
        self.num_crash_reports += 1;

        warn!(
            report = self.num_crash_reports,
            binary,
            exit_code = batch_result.exit_code,
            failure = %batch_result.failure_description,
            num_inputs = inputs.len(),
            "batch execution failed"
        );
        for log_line in batch_result.log.trim().lines() {
            warn!("CRASH LOG: {log_line}");
        }
        if self.num_crash_reports == self.env.max_num_crash_reports {
            warn!("reached max_num_crash_reports: further reports will be suppressed");
        }

        // Prioritize the presumed crasher by trying it first, but keep
        // its original position too: the target may need the preceding
        // inputs to prime the crash.
        let mut input_idxs_to_try: VecDeque<usize> = (0..inputs.len()).collect();
        let suspect_input_idx = batch_result.num_outputs_read;
        if suspect_input_idx < inputs.len() {
            input_idxs_to_try.push_front(suspect_input_idx);
        }

        info!("executing inputs one-by-one, trying to find the reproducer");
        for input_idx in input_idxs_to_try {
            let one_input = &inputs[input_idx];
            let mut one_result = BatchResult::default();
            if !self
                .callbacks
                .execute(binary, std::slice::from_ref(one_input), &mut one_result)
            {
                let hash = util::hash(one_input);
                let crash_dir = self.env.crash_reproducer_dir();
                self.filesystem.mkdir(&crash_dir)?;
                let file_path = crash_dir.join(&hash);
                warn!(
                    input = %util::as_printable(one_input, 32),
                    exit_code = one_result.exit_code,
                    failure = %one_result.failure_description,
                    path = %file_path.display(),
                    "detected crash-reproducing input"
                );
                let mut file = self.filesystem.open(&file_path, OpenMode::Write)?;
                file.append(one_input)?;
                file.close()?;
                return Ok(());
            }
        }
        info!("crash was not observed when running inputs one-by-one");
        Ok(())
    }

    fn write_hashed_input(&self, dir: &Path, data: &[u8]) -> Result<(), EngineError> {
        self.filesystem.mkdir(dir)?;
        let path = dir.join(util::hash(data));
        let mut file = self.filesystem.open(&path, OpenMode::Write)?;
        file.append(data)?;
        file.close()?;
        Ok(())
    }

    fn update_and_maybe_log_stats(&self, log_type: &str, min_log_level: usize) {
        if self.env.log_level < min_log_level {
            return;
        }
        let fuzz_time_secs = self.fuzz_start.elapsed().as_secs_f64();
        let execs_per_sec = if fuzz_time_secs > 0.0 {
            (self.num_runs as f64 / fuzz_time_secs).round()
        } else {
            0.0
        };
        let (max_size, avg_size) = self.corpus.max_and_avg_size();
        info!(
            experiment = %self.env.experiment_name,
            runs = self.num_runs,
            ft = self.feature_set.size(),
            cov = self.feature_set.to_coverage_pcs().len(),
            cnt = self.feature_set.count_features(domains::EIGHT_BIT_COUNTERS),
            df = self.feature_set.count_features(domains::DATA_FLOW),
            cmp = self.feature_set.count_features(domains::CMP),
            path = self.feature_set.count_features(domains::BOUNDED_PATH),
            pair = self.feature_set.count_features(domains::PC_PAIR),
            corp_active = self.corpus.num_active(),
            corp_total = self.corpus.num_total(),
            fr = self.frontier.num_functions_in_frontier(),
            max_size,
            avg_size,
            execs_per_sec,
            "{log_type}"
        );
    }

    /// Dumps telemetry if the cadence says so. Telemetry failures are
    /// logged, never fatal.
    fn maybe_generate_telemetry(&self, annotation: &str, batch_index: usize) {
        if !self.env.dump_telemetry_for_this_batch(batch_index) {
            return;
        }
        if let Err(err) = self.generate_coverage_report(annotation, batch_index) {
            warn!(%err, "coverage report generation failed");
        }
        if let Err(err) = self.generate_corpus_stats(annotation, batch_index) {
            warn!(%err, "corpus stats generation failed");
        }
    }

    fn generate_coverage_report(&self, annotation: &str, batch_index: usize) -> io::Result<()> {
        let mut out = format!("# Last batch: {batch_index}\n\n");
        for pc_index in self.feature_set.to_coverage_pcs() {
            out.push_str(&format!("pc: {pc_index}\n"));
        }
        let path = self.env.coverage_report_path(annotation);
        let mut file = self.filesystem.open(&path, OpenMode::Write)?;
        file.append(out.as_bytes())?;
        file.close()
    }

    fn generate_corpus_stats(&self, annotation: &str, batch_index: usize) -> io::Result<()> {
        let mut stats = self.corpus.stats_json(&self.feature_set);
        stats["last_batch"] = serde_json::json!(batch_index);
        let rendered = serde_json::to_string_pretty(&stats).map_err(io::Error::other)?;
        let path = self.env.corpus_stats_path(annotation);
        let mut file = self.filesystem.open(&path, OpenMode::Write)?;
        file.append(rendered.as_bytes())?;
        file.close()
    }
}

/// Streams every shard's corpus into `dir`, one raw file per input,
/// named by hash. Returns the number of inputs written.
pub fn save_corpus_to_local_dir(
    env: &Environment,
    filesystem: &Arc<dyn FileSystem>,
    dir: &Path,
) -> Result<usize, EngineError> {
    filesystem.mkdir(dir)?;
    let mut total = 0;
    for shard in 0..env.total_shards {
        let buf = read_blob_file(filesystem, &env.corpus_path(shard))?;
        let mut num_read = 0;
        for blob in BlobFrameIter::new(&buf) {
            let path = dir.join(&blob.hash);
            let mut file = filesystem.open(&path, OpenMode::Write)?;
            file.append(blob.data)?;
            file.close()?;
            num_read += 1;
        }
        info!(shard, num_read, "read corpus shard");
        total += num_read;
    }
    Ok(total)
}

/// Imports a directory of raw input files into the shard corpus files.
///
/// Files are partitioned by filename hash, so a given file always lands
/// in the same shard; inputs already present in a shard (same content
/// hash) are skipped. Returns `(added, ignored)`.
pub fn export_corpus_from_local_dir(
    env: &Environment,
    filesystem: &Arc<dyn FileSystem>,
    dir: &Path,
) -> Result<(usize, usize), EngineError> {
    let mut sharded_paths: Vec<Vec<PathBuf>> = vec![Vec::new(); env.total_shards];
    collect_files(dir, &mut |path| {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let shard = stable_filename_shard(&file_name, env.total_shards);
        sharded_paths[shard].push(path);
    })?;

    let mut inputs_added = 0;
    let mut inputs_ignored = 0;
    for (shard, paths) in sharded_paths.iter().enumerate() {
        if paths.is_empty() {
            continue;
        }
        let corpus_path = env.corpus_path(shard);
        let existing_buf = read_blob_file(filesystem, &corpus_path)?;
        let existing_hashes: HashSet<String> = BlobFrameIter::new(&existing_buf)
            .map(|blob| blob.hash)
            .collect();

        let mut appender = BlobFileAppender::open(filesystem, &corpus_path)?;
        for path in paths {
            let input = std::fs::read(path)?;
            if input.is_empty() || existing_hashes.contains(&util::hash(&input)) {
                inputs_ignored += 1;
                continue;
            }
            appender.append(&input)?;
            inputs_added += 1;
        }
        appender.close()?;
        info!(shard, inputs_added, inputs_ignored, "exported local corpus dir");
    }
    Ok((inputs_added, inputs_ignored))
}

fn stable_filename_shard(file_name: &str, total_shards: usize) -> usize {
    let digest = util::hash(file_name.as_bytes());
    // First 8 hex chars are plenty to spread files across shards.
    let value = u32::from_str_radix(&digest[..8], 16).unwrap_or(0);
    value as usize % total_shards
}

fn collect_files(dir: &Path, visit: &mut dyn FnMut(PathBuf)) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, visit)?;
        } else if path.is_file() {
            visit(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::unpack_blobs;
    use crate::executor::{HarnessOutcome, InProcessExecutor};
    use crate::feature::pc_feature;
    use tempfile::tempdir;

    // The early-exit flag is process-global; tests touching the loop or
    // the flag serialize on this.
    static EXIT_FLAG_LOCK: Mutex<()> = Mutex::new(());

    fn lock_exit_flag() -> std::sync::MutexGuard<'static, ()> {
        let guard = EXIT_FLAG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        util::clear_early_exit_for_tests();
        guard
    }

    /// Synthetic coverage: one PC per (position, byte-high-nibble) pair
    /// over the first 8 bytes, plus a CMP pair over a fixed token.
    fn demo_harness(data: &[u8]) -> HarnessOutcome {
        let mut features = Vec::new();
        for (pos, &byte) in data.iter().take(8).enumerate() {
            features.push(pc_feature(pos * 16 + (byte >> 4) as usize, 1));
        }
        HarnessOutcome {
            features,
            cmp_pairs: vec![(b"HI".to_vec(), b"YO".to_vec())],
        }
    }

    fn crashing_harness(data: &[u8]) -> HarnessOutcome {
        if data.first() == Some(&0xee) {
            panic!("poison byte");
        }
        demo_harness(data)
    }

    fn demo_env(workdir: &Path) -> Environment {
        let mut env = Environment::default();
        env.workdir = workdir.to_path_buf();
        env.binary = "demo-target".to_string();
        env.num_runs = 200;
        env.batch_size = 20;
        env.mutate_batch_size = 2;
        env.seed = 101;
        env
    }

    fn demo_engine(env: Environment) -> Engine {
        let executor = InProcessExecutor::new(demo_harness, vec![b'S']);
        Engine::new(env, Box::new(executor)).unwrap()
    }

    #[test]
    fn configuration_errors_fail_fast() {
        let executor = || Box::new(InProcessExecutor::new(demo_harness, vec![0]));
        let no_workdir = Environment::default();
        assert!(matches!(
            Engine::new(no_workdir, executor()),
            Err(EngineError::Config(_))
        ));

        let dir = tempdir().unwrap();
        let mut bad_shard = demo_env(dir.path());
        bad_shard.my_shard_index = 3;
        bad_shard.total_shards = 2;
        assert!(matches!(
            Engine::new(bad_shard, executor()),
            Err(EngineError::Config(_))
        ));

        let mut bad_batch = demo_env(dir.path());
        bad_batch.batch_size = 0;
        assert!(matches!(
            Engine::new(bad_batch, executor()),
            Err(EngineError::Config(_))
        ));

        let mut bad_crossover = demo_env(dir.path());
        bad_crossover.crossover_level = 101;
        assert!(matches!(
            Engine::new(bad_crossover, executor()),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn peer_shard_selection_never_picks_self() {
        assert_eq!(peer_shard_index(3, 5, 2), 1);
        for my in 0..5 {
            for random in 0..20 {
                assert_ne!(peer_shard_index(my, 5, random), my);
            }
        }
    }

    #[test]
    fn fuzzing_loop_grows_corpus_and_writes_shard_files() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let env = demo_env(dir.path());
        let corpus_path = env.corpus_path(0);
        let features_path = env.features_path(0);

        let mut engine = demo_engine(env);
        engine.fuzzing_loop().unwrap();

        assert!(engine.corpus().num_active() > 1, "mutants should discover features");
        assert!(engine.feature_set().size() > 0);

        let corpus_buf = std::fs::read(&corpus_path).unwrap();
        let (corpus_blobs, _) = unpack_blobs(&corpus_buf);
        assert!(!corpus_blobs.is_empty());

        let features_buf = std::fs::read(&features_path).unwrap();
        let (feature_blobs, _) = unpack_blobs(&features_buf);
        assert_eq!(
            corpus_blobs.len(),
            feature_blobs.len(),
            "every appended input gets a features record"
        );
        // Every features record joins back to a corpus record by hash.
        let corpus_hashes: HashSet<String> =
            corpus_blobs.iter().map(|b| util::hash(b)).collect();
        for blob in feature_blobs {
            let (_, hash) = util::unpack_features_and_hash(&blob).unwrap();
            assert!(corpus_hashes.contains(&hash));
        }
        assert_eq!(util::exit_code(), 0);
    }

    #[test]
    fn second_shard_absorbs_first_shards_discoveries() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();

        let mut env0 = demo_env(dir.path());
        env0.total_shards = 2;
        env0.my_shard_index = 0;
        let mut engine0 = demo_engine(env0);
        engine0.fuzzing_loop().unwrap();
        let discovered = engine0.corpus().num_active();
        assert!(discovered > 1);

        // Shard 1 does zero runs of its own but full-syncs at startup.
        let mut env1 = demo_env(dir.path());
        env1.total_shards = 2;
        env1.my_shard_index = 1;
        env1.num_runs = 1;
        env1.batch_size = 1;
        env1.full_sync = true;
        let mut engine1 = demo_engine(env1);
        engine1.fuzzing_loop().unwrap();
        // Shard 0's file holds everything it discovered except its
        // in-memory dummy seed; replaying those admissions absorbs all
        // of them.
        assert!(
            engine1.corpus().num_active() >= discovered - 1,
            "peer discoveries should be absorbed"
        );
    }

    #[test]
    fn same_input_is_never_double_admitted_across_loads() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.num_runs = 40;
        let mut engine = demo_engine(env.clone());
        engine.fuzzing_loop().unwrap();
        let after_first = engine.corpus().num_active();

        // Loading our own shard again finds no unseen features: all
        // its records' features are already frequent in this process.
        engine.load_shard(&env, 0, true).unwrap();
        assert_eq!(engine.corpus().num_active(), after_first);
    }

    #[test]
    fn reload_in_fresh_process_rebuilds_corpus_without_rerun() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let env = demo_env(dir.path());
        let mut engine = demo_engine(env.clone());
        engine.fuzzing_loop().unwrap();
        let discovered = engine.corpus().num_active();

        // A fresh engine (fresh feature set) over the same workdir.
        // The shard file holds every discovery except the in-memory
        // dummy seed, and replaying admissions in file order re-admits
        // each one (its unseen feature is still unseen at that point).
        let mut fresh = demo_engine(env.clone());
        fresh.load_shard(&env, 0, true).unwrap();
        assert_eq!(fresh.corpus().num_active(), discovered - 1);
    }

    #[test]
    fn crash_reproducer_is_written_with_suspect_first() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let env = demo_env(dir.path());
        let crash_dir = env.crash_reproducer_dir();
        let executor = InProcessExecutor::new(crashing_harness, vec![b'S']);
        let mut engine = Engine::new(env, Box::new(executor)).unwrap();

        let crasher = vec![0xee, 1, 2];
        let inputs = vec![vec![1, 2, 3], crasher.clone(), vec![4, 5]];
        let mut batch_result = BatchResult::default();
        let success = engine
            .execute_and_report_crash("demo-target", &inputs, &mut batch_result)
            .unwrap();
        assert!(!success);

        let reproducer_path = crash_dir.join(util::hash(&crasher));
        let written = std::fs::read(&reproducer_path).unwrap();
        assert_eq!(written, crasher);
    }

    #[test]
    fn crash_report_count_is_capped() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.max_num_crash_reports = 2;
        let executor = InProcessExecutor::new(crashing_harness, vec![b'S']);
        let mut engine = Engine::new(env, Box::new(executor)).unwrap();

        for _ in 0..5 {
            let inputs = vec![vec![0xee]];
            let mut batch_result = BatchResult::default();
            let _ = engine
                .execute_and_report_crash("demo-target", &inputs, &mut batch_result)
                .unwrap();
        }
        assert_eq!(engine.num_crash_reports, 2);
    }

    #[test]
    fn exit_on_crash_requests_early_exit() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.exit_on_crash = true;
        env.num_runs = 10_000;
        env.batch_size = 50;
        let executor = InProcessExecutor::new(
            |data: &[u8]| {
                // Crash as soon as a mutant contains a zero byte, which
                // mutation reaches almost immediately.
                if data.contains(&0x00) {
                    panic!("zero byte");
                }
                demo_harness(data)
            },
            vec![b'S'],
        );
        let mut engine = Engine::new(env, Box::new(executor)).unwrap();
        engine.fuzzing_loop().unwrap();
        assert!(util::early_exit_requested());
        assert_eq!(util::exit_code(), 1);
        util::clear_early_exit_for_tests();
    }

    #[test]
    fn merge_from_other_corpus_appends_new_inputs() {
        let _guard = lock_exit_flag();
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();

        // Populate workdir A, shard 0.
        let env_a = demo_env(dir_a.path());
        let mut engine_a = demo_engine(env_a);
        engine_a.fuzzing_loop().unwrap();
        let discovered = engine_a.corpus().num_active();
        assert!(discovered > 1);

        // Workdir B merges A's shard 0 before fuzzing.
        let mut env_b = demo_env(dir_b.path());
        env_b.merge_from = dir_a.path().to_string_lossy().into_owned();
        env_b.num_runs = 1;
        env_b.batch_size = 1;
        let corpus_path_b = env_b.corpus_path(0);
        let mut engine_b = demo_engine(env_b);
        engine_b.fuzzing_loop().unwrap();

        let buf = std::fs::read(&corpus_path_b).unwrap();
        let (blobs, _) = unpack_blobs(&buf);
        assert!(
            blobs.len() >= discovered - 1,
            "merged inputs must be appended to our own corpus file"
        );
    }

    #[test]
    fn distill_writes_active_corpus() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.distill_shards = 1;
        let distilled_path = env.distilled_path();
        let mut engine = demo_engine(env);
        engine.fuzzing_loop().unwrap();

        let buf = std::fs::read(&distilled_path).unwrap();
        let (blobs, _) = unpack_blobs(&buf);
        assert!(!blobs.is_empty());
    }

    #[test]
    fn pc_pair_features_are_synthesized_once() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.use_pcpair_features = true;
        let executor = InProcessExecutor::new(demo_harness, vec![b'S']).with_num_pcs(256);
        let mut engine = Engine::new(env, Box::new(executor)).unwrap();

        let mut fv = vec![pc_feature(1, 1), pc_feature(2, 1), pc_feature(3, 1)];
        let added = engine.add_pc_pair_features(&mut fv);
        assert_eq!(added, 3, "three distinct pairs from three PCs");
        engine.feature_set.increment_frequencies(&fv);

        // The same pairs are not added twice.
        let mut fv2 = vec![pc_feature(1, 1), pc_feature(2, 1)];
        assert_eq!(engine.add_pc_pair_features(&mut fv2), 0);
    }

    #[test]
    fn telemetry_files_are_written() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.telemetry_frequency = 1;
        let coverage_path = env.coverage_report_path("latest");
        let stats_path = env.corpus_stats_path("latest");
        let mut engine = demo_engine(env);
        engine.fuzzing_loop().unwrap();

        assert!(coverage_path.exists());
        let stats: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&stats_path).unwrap()).unwrap();
        assert!(stats["num_active"].as_u64().unwrap() > 0);
    }

    #[test]
    fn save_and_export_corpus_round_trip() {
        let _guard = lock_exit_flag();
        let dir = tempdir().unwrap();
        let env = demo_env(dir.path());
        let mut engine = demo_engine(env.clone());
        engine.fuzzing_loop().unwrap();

        let filesystem: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let export_dir = dir.path().join("exported");
        let saved = save_corpus_to_local_dir(&env, &filesystem, &export_dir).unwrap();
        assert!(saved > 0);
        assert_eq!(std::fs::read_dir(&export_dir).unwrap().count(), saved);

        // Importing into a fresh workdir adds everything once, and a
        // second import ignores all of it.
        let fresh = tempdir().unwrap();
        let mut env_b = demo_env(fresh.path());
        env_b.total_shards = 3;
        std::fs::create_dir_all(&env_b.workdir).unwrap();
        let (added, ignored) =
            export_corpus_from_local_dir(&env_b, &filesystem, &export_dir).unwrap();
        assert_eq!(added, saved);
        assert_eq!(ignored, 0);
        let (added2, ignored2) =
            export_corpus_from_local_dir(&env_b, &filesystem, &export_dir).unwrap();
        assert_eq!(added2, 0);
        assert_eq!(ignored2, saved);
    }

    #[test]
    fn function_filter_blocks_corpus_but_not_files() {
        let _guard = lock_exit_flag();
        struct RejectAll;
        impl FunctionFilter for RejectAll {
            fn filter(&self, _features: &FeatureVec) -> bool {
                false
            }
        }
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.num_runs = 40;
        let corpus_path = env.corpus_path(0);
        let mut engine = demo_engine(env);
        engine.set_function_filter(Box::new(RejectAll));
        engine.fuzzing_loop().unwrap();

        // Only the dummy seed remains in memory, but new-coverage inputs
        // still hit the corpus file for other shards to grade.
        assert_eq!(engine.corpus().num_active(), 1);
        let buf = std::fs::read(&corpus_path).unwrap();
        let (blobs, _) = unpack_blobs(&buf);
        assert!(!blobs.is_empty());
    }

    #[test]
    fn input_filter_rejection_blocks_admission() {
        let _guard = lock_exit_flag();
        struct RejectEverything;
        impl InputFilter for RejectEverything {
            fn passes(&mut self, _input: &[u8]) -> bool {
                false
            }
        }
        let dir = tempdir().unwrap();
        let mut env = demo_env(dir.path());
        env.num_runs = 40;
        let corpus_path = env.corpus_path(0);
        let mut engine = demo_engine(env);
        engine.set_input_filter(Box::new(RejectEverything));
        engine.fuzzing_loop().unwrap();

        assert_eq!(engine.corpus().num_active(), 1, "nothing passes the filter");
        // The appender creates the file on open, but nothing lands in it.
        let file_len = std::fs::metadata(&corpus_path).map(|m| m.len()).unwrap_or(0);
        assert_eq!(file_len, 0, "filtered inputs are not appended");
    }
}
