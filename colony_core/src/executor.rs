use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::feature::FeatureVec;

/// What one input's execution produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub features: FeatureVec,
    /// Raw CMP pair stream: repeating `[size:u8][A:size][B:size]`.
    pub cmp_args: Vec<u8>,
}

/// The outcome of executing a batch of inputs on one binary.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Per-input results, in input order. On failure this still holds
    /// one (possibly default) entry per input so grading can index it.
    pub results: Vec<ExecutionResult>,
    pub exit_code: i32,
    pub failure_description: String,
    /// Target output captured for the crash log.
    pub log: String,
    /// Results recorded before the failure; on a crash this indexes the
    /// suspect input.
    pub num_outputs_read: usize,
}

impl BatchResult {
    pub fn new(num_inputs: usize) -> Self {
        Self {
            results: vec![ExecutionResult::default(); num_inputs],
            ..Self::default()
        }
    }
}

/// Executes batches of inputs on a target binary.
///
/// This is the seam to the target-execution subsystem: subprocess
/// runners, fork servers, and snapshot executors all live behind it. The
/// engine only needs batch semantics and failure localization.
pub trait Executor: Send {
    /// Executes `binary` on every input, filling `batch_result`.
    /// Returns false iff the batch failed (crash, timeout, setup error).
    fn execute(&mut self, binary: &str, inputs: &[Vec<u8>], batch_result: &mut BatchResult)
        -> bool;

    /// A minimal input the target accepts; used for warmup and for
    /// seeding an empty corpus.
    fn dummy_valid_input(&self) -> Vec<u8> {
        vec![0]
    }

    /// Size of the target's PC table, when the execution subsystem knows
    /// it. Required for PC-pair feature synthesis; 0 disables it.
    fn num_pcs(&self) -> usize {
        0
    }
}

/// Per-input coverage reported by an in-process harness.
#[derive(Debug, Clone, Default)]
pub struct HarnessOutcome {
    pub features: FeatureVec,
    /// Observed comparisons, as equal-length `(a, b)` pairs.
    pub cmp_pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Runs a harness function in-process, catching panics.
///
/// A panicking input fails the whole batch, with `num_outputs_read`
/// pointing at the panicking input, which is exactly the localization
/// the crash reporter needs.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessOutcome,
{
    harness_fn: F,
    dummy_input: Vec<u8>,
    num_pcs: usize,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessOutcome,
{
    pub fn new(harness_fn: F, dummy_input: Vec<u8>) -> Self {
        assert!(!dummy_input.is_empty());
        Self {
            harness_fn,
            dummy_input,
            num_pcs: 0,
        }
    }

    /// Declares the harness's PC table size, enabling PC-pair features.
    pub fn with_num_pcs(mut self, num_pcs: usize) -> Self {
        self.num_pcs = num_pcs;
        self
    }
}

fn pack_cmp_pairs(pairs: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (a, b) in pairs {
        debug_assert_eq!(a.len(), b.len());
        out.push(a.len() as u8);
        out.extend_from_slice(a);
        out.extend_from_slice(b);
    }
    out
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessOutcome + Send,
{
    fn execute(
        &mut self,
        _binary: &str,
        inputs: &[Vec<u8>],
        batch_result: &mut BatchResult,
    ) -> bool {
        *batch_result = BatchResult::new(inputs.len());
        for (idx, input) in inputs.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(input))) {
                Ok(outcome) => {
                    batch_result.results[idx] = ExecutionResult {
                        features: outcome.features,
                        cmp_args: pack_cmp_pairs(&outcome.cmp_pairs),
                    };
                    batch_result.num_outputs_read = idx + 1;
                }
                Err(panic_payload) => {
                    let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    batch_result.num_outputs_read = idx;
                    batch_result.exit_code = 1;
                    batch_result.log = format!("panic on input #{idx}: {msg}");
                    batch_result.failure_description = msg;
                    return false;
                }
            }
        }
        true
    }

    fn dummy_valid_input(&self) -> Vec<u8> {
        self.dummy_input.clone()
    }

    fn num_pcs(&self) -> usize {
        self.num_pcs
    }
}
