//! Sharded coverage-guided fuzzing engine.
//!
//! All state lives in a shared work directory: each shard appends to its
//! own corpus and features files and periodically reads other shards'
//! files to absorb their discoveries. Files are append-only (no renames,
//! no deletions), so peers may observe partial writes; every reader here
//! tolerates that.

pub mod blob;
pub mod corpus;
pub mod dictionary;
pub mod engine;
pub mod environment;
pub mod executor;
pub mod feature;
pub mod knobs;
pub mod mutator;
pub mod remote_file;
pub mod rng;
pub mod shard_reader;
pub mod util;

pub use corpus::{Corpus, CorpusRecord, CoverageFrontier, NullCoverageFrontier};
pub use engine::{
    export_corpus_from_local_dir, save_corpus_to_local_dir, Engine, EngineError, FunctionFilter,
    InputFilter,
};
pub use environment::Environment;
pub use executor::{BatchResult, ExecutionResult, Executor, HarnessOutcome, InProcessExecutor};
pub use feature::{Feature, FeatureSet, FeatureVec};
pub use knobs::{KnobId, Knobs};
pub use mutator::ByteArrayMutator;
pub use remote_file::{FileSystem, LocalFileSystem};
