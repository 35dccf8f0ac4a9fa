use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use colony_core::dictionary::parse_afl_dictionary;
use colony_core::executor::{HarnessOutcome, InProcessExecutor};
use colony_core::feature::pc_feature;
use colony_core::{
    export_corpus_from_local_dir, save_corpus_to_local_dir, util, Engine, Environment, FileSystem,
    LocalFileSystem,
};

#[derive(Debug, Parser)]
#[command(name = "colony")]
#[command(about = "sharded coverage-guided fuzzing engine", version)]
struct Cli {
    /// Path to a TOML environment file. Missing file means defaults.
    #[arg(long, global = true, default_value = "colony.toml")]
    config: PathBuf,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fuzz the built-in demo target.
    Fuzz {
        /// Shared work directory.
        #[arg(long)]
        workdir: Option<PathBuf>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        num_runs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        total_shards: Option<usize>,

        #[arg(long)]
        my_shard_index: Option<usize>,

        /// Exit with code 1 as soon as any batch fails.
        #[arg(long)]
        exit_on_crash: bool,

        /// AFL/libFuzzer dictionary file.
        #[arg(long)]
        dictionary: Option<PathBuf>,

        /// Max mutant length in bytes.
        #[arg(long)]
        max_len: Option<usize>,

        /// Mutant sizes stay multiples of this.
        #[arg(long)]
        size_alignment: Option<usize>,
    },

    /// Write every shard's corpus into a directory, one file per input.
    SaveCorpus {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// Import a directory of raw inputs into the shard corpus files.
    ExportCorpus {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

/// PC budget of the demo harness, so PC-pair features stay enabled.
const DEMO_NUM_PCS: usize = 512;

/// A small stand-in target with enough structure to exercise the whole
/// pipeline: a magic prefix guarded by a CMP observation, a command byte
/// fanning out to distinct PCs, one command that aborts, and nibble
/// coverage over the input body.
fn demo_harness(data: &[u8]) -> HarnessOutcome {
    let mut features = vec![pc_feature(0, 1)];
    let mut cmp_pairs = Vec::new();

    let magic = b"FUZZ";
    if data.len() >= magic.len() {
        features.push(pc_feature(1, 1));
        cmp_pairs.push((data[..magic.len()].to_vec(), magic.to_vec()));
        if &data[..magic.len()] == magic {
            features.push(pc_feature(2, 1));
            match data.get(4) {
                Some(&command) if command < 8 => {
                    features.push(pc_feature(3 + command as usize, 1));
                    if command == 7 && data.len() > 8 {
                        panic!("demo target: command 7 with payload aborts");
                    }
                }
                _ => features.push(pc_feature(11, 1)),
            }
        }
    }
    for (pos, &byte) in data.iter().take(16).enumerate() {
        features.push(pc_feature(16 + pos * 16 + (byte >> 4) as usize, 1));
    }
    HarnessOutcome {
        features,
        cmp_pairs,
    }
}

fn load_environment(config: &PathBuf) -> anyhow::Result<Environment> {
    if config.exists() {
        tracing::info!(path = %config.display(), "loading environment");
        Environment::load_from_file(config)
    } else {
        Ok(Environment::default())
    }
}

fn run_fuzz(
    mut env: Environment,
    exit_on_crash: bool,
    dictionary: Option<PathBuf>,
    max_len: Option<usize>,
    size_alignment: Option<usize>,
) -> anyhow::Result<ExitCode> {
    env.binary = "colony-demo-target".to_string();
    env.exit_on_crash = env.exit_on_crash || exit_on_crash;
    if env.workdir.as_os_str().is_empty() {
        anyhow::bail!("--workdir (or workdir in the config file) is required");
    }

    let executor = InProcessExecutor::new(demo_harness, b"FUZZ".to_vec()).with_num_pcs(DEMO_NUM_PCS);
    let mut engine = Engine::new(env, Box::new(executor))?;

    let mutator = engine.mutator_mut();
    if let Some(alignment) = size_alignment {
        if !mutator.set_size_alignment(alignment) {
            anyhow::bail!("size alignment {alignment} is incompatible with the max length");
        }
    }
    if let Some(max_len) = max_len {
        if !mutator.set_max_len(max_len) {
            anyhow::bail!("max length {max_len} is incompatible with the size alignment");
        }
    }
    if let Some(path) = dictionary {
        let text = std::fs::read_to_string(&path)?;
        let entries = parse_afl_dictionary(&text)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "loaded dictionary");
        mutator.add_to_dictionary(&entries);
    }

    engine.fuzzing_loop()?;
    Ok(ExitCode::from(util::exit_code().clamp(0, 255) as u8))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut env = load_environment(&cli.config)?;
    match cli.command {
        Command::Fuzz {
            workdir,
            seed,
            num_runs,
            batch_size,
            total_shards,
            my_shard_index,
            exit_on_crash,
            dictionary,
            max_len,
            size_alignment,
        } => {
            if let Some(workdir) = workdir {
                env.workdir = workdir;
            }
            if let Some(seed) = seed {
                env.seed = seed;
            }
            if let Some(num_runs) = num_runs {
                env.num_runs = num_runs;
            }
            if let Some(batch_size) = batch_size {
                env.batch_size = batch_size;
            }
            if let Some(total_shards) = total_shards {
                env.total_shards = total_shards;
            }
            if let Some(my_shard_index) = my_shard_index {
                env.my_shard_index = my_shard_index;
            }
            run_fuzz(env, exit_on_crash, dictionary, max_len, size_alignment)
        }
        Command::SaveCorpus { dir, workdir } => {
            if let Some(workdir) = workdir {
                env.workdir = workdir;
            }
            env.binary = "colony-demo-target".to_string();
            let filesystem: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
            let saved = save_corpus_to_local_dir(&env, &filesystem, &dir)?;
            tracing::info!(saved, dir = %dir.display(), "corpus saved");
            Ok(ExitCode::SUCCESS)
        }
        Command::ExportCorpus { dir, workdir } => {
            if let Some(workdir) = workdir {
                env.workdir = workdir;
            }
            env.binary = "colony-demo-target".to_string();
            let filesystem: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
            let (added, ignored) = export_corpus_from_local_dir(&env, &filesystem, &dir)?;
            tracing::info!(added, ignored, "corpus exported into shards");
            Ok(ExitCode::SUCCESS)
        }
    }
}
