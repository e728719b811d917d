//! Tessera CLI: corpus-to-graph extraction runner.
//!
//! Usage:
//!   tessera plan <corpus>
//!   tessera run <corpus> --engine <command> [--state-dir path]
//!   tessera resume <corpus> --engine <command> [--force]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tessera::{
    CancelToken, CheckpointStore, Corpus, DirectoryCorpus, Orchestrator, OrchestratorError,
    RunConfig, RunReport, SessionFactory, SubprocessFactory,
};

#[derive(Parser)]
#[command(
    name = "tessera",
    version = tessera::VERSION,
    about = "Corpus-to-graph extraction orchestration"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the chunk plan for a corpus without running anything
    Plan {
        /// Corpus root directory
        corpus: PathBuf,
        /// Chunk size target in bytes
        #[arg(long, default_value_t = 16 * 1024)]
        chunk_size: u64,
    },
    /// Run extraction from scratch
    Run {
        /// Corpus root directory
        corpus: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Resume an interrupted run from its latest checkpoint
    Resume {
        /// Corpus root directory
        corpus: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
        /// Reprocess completed chunks too
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct RunOpts {
    /// Engine command to spawn per session, e.g. "reasoner --json"
    #[arg(long)]
    engine: String,
    /// Checkpoint directory
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Engine sessions in the pool
    #[arg(long, default_value_t = 4)]
    pool_size: usize,
    /// Concurrent chunk workers
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Chunk size target in bytes
    #[arg(long, default_value_t = 16 * 1024)]
    chunk_size: u64,
    /// Per-chunk timeout in seconds
    #[arg(long, default_value_t = 120)]
    chunk_timeout: u64,
}

/// Default checkpoint directory (~/.local/share/tessera/checkpoints)
fn default_state_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("tessera").join("checkpoints")
}

fn config_from(opts: &RunOpts) -> RunConfig {
    RunConfig {
        pool_size: opts.pool_size,
        worker_count: opts.workers,
        chunk_size_target: opts.chunk_size,
        chunk_timeout: Duration::from_secs(opts.chunk_timeout),
        ..RunConfig::default()
    }
}

fn engine_factory(command: &str) -> Result<Arc<dyn SessionFactory>, String> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| "empty engine command".to_string())?;
    let args = parts.map(String::from).collect();
    Ok(Arc::new(SubprocessFactory::new(program, args)))
}

fn cmd_plan(corpus: PathBuf, chunk_size: u64) -> i32 {
    let corpus = DirectoryCorpus::new(corpus);
    match tessera::ChunkPlanner::new(chunk_size).plan(&corpus) {
        Ok(chunks) => {
            for chunk in &chunks {
                println!(
                    "{}  {} unit(s), ~{} bytes",
                    chunk.id,
                    chunk.units.len(),
                    chunk.size_estimate
                );
            }
            println!("{} chunk(s) total", chunks.len());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_run(corpus: PathBuf, opts: RunOpts, resume: Option<bool>) -> i32 {
    let factory = match engine_factory(&opts.engine) {
        Ok(factory) => factory,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let state_dir = opts.state_dir.clone().unwrap_or_else(default_state_dir);
    let checkpoints = match CheckpointStore::open(&state_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: failed to open checkpoint store: {}", e);
            return 1;
        }
    };

    let orchestrator = Orchestrator::new(config_from(&opts), factory, checkpoints);
    let corpus: Arc<dyn Corpus> = Arc::new(DirectoryCorpus::new(corpus));

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; finishing in-flight chunks");
            ctrl_c_cancel.cancel("interrupt signal");
        }
    });

    let result: Result<RunReport, OrchestratorError> = match resume {
        Some(force) => orchestrator.resume(corpus, cancel, force).await,
        None => orchestrator.run(corpus, cancel).await,
    };

    match result {
        Ok(report) => {
            match report.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: failed to render report: {}", e);
                    return 1;
                }
            }
            report.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries the JSON report.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Plan { corpus, chunk_size } => cmd_plan(corpus, chunk_size),
        Commands::Run { corpus, opts } => cmd_run(corpus, opts, None).await,
        Commands::Resume {
            corpus,
            opts,
            force,
        } => cmd_run(corpus, opts, Some(force)).await,
    };
    std::process::exit(code);
}
