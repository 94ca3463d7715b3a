mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use annotflow_core::Tier;
use annotflow_infra::PipelineConfig;
use annotflow_observability::{LogFormat, LogOptions};

#[derive(Parser, Debug)]
#[command(name = "annotflow-worker", about = "Annotation job pipeline workers")]
struct Cli {
    /// Log line format: json or text
    #[arg(long, global = true, env = "ANNOTFLOW_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every pipeline component in this process until Ctrl-C
    Run(RunArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Processing tool; called with the downloaded input path as its last argument
    #[arg(long, env = "ANNOTFLOW_TOOL")]
    tool: PathBuf,

    /// Extra arguments placed before the input path
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    tool_args: Vec<String>,

    /// Root of the filesystem object store
    #[arg(long, env = "ANNOTFLOW_DATA_DIR", default_value = "annotflow-data")]
    data_dir: PathBuf,

    /// Scratch directory for inputs and tool outputs (overrides ANNOTFLOW_SCRATCH_DIR)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Keep job records in Postgres instead of memory
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Use Redis Streams queues instead of in-process ones
    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// How often to check cold storage for finished retrievals
    #[arg(long, default_value_t = 5)]
    cold_tick_secs: u64,

    /// Input files to submit once the workers are up
    #[arg(long = "submit")]
    submit: Vec<PathBuf>,

    /// Owner of submitted files
    #[arg(long, default_value = "local")]
    user: String,

    #[arg(long, default_value = "local@localhost")]
    email: String,

    #[arg(long, value_enum, default_value_t = TierArg::Free)]
    tier: TierArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TierArg {
    Free,
    Premium,
}

impl From<TierArg> for Tier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Free => Tier::Free,
            TierArg::Premium => Tier::Premium,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    annotflow_observability::init_with(&LogOptions {
        format: cli.log_format,
        ..LogOptions::default()
    });

    let config = PipelineConfig::from_env()?;
    match cli.command {
        Command::Run(args) => run::run(config, args).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
