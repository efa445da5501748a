mod commands;

use clap::{Args, Parser, Subcommand};

use dts_types::JobStatus;

#[derive(Parser)]
#[command(name = "dts", about = "Distributed task scheduler CLI")]
struct Cli {
    /// Bearer token for the services (overrides config)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Use the local database directly instead of the configured services
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST server with the fire loop
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage jobs
    #[command(subcommand)]
    Job(JobCommand),
    /// Manage scheduled runs
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Inspect and finalize executions
    #[command(subcommand)]
    Execution(ExecutionCommand),
    /// Check that the services are reachable
    Health,
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Create a job
    Create {
        #[arg(long)]
        name: String,
        /// 5- or 6-field cron expression, or @hourly/@daily/...
        #[arg(long)]
        cron: String,
        #[arg(long, default_value = "")]
        description: String,
        /// 1 (lowest) to 5
        #[arg(long, default_value_t = 3)]
        priority: i32,
        #[arg(long, default_value_t = 0)]
        max_retries: i32,
        #[arg(long, default_value_t = 0)]
        timeout_seconds: i64,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },
    /// Show a job with its runs and executions
    Get { id: String },
    /// List jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Edit mutable fields of a job
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        max_retries: Option<i32>,
        #[arg(long)]
        timeout_seconds: Option<i64>,
        /// Replace all metadata, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },
    /// Delete a job; its execution history is kept
    Delete { id: String },
    /// Cancel all runs of a job and mark it cancelled
    Cancel {
        id: String,
        /// Only retry marking the job cancelled after a partial failure
        #[arg(long)]
        resume: bool,
    },
    /// Start the job now
    Run {
        id: String,
        #[command(flatten)]
        resources: ResourceArgs,
    },
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Schedule a run of a job
    Create {
        job_id: String,
        #[command(flatten)]
        resources: ResourceArgs,
        /// RFC 3339 fire time; defaults to the next cron time
        #[arg(long)]
        at: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// List active scheduled runs
    List {
        #[arg(long)]
        job: Option<String>,
    },
    /// Cancel a scheduled run (succeeds if it is already gone)
    Cancel { id: String },
}

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Execution history of a job, newest first
    List { job_id: String },
    /// Record how an execution ended
    Finish {
        id: String,
        #[arg(long, conflicts_with = "failed", required_unless_present = "failed")]
        succeeded: Option<String>,
        #[arg(long)]
        failed: Option<String>,
    },
}

#[derive(Args, Clone, Copy)]
pub struct ResourceArgs {
    #[arg(long, default_value_t = 1.0)]
    cpu: f64,
    #[arg(long, default_value_t = 1.0)]
    memory: f64,
    #[arg(long, default_value_t = 1.0)]
    storage: f64,
}

impl From<ResourceArgs> for dts_types::Resources {
    fn from(args: ResourceArgs) -> Self {
        dts_types::Resources::new(args.cpu, args.memory, args.storage)
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = dts_config::load_config()?;
    if let Some(token) = cli.token {
        config.services.auth_token = Some(token);
    }

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { port } => rt.block_on(dts_server::start_server(config, port)),
        Commands::Health => rt.block_on(commands::health(&config)),
        Commands::Job(command) => {
            rt.block_on(async {
                let orch = commands::orchestrator(&config, cli.local).await?;
                commands::job(&orch, command).await
            })
        }
        Commands::Schedule(command) => {
            rt.block_on(async {
                let orch = commands::orchestrator(&config, cli.local).await?;
                commands::schedule(&orch, command).await
            })
        }
        Commands::Execution(command) => {
            rt.block_on(async {
                let orch = commands::orchestrator(&config, cli.local).await?;
                commands::execution(&orch, command).await
            })
        }
    }
}
