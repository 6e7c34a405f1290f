use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vmbackd::core::models::{BackupMode, Cadence, JobRequest, JobStatus, ScheduleDefinition};
use vmbackd::core::orchestrator::DaemonStatus;
use vmbackd::core::transfer_engine::{TransferEngineType, create_engine};
use vmbackd::db::jobs::{BackupStatistics, JobHistoryEntry};
use vmbackd::logging::{self, LogConfig};
use vmbackd::rpc::RpcClient;
use vmbackd::store::ScheduleStore;
use vmbackd::{adapters, config::AppConfig, context::AppContext, core::Orchestrator, db};

#[derive(Parser)]
#[command(name = "vmbackd")]
#[command(about = "Scheduled VM backups over rsync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon RPC address, defaults to `rpc_bind` from the configuration
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup daemon in the foreground
    Daemon(DaemonArgs),
    /// Show daemon status
    Status,
    /// Start a backup job immediately
    Run(RunArgs),
    /// List VMs known to the hypervisor
    Vms,
    /// Print the effective configuration as TOML
    Config,
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    schedules_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    transfer_engine: Option<TransferEngineType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    parallel_vms: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    /// VM to back up, repeatable
    #[arg(long = "vm", required = true)]
    vms: Vec<String>,

    #[arg(long, value_enum, default_value_t = BackupMode::Incremental)]
    mode: BackupMode,

    /// Log what would happen without touching VMs or the backup host
    #[arg(long)]
    dry_run: bool,

    /// Copy live disks without taking a snapshot first
    #[arg(long)]
    no_snapshot: bool,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    List,
    /// Add a schedule, e.g. `--kind weekly --at sunday:03:00`
    Add {
        #[arg(long)]
        name: String,
        #[arg(long = "vm", required = true)]
        vms: Vec<String>,
        /// daily, weekly or monthly
        #[arg(long)]
        kind: String,
        /// "HH:MM", "weekday:HH:MM" or "day:HH:MM" depending on the kind
        #[arg(long)]
        at: String,
        #[arg(long, value_enum, default_value_t = BackupMode::Incremental)]
        mode: BackupMode,
        #[arg(long)]
        disabled: bool,
    },
    Remove {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    /// Schedules that would fire if the daemon polled now
    Due,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Jobs dispatched since the daemon started
    List,
    Get {
        id: String,
    },
    /// Finished jobs from the history database
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(args) => {
            let config = AppConfig::new(Some(&args))?;
            run_daemon(config).await.context("Daemon failed")
        }
        Commands::Config => {
            print!("{}", AppConfig::new(None::<&DaemonArgs>)?.to_toml()?);
            Ok(())
        }
        command => run_client(cli.rpc, command).await,
    }
}

async fn run_client(rpc: Option<SocketAddr>, command: Commands) -> Result<()> {
    let addr = match rpc {
        Some(addr) => addr,
        None => AppConfig::new(None::<&DaemonArgs>)?.rpc_bind,
    };
    let client = RpcClient::new(addr);

    match command {
        Commands::Daemon(_) | Commands::Config | Commands::Status => {
            let status: DaemonStatus = client.call_no_params("daemon.status").await?;
            println!("vmbackd {} (up {}s)", status.version, status.uptime_secs);
            println!(
                "schedules: {} ({} enabled), active jobs: {}",
                status.schedules, status.enabled_schedules, status.active_jobs
            );
            match status.next_run {
                Some(next) => println!("next run: {}", next),
                None => println!("next run: none"),
            }
            if status.simulation {
                println!("simulation mode");
            }
        }
        Commands::Run(args) => {
            let request = JobRequest {
                vms: args.vms,
                mode: args.mode,
                dry_run: args.dry_run,
                use_snapshots: !args.no_snapshot,
            };
            let started: serde_json::Value = client.call_with("jobs.run", &request).await?;
            println!("job started: {}", started["job_id"].as_str().unwrap_or_default());
        }
        Commands::Vms => print_json::<serde_json::Value>(&client, "vms.list", None).await?,
        Commands::Schedule(cmd) => run_schedule_command(&client, cmd).await?,
        Commands::Jobs(cmd) => run_jobs_command(&client, cmd).await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let store = ScheduleStore::open(&config.schedules_file)
        .await
        .context("Refusing to start with an unreadable schedule store")?;
    let db_conn = db::init(&config.database_file).await?;
    let hypervisor = adapters::get_hypervisor(config.simulation, &config.libvirt_uri);
    let transfer = create_engine(config.transfer_engine, &config.remote);

    let ctx = AppContext::new(config, db_conn, store, hypervisor, transfer);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
        signal.cancel();
    });

    Orchestrator::new(ctx).start(shutdown).await
}

async fn run_schedule_command(client: &RpcClient, cmd: ScheduleCommand) -> Result<()> {
    match cmd {
        ScheduleCommand::List => {
            let schedules: Vec<ScheduleDefinition> =
                client.call_no_params("schedules.list").await?;
            if schedules.is_empty() {
                println!("no schedules");
            }
            for def in schedules {
                println!(
                    "{}  {:<20} {:<8} {:<16} {:<11} {:<8} next: {}  last: {:?}",
                    def.id,
                    def.name,
                    def.cadence.kind(),
                    def.cadence.to_string(),
                    def.mode,
                    if def.enabled { "enabled" } else { "disabled" },
                    def.next_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    def.last_outcome,
                );
            }
        }
        ScheduleCommand::Add {
            name,
            vms,
            kind,
            at,
            mode,
            disabled,
        } => {
            let cadence = Cadence::parse(&kind, &at)?;
            let params = json!({
                "name": name,
                "vms": vms,
                "cadence": cadence,
                "mode": mode,
                "enabled": !disabled,
            });
            let def: ScheduleDefinition = client.call("schedules.add", Some(params)).await?;
            println!("schedule added: {}", def.id);
            if let Some(next) = def.next_run {
                println!("next run: {}", next);
            }
        }
        ScheduleCommand::Remove { id } => {
            let _: ScheduleDefinition = client.call("schedules.remove", Some(json!({ "id": id }))).await?;
            println!("schedule removed: {}", id);
        }
        ScheduleCommand::Enable { id } => {
            let def: ScheduleDefinition =
                client.call("schedules.enable", Some(json!({ "id": id }))).await?;
            println!("schedule enabled, next run: {:?}", def.next_run);
        }
        ScheduleCommand::Disable { id } => {
            let _: ScheduleDefinition =
                client.call("schedules.disable", Some(json!({ "id": id }))).await?;
            println!("schedule disabled: {}", id);
        }
        ScheduleCommand::Due => {
            let due: Vec<String> = client.call_no_params("schedules.due").await?;
            if due.is_empty() {
                println!("nothing due");
            }
            for id in due {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

async fn run_jobs_command(client: &RpcClient, cmd: JobsCommand) -> Result<()> {
    match cmd {
        JobsCommand::List => {
            let jobs: Vec<JobStatus> = client.call_no_params("jobs.list").await?;
            for job in jobs {
                let took = job
                    .duration_secs()
                    .map(|secs| format!("{}s", secs))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<9} {:<11} {:<6} {}  {}",
                    job.id,
                    job.state.as_str(),
                    job.mode,
                    took,
                    job.vms.join(","),
                    job.error.unwrap_or_default()
                );
            }
        }
        JobsCommand::Get { id } => {
            print_json::<JobStatus>(client, "jobs.get", Some(json!({ "id": id }))).await?
        }
        JobsCommand::History { limit, offset } => {
            print_json::<Vec<JobHistoryEntry>>(
                client,
                "jobs.history",
                Some(json!({ "limit": limit, "offset": offset })),
            )
            .await?
        }
        JobsCommand::Stats => print_json::<BackupStatistics>(client, "jobs.stats", None).await?,
    }
    Ok(())
}

async fn print_json<T: DeserializeOwned + Serialize>(
    client: &RpcClient,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<()> {
    let value: T = client.call(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
