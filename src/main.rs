use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bucket_queue::config::{QueueServerConfig, RunnerConfig, WorkerConfig};
use bucket_queue::deploy::DeploymentDestination;
use bucket_queue::node::QueueNode;
use bucket_queue::runner::TestRunner;
use bucket_queue::scheduler::bucket::{
    JobGroupId, JobId, PrioritizedJob, Priority, TestEntry, TestEntryConfiguration, TestOutcome,
};
use bucket_queue::scheduler::job::JobState;
use bucket_queue::scheduler::split::ScheduleStrategy;
use bucket_queue::server::{QueueClient, QueueConnection};
use bucket_queue::shutdown::install_shutdown_handler;
use bucket_queue::worker::{ProcessTestExecutor, WorkerAgent};

#[derive(Parser, Debug)]
#[command(name = "bucket-queue")]
#[command(version)]
#[command(about = "A distributed queue that spreads test buckets over a worker fleet")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a queue server
    Server(ServerArgs),

    /// Start a worker that runs tests from a queue
    Worker(WorkerArgs),

    /// Schedule tests, wait for them and print the results
    Run(RunArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Queue and worker introspection
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:41000")]
    listen: SocketAddr,

    /// Seconds between worker heartbeats
    #[arg(long, default_value = "30")]
    report_alive_interval: u64,

    /// Seconds without a heartbeat before a worker is silent
    #[arg(long, default_value = "90")]
    silence_timeout: u64,

    /// Seconds a freshly dequeued bucket is trusted without a heartbeat listing it
    #[arg(long, default_value = "60")]
    dequeue_grace_period: u64,

    /// Seconds between stuck bucket scans
    #[arg(long, default_value = "30")]
    scan_interval: u64,

    /// Seconds workers wait before asking again when nothing is dequeueable
    #[arg(long, default_value = "30")]
    check_again_after: u64,

    /// Tell workers the queue is empty once every job is depleted
    #[arg(long)]
    wait_for_depletion: bool,

    /// Worker owned by this queue, as "worker_id=user@host:port" (repeatable)
    #[arg(long = "deployment")]
    deployments: Vec<String>,

    /// Coordination endpoint deciding which workers this queue may use
    #[arg(long)]
    coordination_url: Option<String>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Queue server URL
    #[arg(long, short = 'q', default_value = "http://127.0.0.1:41000")]
    queue_url: String,

    /// Worker ID (defaults to a random one)
    #[arg(long)]
    worker_id: Option<String>,

    /// Capability as "name=value" (repeatable)
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Per-test timeout in seconds
    #[arg(long, default_value = "600")]
    test_timeout: u64,

    /// Command run once per test, with TEST_CLASS_NAME and TEST_METHOD_NAME set
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Individual,
    FixedBucketSize,
    EquallyDivided,
    Progressive,
    Unsplit,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Job ID (defaults to a random one)
    #[arg(long)]
    job_id: Option<String>,

    /// Job group ID (defaults to the job ID)
    #[arg(long)]
    job_group_id: Option<String>,

    /// Job priority, 0..=999
    #[arg(long, default_value = "500")]
    priority: u16,

    /// Job group priority, 0..=999
    #[arg(long, default_value = "500")]
    group_priority: u16,

    #[arg(long, value_enum, default_value = "individual")]
    strategy: StrategyArg,

    /// Bucket size for the fixed-bucket-size strategy
    #[arg(long, default_value = "10")]
    bucket_size: usize,

    /// Retries per failed test
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Seconds between job state polls
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// JSON file with a list of test entry configurations
    #[arg(long)]
    tests_file: Option<PathBuf>,

    /// Tests as "Class/method"
    tests: Vec<String>,
}

// =============================================================================
// Client Arguments (shared by job and queue commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Queue server URL
    #[arg(long, short = 'q', default_value = "http://127.0.0.1:41000")]
    queue_url: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Show whether a job is still running
    State { job_id: String },
    /// Print the results collected so far
    Results { job_id: String },
    /// Delete a job and drop its buckets
    Delete { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Bucket counts and running jobs
    State,
    /// Known workers and their health
    Workers,
    /// Stop handing buckets to a worker
    Block { worker_id: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ResultLine {
    test: String,
    outcome: TestOutcome,
    duration_ms: u64,
    message: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(default: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn parse_capability(raw: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid capability {:?}, expected name=value", raw))?;
    Ok((name.to_string(), value.to_string()))
}

fn parse_test(raw: &str) -> Result<TestEntry, Box<dyn std::error::Error>> {
    let (class_name, method_name) = raw
        .split_once('/')
        .ok_or_else(|| format!("invalid test {:?}, expected Class/method", raw))?;
    Ok(TestEntry::new(class_name, method_name))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_state(job_id: &JobId, state: &JobState, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => print_json(state),
        OutputFormat::Table => {
            println!("{:<40} {}", "JOB", "STATE");
            println!("{:<40} {}", job_id.as_str(), state);
            Ok(())
        }
    }
}

fn result_lines(results: &bucket_queue::scheduler::job::JobResults) -> Vec<ResultLine> {
    results
        .testing_results
        .iter()
        .flat_map(|r| r.results.iter())
        .map(|r| ResultLine {
            test: r.test_entry.test_name().to_string(),
            outcome: r.outcome,
            duration_ms: r.duration_ms,
            message: r.message.clone(),
        })
        .collect()
}

fn print_results(
    lines: &[ResultLine],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => print_json(&lines),
        OutputFormat::Table => {
            println!("{:<60} {:<8} {:>10}", "TEST", "OUTCOME", "MS");
            for line in lines {
                println!(
                    "{:<60} {:<8} {:>10}",
                    line.test,
                    format!("{:?}", line.outcome).to_uppercase(),
                    line.duration_ms
                );
                if let Some(message) = &line.message {
                    println!("    {}", message);
                }
            }
            Ok(())
        }
    }
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = QueueServerConfig::new(args.listen)
        .with_worker_silence_timeout(Duration::from_secs(args.silence_timeout))
        .with_dequeue_grace_period(Duration::from_secs(args.dequeue_grace_period))
        .with_stuck_bucket_scan_interval(Duration::from_secs(args.scan_interval))
        .with_check_again_after(Duration::from_secs(args.check_again_after))
        .with_wait_for_all_queues_to_deplete(args.wait_for_depletion);
    config.report_alive_interval = Duration::from_secs(args.report_alive_interval);
    for raw in &args.deployments {
        let destination = DeploymentDestination::parse(raw)
            .ok_or_else(|| format!("invalid deployment {:?}, expected id=user@host:port", raw))?;
        config = config.with_deployment(destination);
    }
    if let Some(url) = args.coordination_url {
        config = config.with_coordination_url(url);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        deployments = config.default_deployments.len(),
        coordination = ?config.coordination_url,
        "Starting queue server"
    );

    let shutdown = install_shutdown_handler();
    QueueNode::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = args
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
    let mut config = WorkerConfig::new(worker_id, args.queue_url.clone())
        .with_command(args.command)
        .with_test_timeout(Duration::from_secs(args.test_timeout));
    for raw in &args.capabilities {
        let (name, value) = parse_capability(raw)?;
        config = config.with_capability(name, value);
    }

    let executor = ProcessTestExecutor::new(config.command.clone(), config.test_timeout)?;
    let connection = Arc::new(QueueClient::new(args.queue_url));
    let agent = WorkerAgent::new(config, connection, Arc::new(executor));

    let shutdown = install_shutdown_handler();
    let summary = agent.run(shutdown).await?;
    tracing::info!(
        buckets = summary.buckets_executed,
        reason = ?summary.stop_reason,
        "Worker finished"
    );
    Ok(())
}

// =============================================================================
// Run
// =============================================================================

fn strategy(args: &RunArgs) -> ScheduleStrategy {
    match args.strategy {
        StrategyArg::Individual => ScheduleStrategy::Individual,
        StrategyArg::FixedBucketSize => ScheduleStrategy::FixedBucketSize {
            size: args.bucket_size,
        },
        StrategyArg::EquallyDivided => ScheduleStrategy::EquallyDivided,
        StrategyArg::Progressive => ScheduleStrategy::Progressive,
        StrategyArg::Unsplit => ScheduleStrategy::Unsplit,
    }
}

async fn run_tests(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut configurations: Vec<TestEntryConfiguration> = match &args.tests_file {
        Some(path) => serde_json::from_slice(&tokio::fs::read(path).await?)?,
        None => Vec::new(),
    };
    for raw in &args.tests {
        let mut configuration = TestEntryConfiguration::new(parse_test(raw)?);
        configuration.execution.number_of_retries = args.retries;
        configurations.push(configuration);
    }
    if configurations.is_empty() {
        return Err("no tests given, pass Class/method arguments or --tests-file".into());
    }

    let job_id = JobId::new(
        args.job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );
    let job = PrioritizedJob {
        job_group_id: JobGroupId::new(
            args.job_group_id
                .clone()
                .unwrap_or_else(|| job_id.to_string()),
        ),
        job_id,
        job_priority: Priority::new(args.priority)?,
        job_group_priority: Priority::new(args.group_priority)?,
    };

    let connection = Arc::new(QueueClient::new(args.client.queue_url.clone()));
    let runner = TestRunner::new(
        connection,
        RunnerConfig::default().with_job_poll_interval(Duration::from_secs(args.poll_interval)),
    );

    let shutdown = install_shutdown_handler();
    let outcome = runner
        .run(job, strategy(&args), configurations, shutdown)
        .await?;

    let lines = result_lines(&outcome.results);
    print_results(&lines, &args.client.output)?;
    let failed = lines
        .iter()
        .filter(|l| l.outcome != TestOutcome::Passed)
        .count();
    if failed > 0 {
        return Err(format!("{} of {} tests did not pass", failed, lines.len()).into());
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job(client: ClientArgs, command: JobCommands) -> Result<(), Box<dyn std::error::Error>> {
    let connection = QueueClient::new(client.queue_url);
    match command {
        JobCommands::State { job_id } => {
            let job_id = JobId::new(job_id);
            let state = connection.job_state(&job_id).await?;
            print_state(&job_id, &state, &client.output)
        }
        JobCommands::Results { job_id } => {
            let results = connection.job_results(&JobId::new(job_id)).await?;
            print_results(&result_lines(&results), &client.output)
        }
        JobCommands::Delete { job_id } => {
            connection.delete_job(&JobId::new(job_id.clone())).await?;
            println!("Job {} deleted", job_id);
            Ok(())
        }
    }
}

async fn handle_queue(
    client: ClientArgs,
    command: QueueCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = QueueClient::new(client.queue_url);
    match command {
        QueueCommands::State => {
            let state = connection.queue_state().await?;
            match client.output {
                OutputFormat::Json => print_json(&state),
                OutputFormat::Table => {
                    println!("Enqueued buckets: {}", state.enqueued_buckets);
                    println!("Dequeued buckets: {}", state.dequeued_buckets);
                    println!("Running jobs:     {}", state.running_jobs.len());
                    for job_id in &state.running_jobs {
                        println!("  {}", job_id);
                    }
                    Ok(())
                }
            }
        }
        QueueCommands::Workers => {
            let workers = connection.worker_statuses().await?;
            match client.output {
                OutputFormat::Json => print_json(&workers),
                OutputFormat::Table => {
                    println!("{:<30} {:<15} {:>8} {:>12}", "WORKER", "STATUS", "BUCKETS", "LAST SEEN");
                    for w in &workers {
                        println!(
                            "{:<30} {:<15} {:>8} {:>10}ms",
                            w.worker_id.as_str(),
                            w.status.to_string(),
                            w.bucket_ids_being_processed.len(),
                            w.last_seen_ms_ago
                        );
                    }
                    Ok(())
                }
            }
        }
        QueueCommands::Block { worker_id } => {
            connection
                .block_worker(&bucket_queue::scheduler::bucket::WorkerId::new(worker_id.clone()))
                .await?;
            println!("Worker {} blocked", worker_id);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            init_tracing("info");
            run_server(server_args).await
        }
        Commands::Worker(worker_args) => {
            init_tracing("info");
            run_worker(worker_args).await
        }
        Commands::Run(run_args) => {
            init_tracing("warn");
            run_tests(run_args).await
        }
        Commands::Job { client, command } => {
            init_tracing("warn");
            handle_job(client, command).await
        }
        Commands::Queue { client, command } => {
            init_tracing("warn");
            handle_queue(client, command).await
        }
    }
}
