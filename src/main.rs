use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use jobplane::api::PRINCIPAL_HEADER;
use jobplane::config::Config;
use jobplane::dispatch::{RunRequest, Schedule};
use jobplane::jobs::builtin::builtin_source;
use jobplane::jobs::job::JobArguments;
use jobplane::jobs::registry::{JobRegistry, JobSource};
use jobplane::node::Node;
use jobplane::pod::runner::{run_in_pod, PodEnvironment};
use jobplane::scheduler::Recurrence;
use jobplane::shutdown::install_shutdown_handler;
use jobplane::store::Store;

#[derive(Parser, Debug)]
#[command(name = "jobplane")]
#[command(version)]
#[command(about = "Control plane for long-running jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a jobplane node (API, Beat, worker pool, pod supervisors)
    Server(ServerArgs),

    /// Run one execution inside an execution pod (reads JOBPLANE_* env vars)
    PodRun,

    /// Job execution commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Execution request commands
    Request {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: RequestCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address for the HTTP API (overrides [server].listen_addr)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// Client Arguments (shared by job and request commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// API base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Principal to act as
    #[arg(long, short = 'p', env = "JOBPLANE_PRINCIPAL")]
    principal: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job run
    Submit {
        /// Job class path (e.g. "builtin/demo.Echo")
        class_path: String,

        /// Execution queue (defaults to the job's default queue)
        #[arg(long, short = 'q')]
        queue: Option<String>,

        /// Argument as key=value; the value is parsed as JSON when possible
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Repeat every N seconds
        #[arg(long, conflicts_with = "cron")]
        every: Option<u64>,

        /// Repeat on a 5-field cron expression
        #[arg(long)]
        cron: Option<String>,

        /// First due time (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<chrono::DateTime<chrono::Utc>>,

        /// IANA time zone for the schedule
        #[arg(long)]
        time_zone: Option<String>,

        /// Label for a stored request
        #[arg(long)]
        name: Option<String>,
    },
    /// Get status of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: String,
    },
    /// Print the full log of an execution
    Logs {
        /// Execution ID (UUID)
        execution_id: String,
    },
    /// Cancel an execution
    Cancel {
        /// Execution ID (UUID)
        execution_id: String,
    },
}

// =============================================================================
// Request Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum RequestCommands {
    /// Show an execution request and its executions
    Status { request_id: String },
    /// Approve a request waiting for approval
    Approve { request_id: String },
    /// Deny a request waiting for approval
    Deny { request_id: String },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn job_sources() -> Vec<Arc<dyn JobSource>> {
    vec![Arc::new(builtin_source())]
}

fn parse_arguments(raw: &[String]) -> Result<JobArguments, Box<dyn std::error::Error>> {
    let mut arguments = JobArguments::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid argument {:?}, expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        arguments.insert(key.trim().to_string(), value);
    }
    Ok(arguments)
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

struct ApiClient {
    http: reqwest::Client,
    base: String,
    principal: Option<String>,
}

impl ApiClient {
    fn new(args: &ClientArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: args.addr.trim_end_matches('/').to_string(),
            principal: args.principal.clone(),
        })
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        let builder = match &self.principal {
            Some(p) => builder.header(PRINCIPAL_HEADER, p),
            None => builder,
        };
        let response = builder.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            eprintln!("Error ({}): {}", status, field(&body, "error"));
            if let Some(fields) = body.get("fields").and_then(Value::as_array) {
                for f in fields {
                    eprintln!("  {}: {}", field(f, "field"), field(f, "message"));
                }
            }
            std::process::exit(1);
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<Value, Box<dyn std::error::Error>> {
        self.send(self.http.get(format!("{}{}", self.base, path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.send(self.http.post(format!("{}{}", self.base, path)).json(body))
            .await
    }
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_log_lines(entries: &[Value]) {
    for entry in entries {
        println!(
            "{:<32} {:<8} {}",
            field(entry, "created_at"),
            field(entry, "severity"),
            field(entry, "message")
        );
    }
}

fn print_execution(execution: &Value) {
    println!("Execution ID: {}", field(execution, "id"));
    println!("Job:          {}", field(execution, "class_path"));
    println!("Queue:        {}", field(execution, "queue"));
    println!("Status:       {}", field(execution, "status"));
    if let Some(handle) = execution.get("handle").and_then(Value::as_str) {
        println!("Handle:       {}", handle);
    }
    println!("Created:      {}", field(execution, "created_at"));
    if let Some(started) = execution.get("started_at").and_then(Value::as_str) {
        println!("Started:      {}", started);
    }
    if let Some(finished) = execution.get("finished_at").and_then(Value::as_str) {
        println!("Finished:     {}", finished);
    }
    if let Some(error) = execution.get("error").and_then(Value::as_str) {
        println!("Error:        [{}] {}", field(execution, "error_kind"), error);
    }
    if let Some(result) = execution.get("result").filter(|r| !r.is_null()) {
        println!("Result:       {}", result);
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_format);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    tracing::info!(
        listen_addr = %config.server.listen_addr,
        default_queue = %config.defaults.queue,
        queues = ?config.queue_configs().iter().map(|q| q.name.clone()).collect::<Vec<_>>(),
        beat = config.scheduler.enabled,
        "Starting jobplane node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::build(config, job_sources()).await?;
    node.run(shutdown).await?;

    Ok(())
}

/// Entry point inside an execution pod. Job output goes to stdout as JSON
/// lines; tracing goes to stderr so it never mixes with them.
async fn run_pod() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = match PodEnvironment::from_env() {
        Ok(env) => env,
        Err(e) => {
            tracing::error!(error = %e, "Invalid pod environment");
            return 1;
        }
    };

    let registry = JobRegistry::new(Store::new());
    for source in job_sources() {
        registry.add_source(source).await;
    }
    if let Err(e) = registry.refresh().await {
        tracing::error!(error = %e, "Failed to load job sources");
        return 1;
    }

    let out = Arc::new(Mutex::new(std::io::stdout()));
    if run_in_pod(&registry, env, out).await {
        0
    } else {
        1
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_command(
    client: &ApiClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            class_path,
            queue,
            args,
            every,
            cron,
            start,
            time_zone,
            name,
        } => {
            let recurrence = match (every, cron) {
                (Some(every_secs), _) => Recurrence::Interval { every_secs },
                (None, Some(expression)) => Recurrence::Cron { expression },
                (None, None) => Recurrence::Once,
            };
            let schedule = if recurrence != Recurrence::Once || start.is_some() || time_zone.is_some()
            {
                Some(Schedule {
                    recurrence,
                    start_time: start,
                    time_zone,
                })
            } else {
                None
            };
            let run = RunRequest {
                job_class_path: class_path,
                queue,
                arguments: parse_arguments(&args)?,
                schedule,
                name,
            };
            let response = client.post("/api/run", &serde_json::to_value(&run)?).await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    if let Some(id) = response.get("execution_result_id").and_then(Value::as_str) {
                        println!("Job submitted successfully!");
                        println!("Execution ID: {}", id);
                    } else {
                        println!("Execution request stored.");
                        println!("Request ID:   {}", field(&response, "request_id"));
                    }
                    println!("Status:       {}", field(&response, "status"));
                }
            }
        }
        JobCommands::Status { execution_id } => {
            let execution = client
                .get(&format!("/api/executions/{}", execution_id))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&execution)?,
                OutputFormat::Table => {
                    print_execution(&execution);
                    let tail = execution
                        .get("log_tail")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    if !tail.is_empty() {
                        println!();
                        println!("Recent log:");
                        print_log_lines(&tail);
                    }
                }
            }
        }
        JobCommands::Logs { execution_id } => {
            let logs = client
                .get(&format!("/api/executions/{}/logs", execution_id))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&logs)?,
                OutputFormat::Table => {
                    let entries = logs.as_array().cloned().unwrap_or_default();
                    if entries.is_empty() {
                        println!("No log entries.");
                    } else {
                        println!("{:<32} {:<8} MESSAGE", "TIME", "SEVERITY");
                        println!("{}", "-".repeat(78));
                        print_log_lines(&entries);
                    }
                }
            }
        }
        JobCommands::Cancel { execution_id } => {
            let execution = client
                .post(&format!("/api/executions/{}/cancel", execution_id), &json!({}))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&execution)?,
                OutputFormat::Table => {
                    println!("Cancellation requested.");
                    print_execution(&execution);
                }
            }
        }
    }
    Ok(())
}

async fn handle_request_command(
    client: &ApiClient,
    command: RequestCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (response, action) = match command {
        RequestCommands::Status { request_id } => (
            client.get(&format!("/api/requests/{}", request_id)).await?,
            None,
        ),
        RequestCommands::Approve { request_id } => (
            client
                .post(&format!("/api/requests/{}/approve", request_id), &json!({}))
                .await?,
            Some("approved"),
        ),
        RequestCommands::Deny { request_id } => (
            client
                .post(&format!("/api/requests/{}/deny", request_id), &json!({}))
                .await?,
            Some("denied"),
        ),
    };

    match output_format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let request = response.get("request").unwrap_or(&response);
            if let Some(action) = action {
                println!("Request {}.", action);
            }
            println!("Request ID:  {}", field(request, "id"));
            println!("Job:         {}", field(request, "class_path"));
            println!("Approval:    {}", field(request, "approval"));
            println!("Next due:    {}", field(request, "next_due_at"));
            if let Some(dispatched) = response.get("dispatched").filter(|d| !d.is_null()) {
                println!("Dispatched:  {}", field(dispatched, "id"));
            }
            if let Some(executions) = response.get("executions").and_then(Value::as_array) {
                println!();
                println!("{:<38} {:<10} CREATED", "EXECUTION ID", "STATUS");
                println!("{}", "-".repeat(78));
                for e in executions {
                    println!(
                        "{:<38} {:<10} {}",
                        field(e, "id"),
                        field(e, "status"),
                        field(e, "created_at")
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::PodRun => {
            let code = run_pod().await;
            std::process::exit(code);
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client)?;
            handle_job_command(&api, command, &client.output).await?;
        }
        Commands::Request { client, command } => {
            let api = ApiClient::new(&client)?;
            handle_request_command(&api, command, &client.output).await?;
        }
    }

    Ok(())
}
