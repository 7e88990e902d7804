mod client;
mod config;
mod serve_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use dragnet_core::cron::{NewScheduleRule, ScheduleRuleUpdate};
use dragnet_core::dispatch::NewTask;
use dragnet_store::{TaskPriority, TaskType};

use client::AdminClient;

#[derive(Parser)]
#[command(name = "dragnet", about = "Distributed security reconnaissance control plane")]
struct Cli {
    /// Admin API base URL for client commands
    #[arg(long, global = true, default_value = "http://127.0.0.1:8480")]
    server: String,

    /// Config file path (overrides DRAGNET_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the control plane and admin API
    Serve,
    /// Submit a scan task
    Submit {
        /// Task type (e.g. port_scan, subdomain_enum)
        #[arg(long = "type")]
        task_type: TaskType,
        /// Human-readable task name
        #[arg(long)]
        name: String,
        /// Executor config as a JSON object
        #[arg(long, default_value = "{}")]
        config: String,
        /// Priority: low, normal, high, critical
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,
        /// Timeout in seconds (0 = engine default)
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        /// Maximum retry attempts
        #[arg(long, default_value_t = 0)]
        max_retries: u32,
        /// Task ids this task depends on
        #[arg(long = "depends-on")]
        depends_on: Vec<Uuid>,
        /// Project identifier
        #[arg(long)]
        project: Option<String>,
        /// URL to POST the final summary to
        #[arg(long)]
        callback_url: Option<String>,
    },
    /// Show a task with its result
    Status { task_id: Uuid },
    /// Show a task's progress
    Progress { task_id: Uuid },
    /// Show a task's event ring
    Events { task_id: Uuid },
    /// Cancel a task
    Cancel { task_id: Uuid },
    /// Reopen a terminal task
    Resubmit { task_id: Uuid },
    /// List running tasks
    Running,
    /// List dispatch queues
    Queues,
    /// List worker nodes
    Nodes,
    /// Schedule rule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a schedule rule
    Create {
        #[arg(long)]
        name: String,
        /// Cron expression (5 or 6 fields)
        #[arg(long)]
        cron: String,
        /// IANA timezone for the expression
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Task to clone on each fire
        #[arg(long)]
        template: Uuid,
        /// Disable the rule after this many fires
        #[arg(long)]
        max_runs: Option<u32>,
    },
    /// List schedule rules
    List,
    /// Show scheduler statistics
    Stats,
    /// Enable or disable a rule
    Toggle {
        rule_id: Uuid,
        #[arg(long)]
        enabled: bool,
    },
    /// Delete a rule
    Delete { rule_id: Uuid },
    /// Fire a rule immediately
    Trigger { rule_id: Uuid },
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).expect("serializable"));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.server);

    match cli.command {
        Commands::Init { force } => {
            let path = config::resolve_config_path(cli.config);
            config::write_default(&path, force)?;
            println!("wrote {}", path.display());
        }
        Commands::Serve => {
            let path = config::resolve_config_path(cli.config);
            let server_config = config::load(&path)?;
            serve_cmd::run(server_config).await?;
        }
        Commands::Submit {
            task_type,
            name,
            config,
            priority,
            timeout,
            max_retries,
            depends_on,
            project,
            callback_url,
        } => {
            let config: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&config).context("--config must be a JSON object")?;
            let mut new_task = NewTask::new(name, task_type);
            new_task.priority = priority;
            new_task.config = config;
            new_task.timeout_secs = timeout;
            new_task.max_retries = max_retries;
            new_task.depends_on = depends_on;
            new_task.project_id = project;
            new_task.callback_url = callback_url;
            print_json(&client.submit(new_task).await?);
        }
        Commands::Status { task_id } => print_json(&client.task(task_id).await?),
        Commands::Progress { task_id } => print_json(&client.progress(task_id).await?),
        Commands::Events { task_id } => print_json(&client.events(task_id).await?),
        Commands::Cancel { task_id } => {
            client.cancel(task_id).await?;
            println!("cancellation requested for {task_id}");
        }
        Commands::Resubmit { task_id } => print_json(&client.resubmit(task_id).await?),
        Commands::Running => print_json(&client.running().await?),
        Commands::Queues => print_json(&client.queues().await?),
        Commands::Nodes => print_json(&client.nodes().await?),
        Commands::Schedule { command } => match command {
            ScheduleCommands::Create {
                name,
                cron,
                timezone,
                template,
                max_runs,
            } => {
                let rule = NewScheduleRule {
                    name,
                    cron_expr: cron,
                    timezone,
                    template_id: template,
                    max_runs,
                    enabled: true,
                };
                print_json(&client.create_schedule(rule).await?);
            }
            ScheduleCommands::List => print_json(&client.list_schedules().await?),
            ScheduleCommands::Stats => print_json(&client.schedule_stats().await?),
            ScheduleCommands::Toggle { rule_id, enabled } => {
                let update = ScheduleRuleUpdate {
                    enabled: Some(enabled),
                    ..ScheduleRuleUpdate::default()
                };
                print_json(&client.update_schedule(rule_id, update).await?);
            }
            ScheduleCommands::Delete { rule_id } => {
                client.delete_schedule(rule_id).await?;
                println!("deleted {rule_id}");
            }
            ScheduleCommands::Trigger { rule_id } => {
                print_json(&client.trigger_schedule(rule_id).await?);
            }
        },
    }

    Ok(())
}
