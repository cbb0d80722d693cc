//! standctl CLI - command-line client for the stand server
//!
//! Reserves units, releases them and runs commands on reserved devices
//! through the server's REST API.

use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process;
use std::time::Duration;
use tracing::{debug, error, info};

/// standctl CLI - stand reservation and remote command tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server URL to connect to
    #[arg(
        short,
        long,
        default_value = "http://localhost:8080",
        env = "STANDCTL_URL"
    )]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Quick health check (for Docker healthcheck)
    Health,

    /// List units of the stand
    Units {
        /// `device` or `pin`
        #[arg(long)]
        kind: Option<String>,

        /// Unit type, e.g. a device model
        #[arg(long = "type")]
        unit_type: Option<String>,

        /// `available` or `leased`
        #[arg(long)]
        status: Option<String>,

        /// Capacity group
        #[arg(long)]
        group: Option<String>,
    },

    /// List capacity groups and their usage
    Groups,

    /// List reservations
    Reservations {
        /// Only reservations still holding units
        #[arg(long)]
        active: bool,
    },

    /// Reserve units, e.g. `reserve -r ci --count tedix-v1-02=1 --count power=2`
    Reserve {
        /// Who the units are reserved for
        #[arg(short, long, env = "USER")]
        requester: String,

        /// `<unit_type>=<count>`, repeatable
        #[arg(short, long = "count", value_parser = parse_count, required = true)]
        counts: Vec<(String, u32)>,

        /// Release automatically after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Release a reservation
    Release {
        /// Reservation ID
        reservation_id: String,
    },

    /// Release the reservation holding a unit
    ReleaseUnit {
        /// Unit ID
        unit_id: String,
    },

    /// Remote command tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

/// Options shared by every submission
#[derive(clap::Args, Debug)]
struct SubmitOptions {
    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Total attempts allowed
    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds between attempts
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Poll until the task finishes
    #[arg(short, long)]
    wait: bool,
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// Run a shell command over SSH
    Exec {
        unit_id: String,
        command: String,

        /// Shell user
        #[arg(long)]
        user: Option<String>,

        #[command(flatten)]
        options: SubmitOptions,
    },

    /// Read what the serial console prints
    Read {
        unit_id: String,

        #[arg(long)]
        baudrate: Option<u32>,

        #[command(flatten)]
        options: SubmitOptions,
    },

    /// Write text to the serial console
    Write {
        unit_id: String,
        text: String,

        #[arg(long)]
        baudrate: Option<u32>,

        #[command(flatten)]
        options: SubmitOptions,
    },

    /// Write text to the serial console, then read the reply
    WriteRead {
        unit_id: String,
        text: String,

        #[arg(long)]
        baudrate: Option<u32>,

        #[command(flatten)]
        options: SubmitOptions,
    },

    /// Show task status and history
    Status {
        task_id: String,

        /// Poll until the task finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// List tasks
    List {
        /// e.g. `PENDING`, `FAILURE`
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        unit: Option<String>,
    },

    /// Cancel a task that has not started yet
    Cancel { task_id: String },
}

fn parse_count(input: &str) -> Result<(String, u32), String> {
    let (unit_type, count) = input
        .split_once('=')
        .ok_or_else(|| format!("expected <unit_type>=<count>, got '{}'", input))?;

    let unit_type = unit_type.trim();
    if unit_type.is_empty() {
        return Err("unit type must not be empty".to_string());
    }

    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid count '{}': {}", count, e))?;

    Ok((unit_type.to_string(), count))
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let api = format!("{}/api/v1", cli.url.trim_end_matches('/'));

    let result = match cli.command {
        Commands::Health => handle_health(&client, &api).await,
        Commands::Units {
            kind,
            unit_type,
            status,
            group,
        } => {
            let query: Vec<(&str, String)> = [
                ("kind", kind),
                ("unit_type", unit_type),
                ("status", status),
                ("group", group),
            ]
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
            print_response(client.get(format!("{}/units", api)).query(&query)).await
        }
        Commands::Groups => print_response(client.get(format!("{}/groups", api))).await,
        Commands::Reservations { active } => {
            print_response(
                client
                    .get(format!("{}/reservations", api))
                    .query(&[("active", active)]),
            )
            .await
        }
        Commands::Reserve {
            requester,
            counts,
            ttl,
        } => handle_reserve(&client, &api, requester, counts, ttl).await,
        Commands::Release { reservation_id } => {
            print_response(client.delete(format!("{}/reservations/{}", api, reservation_id)))
                .await
        }
        Commands::ReleaseUnit { unit_id } => {
            print_response(client.delete(format!("{}/reservations/by-unit/{}", api, unit_id)))
                .await
        }
        Commands::Task { command } => handle_task(&client, &api, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Send a request and return its JSON body, turning API errors into failures
async fn send(request: RequestBuilder) -> anyhow::Result<Value> {
    let response = request.send().await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }

    match body["error"]["message"].as_str() {
        Some(message) => anyhow::bail!("{} ({})", message, status),
        None => anyhow::bail!("request failed with status: {}", status),
    }
}

async fn print_response(request: RequestBuilder) -> anyhow::Result<()> {
    let response = send(request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn handle_health(client: &Client, api: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", api);
    let response = client.get(&url).send().await?;

    if response.status().is_success() {
        let json: Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&json)?);
        Ok(())
    } else {
        anyhow::bail!("Health check failed with status: {}", response.status())
    }
}

async fn handle_reserve(
    client: &Client,
    api: &str,
    requester: String,
    counts: Vec<(String, u32)>,
    ttl: Option<u64>,
) -> anyhow::Result<()> {
    let requested_counts: BTreeMap<String, u32> = counts.into_iter().collect();
    info!(requester = %requester, ?requested_counts, "Reserving units");

    let body = json!({
        "requester": requester,
        "requested_counts": requested_counts,
        "ttl_secs": ttl,
    });
    print_response(client.post(format!("{}/reservations", api)).json(&body)).await
}

async fn handle_task(client: &Client, api: &str, command: TaskCommands) -> anyhow::Result<()> {
    let (body, options) = match command {
        TaskCommands::Exec {
            unit_id,
            command,
            user,
            options,
        } => (
            json!({
                "target_unit": unit_id,
                "transport": "shell",
                "operation": { "kind": "exec", "command": command },
                "username": user,
            }),
            options,
        ),
        TaskCommands::Read {
            unit_id,
            baudrate,
            options,
        } => (
            serial_body(unit_id, json!({ "kind": "read" }), baudrate),
            options,
        ),
        TaskCommands::Write {
            unit_id,
            text,
            baudrate,
            options,
        } => (
            serial_body(unit_id, json!({ "kind": "write", "text": text }), baudrate),
            options,
        ),
        TaskCommands::WriteRead {
            unit_id,
            text,
            baudrate,
            options,
        } => (
            serial_body(
                unit_id,
                json!({ "kind": "write_then_read", "text": text }),
                baudrate,
            ),
            options,
        ),
        TaskCommands::Status { task_id, wait } => {
            return show_status(client, api, &task_id, wait).await;
        }
        TaskCommands::List { state, unit } => {
            let query: Vec<(&str, String)> = [("state", state), ("unit", unit)]
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
            return print_response(client.get(format!("{}/tasks", api)).query(&query)).await;
        }
        TaskCommands::Cancel { task_id } => {
            return print_response(client.post(format!("{}/tasks/{}/cancel", api, task_id)))
                .await;
        }
    };

    submit(client, api, body, options).await
}

fn serial_body(unit_id: String, operation: Value, baudrate: Option<u32>) -> Value {
    json!({
        "target_unit": unit_id,
        "transport": "serial",
        "operation": operation,
        "baudrate": baudrate,
    })
}

async fn submit(
    client: &Client,
    api: &str,
    mut body: Value,
    options: SubmitOptions,
) -> anyhow::Result<()> {
    body["timeout_secs"] = json!(options.timeout);
    body["max_retries"] = json!(options.max_retries);
    body["retry_delay_secs"] = json!(options.retry_delay);

    let handle = send(client.post(format!("{}/tasks", api)).json(&body)).await?;
    let Some(task_id) = handle["task_id"].as_str() else {
        anyhow::bail!("server did not return a task id");
    };
    info!(task_id, "Task submitted");

    if options.wait {
        show_status(client, api, task_id, true).await
    } else {
        println!("{}", serde_json::to_string_pretty(&handle)?);
        Ok(())
    }
}

async fn show_status(client: &Client, api: &str, task_id: &str, wait: bool) -> anyhow::Result<()> {
    let url = format!("{}/tasks/{}", api, task_id);

    loop {
        let status = send(client.get(&url)).await?;
        let state = status["state"].as_str().unwrap_or_default();

        if !wait || matches!(state, "SUCCESS" | "FAILURE" | "CANCELLED") {
            println!("{}", serde_json::to_string_pretty(&status)?);
            if state == "FAILURE" {
                anyhow::bail!("task {} failed", task_id);
            }
            return Ok(());
        }

        debug!(task_id, state, "Waiting for task");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
