//! Fleet Orchestrator Admin CLI
//!
//! Operator tool that drives a running orchestrator over its HTTP API: start
//! and inspect flows, run hunts, read crash history.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fleet_orchestrator::models::{
    ClientId, ClientSelection, CrashRecord, FlowInstance, FlowSpec, FlowStartRequest, FlowState,
    Hunt, HuntSpec, HuntState, SessionId,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "fleet-admin")]
#[command(about = "Fleet Orchestrator Admin CLI - start flows, run hunts, inspect crashes")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Orchestrator base URL
    #[arg(long, env = "FLEET_URL", default_value = "http://localhost:4000")]
    url: String,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a flow on one client
    StartFlow {
        /// Client id (C.xxxxxxxxxxxxxxxx)
        client_id: String,

        /// Flow class name
        flow_name: String,

        /// Flow arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,

        /// Recorded as the flow's creator
        #[arg(long, env = "USER")]
        creator: Option<String>,
    },

    /// Show one flow
    Flow {
        session_id: String,
    },

    /// Cancel a running flow
    CancelFlow {
        session_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Start a hunt
    StartHunt {
        /// Flow class name
        flow_name: String,

        /// Flow arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,

        /// Target these clients (repeatable); every client when neither this nor --label is given
        #[arg(long = "client")]
        clients: Vec<String>,

        /// Target clients carrying this label
        #[arg(long, conflicts_with = "clients")]
        label: Option<String>,

        /// Clients started per tick; 0 disables rate limiting
        #[arg(long)]
        rate: Option<u32>,

        /// Hunt-specific crash/error alert address
        #[arg(long)]
        alert: Option<String>,

        /// Failures after which the hunt pauses
        #[arg(long)]
        threshold: Option<u64>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, env = "USER")]
        creator: Option<String>,
    },

    /// Add clients to a hunt
    AddClients {
        hunt_id: String,

        #[arg(required = true)]
        client_ids: Vec<String>,
    },

    /// Show a hunt and its statistics
    Hunt {
        hunt_id: String,
    },

    /// Pause a hunt
    PauseHunt {
        hunt_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a paused hunt
    ResumeHunt {
        hunt_id: String,
    },

    /// Stop a hunt for good
    StopHunt {
        hunt_id: String,
    },

    /// Show the crash history of a client
    Crashes {
        client_id: String,
    },
}

/// Thin JSON client for the orchestrator API
struct Api {
    client: Client,
    base: String,
}

impl Api {
    fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_with_query(path, &[]).await
    }

    async fn get_with_query<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body: Value = response.json().await.context("Response is not JSON")?;
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("unknown error");
            bail!("{} ({})", message, status);
        }
        Ok(serde_json::from_value(body)?)
    }
}

fn parse_args(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--args is not valid JSON: {}", raw))
}

fn parse_clients(raw: &[String]) -> Result<Vec<ClientId>> {
    raw.iter()
        .map(|id| ClientId::parse(id).map_err(anyhow::Error::from))
        .collect()
}

fn flow_state(state: FlowState) -> String {
    let label = state.to_string();
    match state {
        FlowState::Running => label.yellow().to_string(),
        FlowState::Terminated => label.green().to_string(),
        FlowState::Error => label.red().to_string(),
        FlowState::Crashed => label.red().bold().to_string(),
    }
}

fn hunt_state(state: HuntState) -> String {
    let label = state.to_string();
    match state {
        HuntState::Started => label.green().to_string(),
        HuntState::Paused => label.yellow().to_string(),
        HuntState::Stopped => label.red().to_string(),
    }
}

fn print_flow(flow: &FlowInstance) {
    println!("{} {}", "Flow".bold(), flow.session_id.to_string().cyan());
    println!("  class:    {}", flow.flow_name);
    println!("  client:   {}", flow.client_id);
    println!("  state:    {}", flow_state(flow.state));
    println!("  waiting:  {} ({} outstanding)", flow.current_state, flow.outstanding.len());
    println!("  results:  {}", flow.results.len());
    println!(
        "  cpu:      {:.2}s, network: {} bytes",
        flow.cpu_time_used.total(),
        flow.network_bytes_sent
    );
    if let Some(failure) = &flow.failure {
        println!("  {} {}", "failure:".red(), failure.message);
    }
    if let Some(crash) = &flow.crash {
        println!("  {} {}: {}", "crash:".red().bold(), crash.crash_type, crash.crash_message);
    }
    if let Some(reason) = &flow.termination_reason {
        println!("  reason:   {}", reason);
    }
    for entry in flow.logs.iter().rev().take(5).rev() {
        println!("  {} {}", entry.timestamp.format("%H:%M:%S").to_string().dimmed(), entry.message);
    }
}

fn print_hunt(hunt: &Hunt) {
    println!("{} {}", "Hunt".bold(), hunt.hunt_id.to_string().cyan());
    println!("  flow:      {}", hunt.flow.flow_name);
    println!("  state:     {}", hunt_state(hunt.state));
    println!("  rate:      {} per tick", hunt.client_rate);
    println!(
        "  started:   {}  queued: {}  completed: {}  errors: {}  crashes: {}",
        hunt.counters.started,
        hunt.queued_clients.len(),
        hunt.counters.completed,
        hunt.counters.errors,
        hunt.counters.crashes
    );
    if let Some(reason) = &hunt.pause_reason {
        println!("  paused:    {}", reason.yellow());
    }
}

fn print_crash(crash: &CrashRecord) {
    println!(
        "{} {} {}",
        crash.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        crash.crash_type.red(),
        crash.crash_message
    );
    if let Some(session_id) = &crash.session_id {
        println!("    session: {}", session_id);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = Api::new(&cli.url);

    match cli.command {
        Commands::StartFlow {
            client_id,
            flow_name,
            args,
            creator,
        } => {
            let mut request = FlowStartRequest::new(ClientId::parse(&client_id)?, FlowSpec::new(flow_name, parse_args(&args)?));
            request.creator = creator;
            let flow: FlowInstance = api.post("/api/flows", &request).await?;
            if cli.json {
                return print_json(&flow);
            }
            println!("{} {}", "Started".green(), flow.session_id);
            print_flow(&flow);
        }

        Commands::Flow { session_id } => {
            let flow: FlowInstance = api
                .get_with_query("/api/flows", &[("session_id", session_id.as_str())])
                .await?;
            if cli.json {
                return print_json(&flow);
            }
            print_flow(&flow);
        }

        Commands::CancelFlow { session_id, reason } => {
            let body = serde_json::json!({ "session_id": SessionId(session_id), "reason": reason });
            let flow: FlowInstance = api.post("/api/flows/cancel", &body).await?;
            if cli.json {
                return print_json(&flow);
            }
            print_flow(&flow);
        }

        Commands::StartHunt {
            flow_name,
            args,
            clients,
            label,
            rate,
            alert,
            threshold,
            description,
            creator,
        } => {
            let client_selection = match (label, clients.is_empty()) {
                (Some(label), _) => ClientSelection::Label { label },
                (None, false) => ClientSelection::Clients {
                    client_ids: parse_clients(&clients)?,
                },
                (None, true) => ClientSelection::All,
            };
            let spec = HuntSpec {
                description,
                flow: FlowSpec::new(flow_name, parse_args(&args)?),
                client_selection,
                client_rate: rate,
                crash_alert_target: alert,
                failure_threshold: threshold,
                creator,
            };
            let hunt: Hunt = api.post("/api/hunts", &spec).await?;
            if cli.json {
                return print_json(&hunt);
            }
            println!("{} {}", "Started".green(), hunt.hunt_id);
            print_hunt(&hunt);
        }

        Commands::AddClients { hunt_id, client_ids } => {
            let body = serde_json::json!({ "client_ids": parse_clients(&client_ids)? });
            let dispatch: Value = api.post(&format!("/api/hunts/{}/clients", hunt_id), &body).await?;
            if cli.json {
                return print_json(&dispatch);
            }
            let started = dispatch["started"].as_array().map_or(0, Vec::len);
            println!(
                "{} {} started, {} queued",
                "Added".green(),
                started,
                dispatch["queued"].as_u64().unwrap_or(0)
            );
        }

        Commands::Hunt { hunt_id } => {
            let view: Value = api.get(&format!("/api/hunts/{}", hunt_id)).await?;
            if cli.json {
                return print_json(&view);
            }
            let hunt: Hunt = serde_json::from_value(view["hunt"].clone())?;
            print_hunt(&hunt);
        }

        Commands::PauseHunt { hunt_id, reason } => {
            let body = serde_json::json!({ "reason": reason });
            let hunt: Hunt = api.post(&format!("/api/hunts/{}/pause", hunt_id), &body).await?;
            print_hunt(&hunt);
        }

        Commands::ResumeHunt { hunt_id } => {
            let hunt: Hunt = api
                .post(&format!("/api/hunts/{}/resume", hunt_id), &Value::Null)
                .await?;
            print_hunt(&hunt);
        }

        Commands::StopHunt { hunt_id } => {
            let hunt: Hunt = api
                .post(&format!("/api/hunts/{}/stop", hunt_id), &Value::Null)
                .await?;
            print_hunt(&hunt);
        }

        Commands::Crashes { client_id } => {
            let client_id = ClientId::parse(&client_id)?;
            let crashes: Vec<CrashRecord> = api.get(&format!("/api/clients/{}/crashes", client_id)).await?;
            if cli.json {
                return print_json(&crashes);
            }
            if crashes.is_empty() {
                println!("No crashes recorded for {}", client_id);
            }
            for crash in &crashes {
                print_crash(crash);
            }
        }
    }

    Ok(())
}
