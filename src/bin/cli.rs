//! CLI client for a running dispatch server

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "geodispatch")]
#[command(about = "geodispatch command-line client")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Available,
    Busy,
}

impl StateArg {
    fn as_str(self) -> &'static str {
        match self {
            StateArg::Available => "available",
            StateArg::Busy => "busy",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a driver
    AddDriver { name: String },

    /// Register a passenger
    AddPassenger { name: String },

    /// Report a driver's position
    Locate {
        id: i64,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
    },

    /// Mark a driver available or busy
    State {
        id: i64,
        #[arg(value_enum)]
        state: StateArg,
    },

    /// Show a driver's recent positions
    History {
        id: i64,
        /// RFC3339 lower bound (default: server's window)
        #[arg(long)]
        since: Option<String>,
    },

    /// Find drivers near a passenger
    Request {
        passenger_id: i64,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
    },

    /// Run a reconciliation sweep now
    Reconcile,

    /// Check server health
    Health,
}

async fn send(request: RequestBuilder) -> anyhow::Result<Value> {
    let response = request.send().await.context("request failed")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no details");
        bail!("{}: {}", status, message);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.server.trim_end_matches('/');

    let reply = match cli.command {
        Commands::AddDriver { name } => {
            send(client.post(format!("{}/drivers", base)).json(&json!({ "name": name }))).await?
        }
        Commands::AddPassenger { name } => {
            send(client.post(format!("{}/passengers", base)).json(&json!({ "name": name })))
                .await?
        }
        Commands::Locate { id, lat, lng } => {
            send(
                client
                    .put(format!("{}/drivers/{}/locations", base, id))
                    .json(&json!({ "location": { "lat": lat, "lng": lng } })),
            )
            .await?
        }
        Commands::State { id, state } => {
            send(
                client
                    .patch(format!("{}/drivers/{}", base, id))
                    .json(&json!({ "state": state.as_str() })),
            )
            .await?
        }
        Commands::History { id, since } => {
            let mut request = client.get(format!("{}/drivers/{}/history", base, id));
            if let Some(since) = since {
                request = request.query(&[("since", since)]);
            }
            send(request).await?
        }
        Commands::Request {
            passenger_id,
            lat,
            lng,
        } => {
            send(client.post(format!("{}/requests", base)).json(&json!({
                "passenger_id": passenger_id,
                "location": { "lat": lat, "lng": lng },
            })))
            .await?
        }
        Commands::Reconcile => send(client.post(format!("{}/admin/reconcile", base))).await?,
        Commands::Health => send(client.get(format!("{}/health", base))).await?,
    };

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
