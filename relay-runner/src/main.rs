use std::sync::Arc;

use clap::Parser;
use relay_runner::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-runner", about = "Host agent that serves PTY sessions to the HQ relay")]
struct Args {
    /// HQ WebSocket endpoint to attach to.
    #[arg(long, env = "HQ_URL", default_value = "ws://localhost:8080/ws/runner")]
    hq_url: String,

    /// Unique id this runner registers under. Defaults to the hostname.
    #[arg(long, env = "RUNNER_ID")]
    runner_id: Option<String>,

    /// Authentication token presented at registration.
    #[arg(long, env = "RUNNER_TOKEN", default_value = "dev-token")]
    token: String,
}

fn default_runner_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-runner".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runner_id = args.runner_id.unwrap_or_else(default_runner_id);
    tracing::info!(runner_id = %runner_id, hq_url = %args.hq_url, "runner starting");

    let agent = Arc::new(Agent::new(AgentConfig {
        hq_url: args.hq_url,
        runner_id,
        token: args.token,
    }));

    let on_signal = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            on_signal.close();
        }
    });

    agent.run().await;
}
