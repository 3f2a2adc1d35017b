mod conversation_http;
mod tool_runner;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use listener_common::elapsed::format_elapsed;
use listener_common::PermissionModeCliArg;
use listener_core::config::EnvConfig;
use listener_core::config::RuntimeConfig;
use listener_core::listener::ListenerRuntime;
use listener_core::ws;
use tracing_subscriber::EnvFilter;

use crate::conversation_http::HttpConversationService;
use crate::tool_runner::LocalToolRunner;

/// Local execution agent: drives a remote conversation's tool-approval
/// loop from this machine, enforcing the permission engine locally.
#[derive(Parser, Debug)]
#[command(name = "letta-listener")]
struct Cli {
    /// Base URL of the cloud controller (registration + conversation API).
    #[arg(long, env = "LETTA_SERVER_URL")]
    server_url: String,

    /// Agent this listener drives turns for.
    #[arg(long)]
    agent_id: String,

    /// Stable identifier for this machine/installation.
    #[arg(long, env = "LETTA_DEVICE_ID")]
    device_id: String,

    /// Human-readable label shown alongside this connection in the cloud UI.
    #[arg(long, default_value = "letta-listener")]
    connection_name: String,

    #[arg(long, value_enum, default_value = "default")]
    permission_mode: PermissionModeCliArg,

    /// Comma-separated `Tool`/`Tool(payload)` rules, always allowed.
    #[arg(long, default_value = "")]
    allowed_tools: String,

    /// Comma-separated `Tool`/`Tool(payload)` rules, always denied.
    #[arg(long, default_value = "")]
    disallowed_tools: String,

    /// File `plan` mode may additionally write to.
    #[arg(long)]
    plan_file_path: Option<PathBuf>,

    /// Working directory the permission engine scopes file/shell access to.
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = "info";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).try_init().ok();

    let env = EnvConfig::from_env();
    let api_key = env.api_key.clone().ok_or_else(|| anyhow::anyhow!("LETTA_API_KEY must be set"))?;

    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let config = RuntimeConfig::new(working_dir.clone(), cli.permission_mode.into(), env)
        .with_cli_tools(&cli.allowed_tools, &cli.disallowed_tools)
        .with_agent_id(cli.agent_id.clone());
    let config = match cli.plan_file_path {
        Some(path) => config.with_plan_file_path(path),
        None => config,
    };

    let session_id = format!("{}-{}", cli.device_id, uuid::Uuid::new_v4());
    let runtime = ListenerRuntime::new(session_id, config);

    let conversation = Arc::new(HttpConversationService::new(cli.server_url.clone(), api_key.clone()));
    let tool_runner = Arc::new(LocalToolRunner::new(working_dir));

    let server_url = cli.server_url.clone();
    let device_id = cli.device_id.clone();
    let connection_name = cli.connection_name.clone();
    let connect = move || {
        let server_url = server_url.clone();
        let device_id = device_id.clone();
        let connection_name = connection_name.clone();
        let api_key = api_key.clone();
        async move {
            let ws_url = register_connection(&server_url, &device_id, &api_key).await?;
            ws::connect(&ws_url, &device_id, &connection_name, &api_key).await
        }
    };

    let run_start = Utc::now();
    tokio::select! {
        result = runtime.clone().run(connect, conversation, tool_runner) => {
            tracing::info!("listener stopped after {}", format_elapsed(run_start));
            result.map_err(|e| anyhow::anyhow!(e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt after {}, stopping listener", format_elapsed(run_start));
            runtime.stop();
        }
    }

    Ok(())
}

/// Registration is a plain REST call returning `{connectionId, wsUrl}`;
/// the WebSocket URL is then augmented with device/connection query
/// parameters by `ws::connect`.
async fn register_connection(server_url: &str, device_id: &str, api_key: &str) -> Result<String, String> {
    #[derive(serde::Deserialize)]
    struct RegisterResponse {
        #[serde(rename = "wsUrl")]
        ws_url: String,
    }

    let client = reqwest::Client::new();
    let response: RegisterResponse = client
        .post(format!("{server_url}/v1/connections"))
        .bearer_auth(api_key)
        .json(&serde_json::json!({ "deviceId": device_id }))
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?
        .json()
        .await
        .map_err(|e| e.to_string())?;

    Ok(response.ws_url)
}
