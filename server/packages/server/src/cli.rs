use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;
use crate::router::{build_router_with_state, shutdown_server, AppState};
use workspace_agent_sandbox_runtime::DockerCliRuntime;

// Include the generated version constant
mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;

#[derive(Parser, Debug)]
#[command(name = "workspace-agent", bin_name = "workspace-agent")]
#[command(about = "Sandboxed AI-agent conversations for Git-backed workspaces")]
#[command(version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct WorkspaceAgentCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the workspace agent HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Server(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn run_workspace_agent() -> Result<(), CliError> {
    let cli = WorkspaceAgentCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = ServerConfig::from_env();
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let container_runtime = Arc::new(DockerCliRuntime::new());
        let state = AppState::new(config, container_runtime)
            .map_err(|err| CliError::Server(err.to_string()))?;
        let (mut router, state) = build_router_with_state(Arc::new(state));
        router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, version = build_version::VERSION, "server listening");

        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down, draining sandbox sessions");
                shutdown_server(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    use axum::http::{HeaderName, HeaderValue, Method};

    if server.cors_allow_origin.is_empty() {
        return Ok(CorsLayer::new());
    }

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        origins.push(
            HeaderValue::from_str(origin)
                .map_err(|_| CliError::Server(format!("invalid cors origin: {origin}")))?,
        );
    }
    let mut cors = CorsLayer::new().allow_origin(origins);

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            methods.push(
                Method::from_bytes(method.as_bytes())
                    .map_err(|_| CliError::Server(format!("invalid cors method: {method}")))?,
            );
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            headers.push(
                HeaderName::from_bytes(header.as_bytes())
                    .map_err(|_| CliError::Server(format!("invalid cors header: {header}")))?,
            );
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
