use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qstream::config::AppConfig;
use qstream::context;
use qstream::logging::{self, LogConfig};
use qstream::rpc::{QueryParams, RpcClient, RpcServer};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "qstream")]
#[command(about = "Streaming query server over JSON-RPC", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to read instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServerArgs),
    /// Run a query against a server and print its output
    Query(QueryArgs),
    /// Show server status
    Status(ClientArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    acceptors: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_block_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    shutdown_grace_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct ClientArgs {
    /// Server address, defaults to the configured bind address
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[derive(Args)]
struct QueryArgs {
    #[command(flatten)]
    client: ClientArgs,

    #[arg(long)]
    query_id: Option<String>,

    #[arg(long)]
    format: Option<String>,

    /// Query setting as name=value, repeatable
    #[arg(long = "setting", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Milliseconds between output blocks
    #[arg(long)]
    interactive_delay: Option<u64>,

    query: String,
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Serve(args) => AppConfig::load(path, Some(args))?,
        _ => AppConfig::load(path, None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Serve(_) => {
            logging::init(LogConfig::from(&config)).context("Failed to set up logging")?;
            run_server(config).await.context("Server failed")?
        }
        Commands::Query(args) => run_query(&config, args)
            .await
            .context("Failed to run query")?,
        Commands::Status(args) => run_status(&config, args)
            .await
            .context("Failed to check status of server")?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let bind = config.bind;
    let ctx = context::AppContext::new(config);
    let server = Arc::new(RpcServer::bind(ctx, bind).await?);

    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal.shutdown();
        }
    });

    server.start().await?;
    Ok(())
}

async fn run_query(config: &AppConfig, args: QueryArgs) -> Result<()> {
    let client = RpcClient::new(args.client.addr.unwrap_or(config.bind));

    let mut params = QueryParams::new(args.query);
    params.query_id = args.query_id;
    params.format = args.format;
    params.settings = args.settings.into_iter().collect();
    params.interactive_delay = args.interactive_delay;

    let output = client.query(params).await?;
    let text = output.text();
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(())
}

async fn run_status(config: &AppConfig, args: ClientArgs) -> Result<()> {
    let client = RpcClient::new(args.addr.unwrap_or(config.bind));
    let status = client.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
