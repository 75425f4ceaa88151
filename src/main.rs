//! Flotilla - fleet orchestration for containerized workloads
//!
//! This is the main CLI entry point for Flotilla.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flotilla::agent::{HostProbe, HttpControlPlane, LocalControlPlane, NodeLink, NodeStack, SysinfoProbe};
use flotilla::config::FleetConfig;
use flotilla::container::LaunchRequest;
use flotilla::fleet::{Dispatcher, FleetServer, HttpNodeTransport, LocalTransport, NodeRegistry, Placement};
use flotilla::http::HttpServer;
use flotilla::network::pool::parse_range_expression;
use flotilla::runtime::LocalRuntime;
use flotilla::service::ServiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Flotilla - fleet orchestration
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Orchestrates containerized workloads across worker nodes", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a bracket-range CIDR expression
    Cidr {
        /// Expression such as 172.[128-255].0.0/24
        expr: String,
    },

    /// Validate a service definition
    Validate {
        /// Service configuration file (YAML or JSON)
        file: PathBuf,
    },

    /// Print one host resource reading
    Probe,

    /// Run a worker node
    Agent,

    /// Run the control node
    Server,

    /// Run a control node and one worker in-process and launch a container
    Demo {
        /// Image to launch
        #[arg(default_value = "alpine")]
        image: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

async fn run_agent(mut config: FleetConfig) -> anyhow::Result<()> {
    if config.node.client_id.is_empty() {
        config.node.client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "Generated client id {}; the control node must address this node with it",
            config.node.client_id
        );
    }

    let node_config = config.clone();
    let stack = tokio::task::spawn_blocking(move || {
        NodeStack::persistent(&node_config, Arc::new(LocalRuntime::new()))
    })
    .await?
    .context("failed to start node components")?;

    stack
        .operations
        .spawn_sweeper(Duration::from_secs(config.operations.sweep_interval_secs));

    let listen = format!("0.0.0.0:{}", config.node.port);
    let server = HttpServer::bind(&listen, Arc::new(stack.agent()))
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    server.spawn();

    let plane = Arc::new(HttpControlPlane::new(&config.node.server_url, Duration::from_secs(5))?);
    let probe: Box<dyn HostProbe> = Box::new(SysinfoProbe::new(config.node.link_capacity_bytes));
    let link = Arc::new(NodeLink::new(
        plane,
        Arc::new(stack.status_reporter(probe)),
        &config.node,
    ));
    tracing::info!("Connecting to server {}", config.node.server_url);
    link.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down node {}", config.node.client_id);
    Ok(())
}

async fn run_server(config: FleetConfig) -> anyhow::Result<()> {
    let registry = Arc::new(NodeRegistry::new(config.server.supervision()));
    let transport = Arc::new(HttpNodeTransport::new(Duration::from_secs(10))?);
    let dispatcher = Arc::new(
        Dispatcher::new(registry, transport)
            .with_timings(config.server.poll_interval(), config.server.operation_timeout()),
    );

    let server = HttpServer::bind(&config.server.listen, Arc::new(FleetServer::new(dispatcher)))
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    server.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down control node");
    Ok(())
}

async fn run_demo(mut config: FleetConfig, image: String) -> anyhow::Result<()> {
    config.node.client_id = "demo-node".to_string();
    config.node.address = "127.0.0.1".to_string();
    config.node.status_interval_secs = 1;

    let runtime = Arc::new(LocalRuntime::new());
    runtime.publish(&image, None)?;
    let node_config = config.clone();
    let node_runtime = runtime.clone();
    let stack = tokio::task::spawn_blocking(move || {
        NodeStack::assemble(
            &node_config,
            node_runtime,
            Arc::new(flotilla::proxy::LocalProxy::default()),
            Arc::new(flotilla::store::MemoryStore::new()),
        )
    })
    .await??;

    let registry = Arc::new(NodeRegistry::new(config.server.supervision()));
    let transport = Arc::new(LocalTransport::new());
    transport.register(&config.node.client_id, Arc::new(stack.agent()))?;
    let dispatcher = Arc::new(
        Dispatcher::new(registry.clone(), transport)
            .with_timings(Duration::from_millis(100), config.server.operation_timeout()),
    );

    let plane = Arc::new(LocalControlPlane::new(Arc::new(FleetServer::new(dispatcher.clone()))));
    let probe: Box<dyn HostProbe> = Box::new(SysinfoProbe::new(config.node.link_capacity_bytes));
    let link = Arc::new(NodeLink::new(plane, Arc::new(stack.status_reporter(probe)), &config.node));
    let session = link.spawn();

    while registry.select_lowest_demand().is_err() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let placed = dispatcher
        .launch_container(&LaunchRequest::new(&image), &Placement::Auto, |line| {
            print!("{}", line)
        })
        .await?;
    println!("Launched {} on node {}", placed.container.id, placed.node_id);
    println!("{}", serde_json::to_string_pretty(&registry.list()?)?);

    dispatcher
        .stop_container(&placed.container.id, &Placement::Auto)
        .await?;
    println!("Stopped {}", placed.container.id);
    session.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Cidr { expr } => {
            let subnets = parse_range_expression(&expr)?;
            for subnet in &subnets {
                println!("{}", subnet);
            }
            eprintln!("{} subnet(s)", subnets.len());
        }

        Commands::Validate { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let service = ServiceConfig::from_yaml(&content)
                .with_context(|| format!("{} is not a valid service", file.display()))?;
            println!(
                "{}: {} container(s), {} network(s), total score {}",
                file.display(),
                service.container_count,
                service.network_count,
                service.total_score
            );
        }

        Commands::Probe => {
            let mut probe = SysinfoProbe::new(config.node.link_capacity_bytes);
            // cpu usage needs two readings
            probe.sample();
            tokio::time::sleep(Duration::from_millis(500)).await;
            let sample = probe.sample();
            println!("cpu:     {:.2}", sample.cpu_usage);
            println!("memory:  {:.2}", sample.memory_usage);
            println!("disk:    {:.2}", sample.disk_usage);
            println!("network: {:.4}", sample.network_usage);
        }

        Commands::Agent => run_agent(config).await?,

        Commands::Server => run_server(config).await?,

        Commands::Demo { image } => run_demo(config, image).await?,
    }

    Ok(())
}
