//! Book Kubernetes Operator
//!
//! This operator watches Book custom resources and keeps their workload,
//! Envoy sidecar and services converged.

use anyhow::{Context, Result};
use book_operator::config::{ControllerConfig, PolicyConfig};
use book_operator::controller::run_controller;
use book_operator::crd::Book;
use book_operator::plan::UpdatePolicy;
use book_operator::resources::DEFAULT_ENVOY_IMAGE;
use book_operator::sidecar::DEFAULT_ENVOY_CONFIG_PATH;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Book Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "book-operator")]
#[command(about = "Kubernetes operator that converges Book resources into a workload and an Envoy sidecar")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Number of parallel workers
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Envoy configuration document stored in each sidecar ConfigMap
    #[arg(long, env = "ENVOY_CONFIG", default_value = DEFAULT_ENVOY_CONFIG_PATH)]
    envoy_config: PathBuf,

    /// Envoy sidecar image
    #[arg(long, env = "ENVOY_IMAGE", default_value = DEFAULT_ENVOY_IMAGE)]
    envoy_image: String,

    /// Fixed node port for the primary service (allocated by the cluster when unset)
    #[arg(long, env = "PRIMARY_NODE_PORT")]
    primary_node_port: Option<i32>,

    /// Update policy for both services (always-update, diff-gated)
    #[arg(long, env = "SERVICE_POLICY", default_value = "always-update")]
    service_policy: UpdatePolicy,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: if self.namespace.is_empty() {
                None
            } else {
                Some(self.namespace.clone())
            },
            workers: self.workers,
            policies: PolicyConfig::default().with_service_policy(self.service_policy),
            envoy_config_path: self.envoy_config.clone(),
            envoy_image: self.envoy_image.clone(),
            primary_node_port: self.primary_node_port,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.controller_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        workers = config.workers,
        service_policy = %args.service_policy,
        "Starting Book Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    run_controller(client, config, shutdown)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let filter = log_filter(args.log_level, std::env::var("RUST_LOG").ok().as_deref());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// `RUST_LOG` directives when they parse, otherwise `--log-level`
fn log_filter(level: Level, directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(level.to_string()))
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = Book::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}
