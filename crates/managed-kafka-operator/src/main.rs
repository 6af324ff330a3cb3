//! Managed Kafka Environment Operator
//!
//! Provisions shared topics and a Kafka Connect cluster for every
//! KafkaEnvironment, backed by a managed Kafka service.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use managed_kafka_operator::client_cache::AdminClientCache;
use managed_kafka_operator::controller;
use managed_kafka_operator::crd;
use managed_kafka_operator::oauth::AdminClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Managed Kafka Environment Operator
#[derive(Parser, Debug)]
#[command(name = "managed-kafka-operator")]
#[command(about = "Kubernetes operator provisioning managed Kafka topics and Kafka Connect for environments")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Per-request timeout for admin API calls, in seconds (unset: no timeout)
    #[arg(long, env = "ADMIN_REQUEST_TIMEOUT_SECS")]
    admin_request_timeout_secs: Option<u64>,

    /// Refresh admin API tokens this many seconds before they expire
    #[arg(long, env = "TOKEN_EXPIRY_LEEWAY_SECS", default_value = "30")]
    token_expiry_leeway_secs: u64,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn admin_client_config(&self) -> AdminClientConfig {
        AdminClientConfig {
            request_timeout: self.admin_request_timeout_secs.map(Duration::from_secs),
            token_expiry_leeway: Duration::from_secs(self.token_expiry_leeway_secs),
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

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Managed Kafka Environment Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Admin clients live for the whole process
    let clients = Arc::new(AdminClientCache::new());

    controller::run_controller(client, clients, args.admin_client_config())
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
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

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
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

    for crd in [crd::KafkaEnvironment::crd(), crd::KafkaApp::crd()] {
        let yaml = serde_yaml::to_string(&crd)?;
        println!("---\n{}", yaml);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_client_config_from_args() {
        let args = Args::parse_from([
            "managed-kafka-operator",
            "--admin-request-timeout-secs",
            "15",
            "--token-expiry-leeway-secs",
            "60",
        ]);
        let config = args.admin_client_config();
        assert_eq!(config.request_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.token_expiry_leeway, Duration::from_secs(60));
        assert_eq!(config.scope, "openid api.iam.service_accounts");
    }

    #[test]
    fn test_defaults_leave_timeout_unset() {
        let args = Args::parse_from(["managed-kafka-operator"]);
        assert!(args.admin_client_config().request_timeout.is_none());
        assert!(!args.print_crd);
    }
}
