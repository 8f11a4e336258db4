//! RayCluster Kubernetes Operator
//!
//! Watches RayCluster resources and keeps their head pod, head service and
//! worker groups in line with the spec.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! raycluster-operator
//!
//! # Watch one namespace with human-readable logs
//! RUST_LOG=debug raycluster-operator --namespace ray --log-format text
//! ```

use clap::{Parser, ValueEnum};
use kube::Client;
use raycluster_operator::leader_election::{self, LeaderElector, LeaseTiming};
use raycluster_operator::{RayClusterController, ReconcilerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// RayCluster Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "raycluster-operator")]
#[command(version, about = "Kubernetes Operator for Ray clusters")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Seconds a leader lease stays valid without renewal
    #[arg(long, env = "LEASE_DURATION_SECONDS", default_value = "15")]
    lease_duration_seconds: u64,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Requeue interval for a converged cluster
    #[arg(long, env = "RESYNC_SECONDS", default_value = "300")]
    resync_seconds: u64,

    /// Requeue interval while a cluster is still converging
    #[arg(long, env = "CONVERGE_SECONDS", default_value = "2")]
    converge_seconds: u64,

    /// How long the head may be missing or crash-looping before the cluster is failed
    #[arg(long, env = "HEAD_FAILURE_THRESHOLD_SECONDS", default_value = "300")]
    head_failure_threshold_seconds: u64,

    /// Consecutive unconverged passes before the cluster is unhealthy
    #[arg(long, env = "UNHEALTHY_PASS_THRESHOLD", default_value = "3")]
    unhealthy_pass_threshold: i32,

    /// Timeout for each Kubernetes API call
    #[arg(long, env = "API_TIMEOUT_SECONDS", default_value = "10")]
    api_timeout_seconds: u64,

    /// Status write attempts per pass
    #[arg(long, env = "STATUS_WRITE_RETRIES", default_value = "3")]
    status_write_retries: u32,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,
}

impl Args {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            resync_interval: Duration::from_secs(self.resync_seconds),
            converge_interval: Duration::from_secs(self.converge_seconds),
            head_failure_threshold: Duration::from_secs(self.head_failure_threshold_seconds),
            unhealthy_pass_threshold: self.unhealthy_pass_threshold,
            api_timeout: Duration::from_secs(self.api_timeout_seconds),
            status_write_retries: self.status_write_retries,
        }
    }

    fn lease_timing(&self) -> LeaseTiming {
        let lease_duration = Duration::from_secs(self.lease_duration_seconds.max(3));
        LeaseTiming {
            lease_duration,
            renew_interval: lease_duration * 2 / 3,
            retry_interval: lease_duration / 3,
        }
    }

    fn watch_namespace(&self) -> Option<String> {
        (!self.namespace.is_empty()).then(|| self.namespace.clone())
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = args.reconciler_config();
    info!("Starting RayCluster Kubernetes Operator");
    info!(leader_election = args.leader_election, ?config, "Operator configuration");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Acquire the lease before any reconciliation starts
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns, args.lease_timing());
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let controller = Arc::new(RayClusterController::new(
        client.clone(),
        config,
        args.watch_namespace(),
    ));
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("RayCluster controller error: {}", e);
        }
    });

    // Pending forever when leader election is disabled
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("RayCluster controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    if let Some(e) = &elector {
        e.release().await;
    }

    info!("RayCluster Operator shutting down");
    Ok(())
}
