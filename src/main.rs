use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use nodegroup_drainer::controller::{
    self, ControllerState, InMemoryCluster, KubeCluster, ReconcilerConfig,
};
use nodegroup_drainer::{trigger, Error};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciler on a schedule
    Run(RunArgs),
    /// Run exactly one pass and exit
    Once(OnceArgs),
    /// Show what one pass would do against manifests on disk
    Plan(PlanArgs),
    /// Show version and build information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct ReconcileArgs {
    /// Name of the Secret holding per-group configuration checksums
    #[arg(long, env = "CHECKSUM_SECRET_NAME", default_value = controller::snapshot::DEFAULT_CHECKSUM_SECRET)]
    checksum_secret: String,

    /// Namespace of the checksum Secret
    #[arg(long, env = "CHECKSUM_SECRET_NAMESPACE", default_value = controller::snapshot::DEFAULT_CHECKSUM_NAMESPACE)]
    checksum_namespace: String,

    /// Cordon nodes of Manual groups while they wait for approval, within the group's disruption budget
    #[arg(long, env = "CORDON_PENDING_APPROVAL")]
    cordon_pending_approval: bool,

    /// Run in dry-run mode (calculate changes without applying them)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl ReconcileArgs {
    fn config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            checksum_secret: self.checksum_secret.clone(),
            checksum_namespace: self.checksum_namespace.clone(),
            cordon_pending_approval: self.cordon_pending_approval,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    reconcile: ReconcileArgs,

    /// Cron expression with seconds, e.g. "0 */5 * * * *"
    #[arg(long, env = "RECONCILE_SCHEDULE", default_value = trigger::DEFAULT_SCHEDULE)]
    schedule: String,

    /// Evictions submitted concurrently while draining one node
    #[arg(long, env = "CONCURRENT_EVICTIONS", default_value_t = controller::DEFAULT_CONCURRENT_EVICTIONS)]
    concurrent_evictions: usize,

    /// Address of the REST API
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct OnceArgs {
    #[command(flatten)]
    reconcile: ReconcileArgs,

    /// Evictions submitted concurrently while draining one node
    #[arg(long, env = "CONCURRENT_EVICTIONS", default_value_t = controller::DEFAULT_CONCURRENT_EVICTIONS)]
    concurrent_evictions: usize,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    #[command(flatten)]
    reconcile: ReconcileArgs,

    /// Multi-document YAML with NodeGroups, Nodes and the checksum Secret
    #[arg(long)]
    manifests: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("nodegroup-drainer v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Run(run_args) => run_reconciler(run_args).await,
        Commands::Once(once_args) => run_single_pass(once_args).await,
        Commands::Plan(plan_args) => run_plan(plan_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    // stdout is reserved for command output such as the plan report.
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn kube_state(
    args: &ReconcileArgs,
    concurrent_evictions: usize,
) -> Result<Arc<ControllerState>, Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let cluster = KubeCluster::new(client, concurrent_evictions);
    Ok(Arc::new(ControllerState::new(
        Arc::new(cluster),
        args.config(),
    )))
}

async fn run_reconciler(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.reconcile.log_format);

    info!(
        "Starting nodegroup-drainer v{}",
        env!("CARGO_PKG_VERSION")
    );

    let schedule = trigger::parse_schedule(&args.schedule)?;
    let state = kube_state(&args.reconcile, args.concurrent_evictions).await?;

    if state.config.dry_run {
        info!("Dry-run mode: node changes are logged, not written");
    }

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = nodegroup_drainer::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    trigger::run_scheduled(state, schedule).await
}

async fn run_single_pass(args: OnceArgs) -> Result<(), Error> {
    init_tracing(args.reconcile.log_format);

    let state = kube_state(&args.reconcile, args.concurrent_evictions).await?;
    let report = trigger::run_once(&state).await?;

    info!(
        "Single pass finished: {} changed, {} failed",
        report.applied(),
        report.failed()
    );
    Ok(())
}

async fn run_plan(args: PlanArgs) -> Result<(), Error> {
    init_tracing(args.reconcile.log_format);

    let cluster = InMemoryCluster::from_manifest_file(&args.manifests)?;
    let config = ReconcilerConfig {
        dry_run: true,
        ..args.reconcile.config()
    };

    let report = controller::run_pass(&cluster, &config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
