use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Node;
use kube::config::{KubeConfigOptions, Kubeconfig};
use node_label_controller::controller::{
    self,
    config::{BASELINE_LABEL, TAINT_ANNOTATION, ZONE_ANNOTATION},
    ControllerConfig, ControllerState, KubeNodeApi,
};
use node_label_controller::{telemetry, Error};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to a kubeconfig file (in-cluster config is used when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Name of the kubeconfig context to use
    #[arg(long, env = "KUBE_CONTEXT")]
    context: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Annotation whose value becomes the node's zone labels
    #[arg(long, env = "ZONE_ANNOTATION", default_value = ZONE_ANNOTATION)]
    zone_annotation: String,

    /// Annotation whose value is parsed into node taints
    #[arg(long, env = "TAINT_ANNOTATION", default_value = TAINT_ANNOTATION)]
    taint_annotation: String,

    /// Label applied to every node, as KEY=VALUE (repeatable)
    #[arg(long = "baseline-label", value_parser = parse_key_val)]
    baseline_labels: Vec<(String, String)>,

    /// Do not apply any baseline label
    #[arg(long, conflicts_with = "baseline_labels")]
    no_baseline_label: bool,

    /// Send patches as server-side dry runs (nothing is persisted)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Address for the health, readiness and metrics server
    #[arg(long, env = "PROBE_ADDR", default_value = "0.0.0.0:8080")]
    probe_addr: SocketAddr,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        let baseline_labels: BTreeMap<String, String> = if self.no_baseline_label {
            BTreeMap::new()
        } else if self.baseline_labels.is_empty() {
            BTreeMap::from([(BASELINE_LABEL.0.to_string(), BASELINE_LABEL.1.to_string())])
        } else {
            self.baseline_labels.iter().cloned().collect()
        };

        ControllerConfig {
            zone_annotation: self.zone_annotation.clone(),
            taint_annotation: self.taint_annotation.clone(),
            baseline_labels,
            workers: self.workers,
            dry_run: self.dry_run,
            ..Default::default()
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    if key.trim().is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in `{s}`"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Node Label Controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => Ok(run_operator(run_args).await?),
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let text_layer = (format == LogFormat::Text).then(|| fmt::layer().with_target(true));
    let json_layer = (format == LogFormat::Json).then(|| fmt::layer().json());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn build_client(
    kubeconfig: Option<&PathBuf>,
    context: Option<&String>,
) -> Result<kube::Client, Error> {
    let options = KubeConfigOptions {
        context: context.cloned(),
        ..Default::default()
    };

    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::ConfigError(format!("Failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::ConfigError(format!("Invalid kubeconfig: {}", e)))?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::ConfigError(format!("Invalid kubeconfig: {}", e)))?,
        (None, None) => kube::Config::infer()
            .await
            .map_err(|e| Error::ConfigError(format!("Failed to infer cluster config: {}", e)))?,
    };

    kube::Client::try_from(config).map_err(Error::KubeError)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received termination signal, shutting down...");
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting Node Label Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = args.controller_config();
    config.validate()?;

    let client = build_client(args.kubeconfig.as_ref(), args.context.as_ref()).await?;
    info!("Connected to Kubernetes cluster");

    if config.dry_run {
        info!("Dry-run mode: patches are validated by the API server but not persisted");
    }

    let api = Arc::new(KubeNodeApi::new(client.clone(), config.dry_run));
    let state = Arc::new(ControllerState::new(api, config));

    #[cfg(feature = "rest-api")]
    let probe_server = {
        let cache = Arc::clone(&state.cache);
        let addr = args.probe_addr;
        tokio::spawn(async move {
            if let Err(e) = node_label_controller::rest_api::run_server(addr, cache).await {
                tracing::error!("Probe server error: {:?}", e);
            }
        })
    };
    #[cfg(not(feature = "rest-api"))]
    let _ = args.probe_addr;

    let nodes: kube::Api<Node> = kube::Api::all(client);
    let result = controller::run_controller(state, nodes, shutdown_signal()).await;

    #[cfg(feature = "rest-api")]
    probe_server.abort();

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
