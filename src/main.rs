//! migslicer - per-node MIG slicing controller

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use migslicer::config::{ControllerArgs, ControllerConfig};
use migslicer::controller::{error_policy, reconcile, Context, FIELD_MANAGER};
use migslicer::crd::{MigNode, PreparedPartition};
use migslicer::discovery::{discover_placements, Discovery};
use migslicer::gpu::nvml::{NvmlBackend, DEFAULT_NVML_LIBRARY};
use migslicer::gpu::MigBackend;
use migslicer::recovery::recover_existing_partitions;
use migslicer::retry::RetryConfig;
use migslicer::startup::prepare_node;

/// migslicer - carves MIG slices for allocations written by a cluster scheduler
#[derive(Parser, Debug)]
#[command(name = "migslicer", version, about, long_about = None)]
struct Cli {
    /// Print the MigNode CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node controller (default mode)
    ///
    /// Discovers placements and recovers existing partitions once, then
    /// watches this node's MigNode record and reconciles its allocations.
    Controller(RunArgs),

    /// Print the placement catalog and existing partitions of this node
    ///
    /// Only reads the hardware; nothing is written to the cluster.
    Discover {
        /// Path or soname of the NVML library
        #[arg(long, env = "NVML_LIBRARY", default_value = DEFAULT_NVML_LIBRARY)]
        nvml_library: String,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    controller: ControllerArgs,

    /// Apply the MigNode CRD before starting
    #[arg(long, env = "MIGSLICER_INSTALL_CRD")]
    install_crd: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverReport {
    discovery: Discovery,
    prepared: std::collections::BTreeMap<String, PreparedPartition>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MigNode::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Discover { nvml_library }) => run_discover(&nvml_library),
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            let args = RunArgs::from_env();
            run_controller(args).await
        }
    }
}

impl RunArgs {
    /// Arguments for the default mode, taken from the environment only
    fn from_env() -> Self {
        #[derive(Parser)]
        struct EnvOnly {
            #[command(flatten)]
            run: RunArgs,
        }
        EnvOnly::parse_from(["migslicer"]).run
    }
}

/// Print what discovery and recovery see on this node
fn run_discover(nvml_library: &str) -> anyhow::Result<()> {
    let backend = NvmlBackend::new(nvml_library)
        .map_err(|e| anyhow::anyhow!("Failed to load NVML: {}", e))?;
    let report = DiscoverReport {
        discovery: discover_placements(&backend)?,
        prepared: recover_existing_partitions(&backend)?,
    };
    println!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

/// Install the MigNode CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    tracing::info!("Installing MigNode CRD...");
    crds.patch(
        "mignodes.migslicer.dev",
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&MigNode::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MigNode CRD: {}", e))?;
    Ok(())
}

/// Run the node controller
async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    let config = ControllerConfig::try_from(args.controller)?;
    tracing::info!(node = %config.node_name, namespace = %config.namespace, "starting migslicer controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let backend: Arc<dyn MigBackend> = Arc::new(
        NvmlBackend::new(&config.nvml_library)
            .map_err(|e| anyhow::anyhow!("Failed to load NVML: {}", e))?,
    );

    let ctx = Arc::new(Context::builder(client.clone(), backend, config.clone()).build());

    prepare_node(&ctx, &RetryConfig::default())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to prepare node: {}", e))?;

    let records: Api<MigNode> = Api::namespaced(client, &config.namespace);
    let watcher = WatcherConfig::default().fields(&format!("metadata.name={}", config.node_name));

    Controller::new(records, watcher)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Node reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Node reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("migslicer controller stopped");
    Ok(())
}
