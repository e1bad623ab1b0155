use std::sync::Arc;

use clap::Parser;
use kaito_common::features::FeatureGates;
use kube::Client;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

mod events;
mod expectations;
mod model;
mod nodeclaim;
mod nodes;
mod revision;
mod sku;
mod status;
mod util;
mod validation;
mod webhook;
mod workloads;
mod workspaces;

use expectations::Expectations;
use model::{PresetRegistry, StaticPresetRegistry};
use sku::SkuHandler;
use validation::Validator;
use workspaces::reconcile::Settings;

/// Cluster controller for `Workspace` resources: provisions GPU nodes and
/// rolls out inference or fine-tuning workloads for LLM presets.
#[derive(Parser, Debug)]
#[command(name = "kaito-workspace-operator")]
struct Args {
    /// Comma-separated feature gates, e.g.
    /// `DisableNodeAutoProvisioning=true,GatewayAPIInferenceExtension=false`.
    #[arg(long, env = "FEATURE_GATES", default_value = "")]
    feature_gates: String,

    /// Hash-prefix width used in revision names. Wider prefixes make
    /// collisions rarer at the cost of longer object names.
    #[arg(long, env = "REVISION_HASH_WIDTH", default_value_t = 5)]
    revision_hash_width: usize,

    /// Revisions retained per workspace before pruning, oldest first.
    #[arg(long, env = "MAX_REVISION_HISTORY", default_value_t = 10)]
    max_revision_history: usize,

    /// Port for /metrics and /healthz; disabled when unset.
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Port for the admission webhook (plain HTTP; TLS terminates upstream).
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8080)]
    webhook_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kaito_common::init();
    let args = Args::parse();
    let gates = FeatureGates::parse(&args.feature_gates)?;

    let client = Client::try_default().await?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        kaito_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    #[cfg(feature = "metrics")]
    if let Some(port) = args.metrics_port {
        tokio::spawn(util::metrics::run_metrics_server(port));
    }
    #[cfg(not(feature = "metrics"))]
    if args.metrics_port.is_some() {
        eprintln!("{}", "metrics requested but the binary was built without the 'metrics' feature".yellow());
    }

    let registry: Arc<dyn PresetRegistry> = Arc::new(StaticPresetRegistry);
    let expectations = Arc::new(Expectations::default());

    // Claim watch events pay down the expectations declared by the manager.
    tokio::spawn(nodeclaim::run_claim_observer(
        client.clone(),
        expectations.clone(),
        shutdown.clone(),
    ));

    let webhook_state = Arc::new(webhook::WebhookState {
        client: client.clone(),
        validator: Validator {
            registry: registry.clone(),
            sku: SkuHandler::from_env(),
            gates,
        },
    });
    tokio::spawn(webhook::run(
        webhook_state,
        args.webhook_port,
        shutdown.clone(),
    ));

    workspaces::reconcile::run(
        client,
        registry,
        expectations,
        Settings {
            gates,
            revision_hash_width: args.revision_hash_width,
            max_revision_history: args.max_revision_history,
        },
        shutdown,
    )
    .await?;
    println!("{}", "👋 Workspace operator stopped.".green());
    Ok(())
}
