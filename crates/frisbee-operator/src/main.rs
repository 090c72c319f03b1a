//! Frisbee operator entry point

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use frisbee_common::crd::{Cascade, Chaos, Cluster, Service, VirtualObject};
use frisbee_common::telemetry::{init_telemetry, TelemetryConfig};
use frisbee_common::{DEFAULT_WEBHOOK_PORT, FIELD_MANAGER};
use frisbee_lifecycle::expressions::alert::{KubeAnnotationWriter, NoDataPolicy};
use frisbee_lifecycle::{AlertingClient, AlertingRegistry, GrafanaClient};
use frisbee_operator::controller::Context;
use frisbee_operator::controller_runner::build_controllers;
use frisbee_operator::webhook::{self, WebhookState};

#[derive(Parser, Debug)]
#[command(name = "frisbee-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers and the alert webhook
    Run(RunArgs),
    /// Print the CRDs as YAML
    Crd,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Port of the alert webhook
    #[arg(long, env = "FRISBEE_WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// What to do with no_data alerts (ignore or record)
    #[arg(long, env = "FRISBEE_NODATA_POLICY", default_value = "ignore")]
    nodata_policy: String,

    /// Grafana endpoint alerts are registered with
    #[arg(long, env = "FRISBEE_GRAFANA_URL")]
    grafana_url: Option<String>,

    /// Grafana API token
    #[arg(long, env = "FRISBEE_GRAFANA_TOKEN", hide_env_values = true)]
    grafana_token: Option<String>,

    /// Scenarios served by the Grafana endpoint
    #[arg(
        long = "scenario",
        env = "FRISBEE_SCENARIOS",
        value_delimiter = ',',
        default_value = "default"
    )]
    scenarios: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => print_crds(),
        Some(Commands::Run(args)) => run(args).await,
        None => run(RunArgs::parse_defaults()?).await,
    }
}

impl RunArgs {
    /// Arguments of `run` taken from the environment alone
    fn parse_defaults() -> anyhow::Result<Self> {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: RunArgs,
        }
        let wrapper = Wrapper::try_parse_from(["frisbee-operator"])?;
        Ok(wrapper.args)
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        Cluster::crd(),
        Cascade::crd(),
        Chaos::crd(),
        Service::crd(),
        VirtualObject::crd(),
    ];

    let mut docs = Vec::with_capacity(crds.len());
    for crd in &crds {
        docs.push(
            serde_yaml::to_string(crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?,
        );
    }
    println!("{}", docs.join("---\n"));
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let policy: NoDataPolicy = args
        .nodata_policy
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid no_data policy: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let alerting = Arc::new(AlertingRegistry::new());
    if let Some(url) = &args.grafana_url {
        let grafana: Arc<dyn AlertingClient> =
            Arc::new(GrafanaClient::new(url.clone(), args.grafana_token.clone()));
        for scenario in &args.scenarios {
            alerting.register(scenario, Arc::clone(&grafana))?;
        }
        tracing::info!(url = %url, scenarios = args.scenarios.len(), "Grafana alerting enabled");
    } else {
        tracing::warn!("No Grafana endpoint configured, metrics expressions will fail");
    }

    let ctx = Arc::new(Context::new(client.clone(), alerting));

    let cancel = CancellationToken::new();
    let state = Arc::new(WebhookState {
        writer: Arc::new(KubeAnnotationWriter::new(client.clone())),
        policy,
    });
    let webhook = tokio::spawn(webhook::serve(args.webhook_port, state, cancel.clone()));

    tracing::info!("Starting Frisbee controllers...");
    futures::future::join_all(build_controllers(client, ctx)).await;
    tracing::info!("Controllers stopped");

    cancel.cancel();
    match webhook.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "alert webhook failed"),
        Err(e) => tracing::error!(error = %e, "alert webhook task panicked"),
    }

    Ok(())
}

async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let all = [
        (Cluster::crd_name(), Cluster::crd()),
        (Cascade::crd_name(), Cascade::crd()),
        (Chaos::crd_name(), Chaos::crd()),
        (Service::crd_name(), Service::crd()),
        (VirtualObject::crd_name(), VirtualObject::crd()),
    ];

    for (name, crd) in &all {
        tracing::info!("Installing {} CRD...", name);
        crds.patch(name, &params, &Patch::Apply(crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Frisbee CRDs installed/updated");
    Ok(())
}
