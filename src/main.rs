use anyhow::{Context, Result};
use clap::Parser;
use locus::proxy::server::describe_metrics;
use locus::{Config, Server};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "locus")]
#[command(about = "A multi-site HTTP reverse proxy")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long = "conf", default_value = "/etc/locus.conf")]
    conf: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_metrics();

    let config = Config::load(&args.conf).await?;
    info!("loaded {} site configs from {}", config.sites.len(), args.conf);

    let server = Server::from_config(&config)
        .await?
        .with_metrics_handle(prometheus);
    server.run().await
}
