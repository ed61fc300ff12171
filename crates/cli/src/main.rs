use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use engine::{RuntimeConfig, RuntimeEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve user-authored functions over HTTP.
#[derive(Parser, Debug)]
#[command(name = "snippetd", version)]
struct Args {
    /// Config file; otherwise SNIPPET_CONFIG and the default locations are searched
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `[server]` host and port
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snippetd=info,engine=info,pool=info,transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::load(),
    };

    let engine = RuntimeEngine::start(&config)
        .await
        .context("failed to start function runtime")?;

    let addr = args.listen.unwrap_or_else(|| config.listen_addr());
    transport::serve_http(engine.dispatcher(), &addr, &config.prefixes())
        .await
        .with_context(|| format!("server on {} failed", addr))?;
    Ok(())
}
