use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use podtail_engine::{EngineConfig, LogEngine, LogRecord};
use podtail_k8s::KubeClusterClient;

/// Podtail - tail container logs across many pods and namespaces
#[derive(Parser, Debug)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch (repeatable). Empty watches everything the
    /// credential can see.
    #[arg(short, long = "namespace", value_name = "NAMESPACE")]
    namespaces: Vec<String>,

    /// Engine configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Restrict the log subscription to a single namespace
    #[arg(long, value_name = "NAMESPACE")]
    follow: Option<String>,

    /// Emit records as JSON lines instead of human-readable text
    #[arg(long)]
    json: bool,

    /// Override the concurrent stream ceiling
    #[arg(long, value_name = "N")]
    max_streams: Option<usize>,

    /// Print the known pods and exit instead of tailing
    #[arg(long)]
    list: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    // Command line wins over the file.
    if !args.namespaces.is_empty() {
        config.namespace_allowlist = args.namespaces.clone();
    }
    if let Some(max) = args.max_streams {
        config.max_concurrent_streams = max;
    }
    Ok(config)
}

fn print_record(record: &LogRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        println!(
            "{} {}/{}[{}] {}",
            record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.namespace,
            record.pod_name,
            record.container_name,
            record.line
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let client = KubeClusterClient::try_default()
        .await
        .context("failed to build cluster client")?;
    let engine = Arc::new(LogEngine::new(Arc::new(client), config));

    // Stays not-ready (and keeps retrying) until the first full list
    // succeeds.
    engine.run_until_ready().await?;
    tracing::info!("engine ready");

    if args.list {
        for pod in engine.list_known_pods(None)? {
            println!(
                "{}/{}\t{:?}\trestarts={}\tcontainers={}",
                pod.namespace,
                pod.name,
                pod.phase,
                pod.restart_count,
                pod.container_names().collect::<Vec<_>>().join(",")
            );
        }
        return Ok(());
    }

    let mut subscription = engine.subscribe(args.follow.clone());

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            shutdown_signal().await;
            engine.shutdown();
        });
    }

    while let Some(record) = subscription.recv().await {
        print_record(&record, args.json)?;
    }

    Ok(())
}
