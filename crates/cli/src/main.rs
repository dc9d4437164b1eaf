use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reflex_core::Object;
use reflex_kubehub::KubeObject;
use reflex_reflector::{Reflector, ReflectorConfig};
use reflex_store::{Cache, CacheError, Fifo, Popped, Store};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "reflexctl", version, about = "Mirror a Kubernetes collection through a reflector")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects once into a store and print them
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Keep a work queue in sync and print +/- lines as entries are popped
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("REFLEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFLEX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REFLEX_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let resources = reflex_kubehub::discover().await.context("discovering resources")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let (lw, kind) = reflex_kubehub::connect(&gvk, ns).await?;
            let store = Arc::new(Store::<KubeObject>::new());
            let reflector = Reflector::new(lw, kind, Arc::clone(&store)).with_config(ReflectorConfig::from_env());
            let version = reflector.list().await.with_context(|| format!("listing {}", gvk))?;

            let mut items = store.list();
            items.sort_by_key(|o| o.key());
            match cli.output {
                Output::Human => {
                    println!("{:<48} VERSION", "KEY");
                    for item in &items {
                        println!("{:<48} {}", item.key(), item.version());
                    }
                    eprintln!("{} objects at version {}", items.len(), version);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let (lw, kind) = reflex_kubehub::connect(&gvk, ns).await?;
            let fifo = Arc::new(Fifo::<KubeObject>::new());
            let reflector = Arc::new(Reflector::new(lw, kind, Arc::clone(&fifo)).with_config(ReflectorConfig::from_env()));

            let runner = tokio::spawn({
                let reflector = Arc::clone(&reflector);
                async move { reflector.run().await }
            });
            let stop = reflector.stop_token();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl-C received; stopping reflector"),
                    Err(e) => error!(error = %e, "failed to listen for Ctrl-C; stopping reflector"),
                }
                stop.cancel();
            });

            // The reflector closes the queue when it stops, which ends this loop.
            loop {
                match fifo.pop().await {
                    Ok(Popped::Object(obj)) => match cli.output {
                        Output::Human => println!("+ {}@{}", obj.key(), obj.version()),
                        Output::Json => println!("{}", serde_json::json!({ "op": "upsert", "key": obj.key(), "version": obj.version() })),
                    },
                    Ok(Popped::Deleted(key)) => match cli.output {
                        Output::Human => println!("- {}", key),
                        Output::Json => println!("{}", serde_json::json!({ "op": "delete", "key": key })),
                    },
                    Err(CacheError::Closed) => break,
                }
            }
            runner.await.context("reflector task")?;
            info!(last_version = %reflector.last_version(), "watch ended");
        }
    }

    Ok(())
}
