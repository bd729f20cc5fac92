use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use recon_controller::{wait_for_cache_sync, Controller, ControllerConfig, LogRecorder};
use recon_core::{Change, EventRecorder};
use recon_kubehub::{KubeEventRecorder, KubeFeed};
use recon_store::{Informer, InformerConfig, ObjectCache};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod mirror;

use mirror::MirrorReconciler;

#[derive(Parser, Debug)]
#[command(name = "reconctl", version, about = "Recon level-triggered controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Path to a kubeconfig. Without it `KUBECONFIG` and the in-cluster
    /// environment are tried in the usual order.
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// API server address. Overrides any value in the kubeconfig.
    #[arg(long = "master", global = true)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile objects of a GVK into the in-memory mirror until interrupted
    Run(RunArgs),
    /// Sync the cache for a GVK and print its keys
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "example.com/v1alpha1/User"
        gvk: String,
        /// Give up if the initial listing takes longer (0 waits indefinitely)
        #[arg(long = "sync-timeout-secs", env = "RECON_SYNC_TIMEOUT_SECS", default_value_t = 60)]
        sync_timeout_secs: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// GVK key, e.g. "v1/ConfigMap" or "example.com/v1alpha1/User"
    gvk: String,
    /// Concurrent reconcile workers
    #[arg(long = "workers", env = "RECON_WORKERS", default_value_t = 2)]
    workers: usize,
    /// Replay the whole cache this often (0 disables)
    #[arg(long = "resync-secs", env = "RECON_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,
    /// Give up if the initial listing takes longer (0 waits indefinitely)
    #[arg(long = "sync-timeout-secs", env = "RECON_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,
    /// First per-key retry delay
    #[arg(long = "base-delay-ms", default_value_t = 5)]
    base_delay_ms: u64,
    /// Cap on the per-key retry delay
    #[arg(long = "max-delay-secs", default_value_t = 1000)]
    max_delay_secs: u64,
    /// Overall enqueue rate (0 disables)
    #[arg(long = "qps", default_value_t = 10.0)]
    qps: f64,
    #[arg(long = "burst", default_value_t = 100)]
    burst: u32,
    /// Controller name used for the queue and as event reporter
    #[arg(long = "name", default_value = "recon-controller")]
    name: String,
    /// Log events instead of publishing them to the API server
    #[arg(long = "log-events", action = ArgAction::SetTrue)]
    log_events: bool,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: self.name.clone(),
            sync_timeout: secs_or_none(self.sync_timeout_secs),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            qps: self.qps,
            burst: self.burst,
        }
    }

    fn informer_config(&self) -> InformerConfig {
        InformerConfig { resync_period: secs_or_none(self.resync_secs), ..InformerConfig::default() }
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RECON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `stop` on Ctrl-C.
fn stop_on_ctrl_c(stop: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; shutting down"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
        }
        stop.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();
    let client = recon_kubehub::client(cli.kubeconfig.as_deref(), cli.master.as_deref()).await?;

    match cli.command {
        Commands::Run(args) => {
            info!(gvk = %args.gvk, ns = ?ns, workers = args.workers, "run invoked");
            let feed = KubeFeed::new(client.clone(), &args.gvk, ns).await?;
            let cache = ObjectCache::new();
            let mirror = Arc::new(MirrorReconciler::new(cache.clone()));
            let recorder: Arc<dyn EventRecorder> = if args.log_events {
                Arc::new(LogRecorder)
            } else {
                Arc::new(KubeEventRecorder::new(client, &args.name))
            };
            let controller = Controller::new(args.controller_config(), cache.clone(), mirror.clone(), recorder);
            let informer =
                Informer::new(Arc::new(feed), cache, controller.observer()).with_config(args.informer_config());

            let stop = CancellationToken::new();
            stop_on_ctrl_c(stop.clone());
            let informer_task = tokio::spawn(informer.run(stop.clone()));
            let result = controller.run(args.workers, stop.clone()).await;
            stop.cancel();
            if let Err(e) = informer_task.await {
                error!(error = %e, "informer task failed");
            }
            result.context("controller")?;

            info!(writes = mirror.writes(), "controller stopped");
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&mirror.snapshot())?);
            }
        }
        Commands::Ls { gvk, sync_timeout_secs } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let cache = list_once(client, &gvk, ns, secs_or_none(sync_timeout_secs)).await?;
            let mut items = cache.list();
            items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

            match cli.output {
                Output::Human => {
                    println!("{:<40} {:<18} AGE", "KEY", "RESOURCE_VERSION");
                    for obj in &items {
                        let key = obj.key().map(|k| k.to_string()).unwrap_or_else(|_| "-".to_string());
                        let rv = obj.resource_version.as_deref().unwrap_or("-");
                        println!("{:<40} {:<18} {}", key, rv, render_age(created_at(&obj.raw)));
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        key: String,
                        resource_version: Option<&'a str>,
                    }
                    let rows: Vec<_> = items
                        .iter()
                        .filter_map(|o| o.key().ok().map(|k| Row { key: k.to_string(), resource_version: o.resource_version.as_deref() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
    }

    Ok(())
}

/// Run an informer just long enough to fill the cache once.
async fn list_once(client: kube::Client, gvk: &str, ns: Option<&str>, timeout: Option<Duration>) -> Result<ObjectCache> {
    let feed = KubeFeed::new(client, gvk, ns).await?;
    let cache = ObjectCache::new();
    let informer = Informer::new(Arc::new(feed), cache.clone(), Arc::new(|_: Change| {}))
        .with_config(InformerConfig { resync_period: None, ..InformerConfig::default() });
    let stop = CancellationToken::new();
    stop_on_ctrl_c(stop.clone());
    let task = tokio::spawn(informer.run(stop.clone()));
    let synced = wait_for_cache_sync(&[&cache], &stop, timeout).await;
    stop.cancel();
    let _ = task.await;
    synced.with_context(|| format!("listing {gvk}"))?;
    Ok(cache)
}

fn created_at(raw: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
    let ts = raw.get("metadata")?.get("creationTimestamp")?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(ts).ok().map(|t| t.with_timezone(&chrono::Utc))
}

fn render_age(created: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (chrono::Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_map_onto_configs() {
        let cli = Cli::try_parse_from([
            "reconctl",
            "run",
            "example.com/v1alpha1/User",
            "--workers",
            "4",
            "--resync-secs",
            "0",
            "--sync-timeout-secs",
            "0",
            "--qps",
            "0",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.workers, 4);
        assert_eq!(args.informer_config().resync_period, None);
        let cfg = args.controller_config();
        assert_eq!(cfg.sync_timeout, None);
        assert_eq!(cfg.qps, 0.0);
        assert_eq!(cfg.base_delay, Duration::from_millis(5));
        assert_eq!(cfg.max_delay, Duration::from_secs(1000));
        assert_eq!(cfg.name, "recon-controller");
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["reconctl", "ls", "v1/ConfigMap", "-o", "json", "--ns", "default"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn kubeconfig_list_is_left_to_client_inference() {
        std::env::set_var("KUBECONFIG", "/etc/kube/a:/etc/kube/b");
        let cli = Cli::try_parse_from(["reconctl", "ls", "v1/ConfigMap"]).unwrap();
        assert_eq!(cli.kubeconfig, None);
        let cli = Cli::try_parse_from(["reconctl", "ls", "v1/ConfigMap", "--kubeconfig", "/tmp/kc"]).unwrap();
        assert_eq!(cli.kubeconfig, Some(PathBuf::from("/tmp/kc")));
    }

    #[test]
    fn ages_render_compactly() {
        assert_eq!(render_age(None), "-");
        let created = chrono::Utc::now() - chrono::Duration::minutes(26 * 60 + 30);
        assert_eq!(render_age(Some(created)), "1d2h");
        let raw = serde_json::json!({ "metadata": { "creationTimestamp": "2024-01-01T00:00:00Z" } });
        assert!(created_at(&raw).is_some());
    }
}
