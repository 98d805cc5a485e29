use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use drift_api::{AppSpec, AppStatus, DirectoryRenderer, DriftApi, Engine, Settings};
use drift_core::{OperationPhase, ResourceKey};
use drift_kubehub::KubeCluster;
use drift_sync::{Backoff, LabelSelector, RetryPolicy, SyncRequest, SyncScope};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "driftctl", version, about = "Drift CLI: compare and sync manifests against a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Settings file (exclusions, resource overrides, tracking, projects)
    #[arg(long = "settings", env = "DRIFT_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct AppArgs {
    /// Manifest directory, relative to --root
    path: String,
    /// Directory manifest paths are resolved against
    #[arg(long = "root", env = "DRIFT_ROOT", default_value = ".")]
    root: PathBuf,
    /// Application name (default: last path component)
    #[arg(long = "app")]
    app: Option<String>,
    /// Destination namespace
    #[arg(long = "ns", default_value = "default")]
    namespace: String,
    #[arg(long = "project")]
    project: Option<String>,
    /// Source repository URL checked against the project
    #[arg(long = "repo", default_value = "")]
    repo: String,
    /// Application sync option, e.g. CreateNamespace=true (repeatable)
    #[arg(long = "sync-option")]
    sync_options: Vec<String>,
}

impl AppArgs {
    fn spec(&self) -> AppSpec {
        let name = self.app.clone().unwrap_or_else(|| {
            self.path.trim_end_matches('/').rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("app").to_string()
        });
        let mut spec = AppSpec::new(name, self.path.clone(), self.namespace.clone()).repo(self.repo.clone());
        if let Some(p) = self.project.as_ref() {
            spec = spec.project(p.clone());
        }
        for o in self.sync_options.iter() {
            spec = spec.sync_option(o.clone());
        }
        spec
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print text diffs of resources that are not in sync
    Diff {
        #[command(flatten)]
        app: AppArgs,
        /// Exit non-zero when anything differs
        #[arg(long = "exit-code", action = ArgAction::SetTrue)]
        exit_code: bool,
    },
    /// Aggregate and per-resource health
    Health {
        #[command(flatten)]
        app: AppArgs,
    },
    /// Sync status, conditions and per-resource state
    Status {
        #[command(flatten)]
        app: AppArgs,
    },
    /// Apply desired state to the cluster and wait for the result
    Sync {
        #[command(flatten)]
        app: AppArgs,
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Recreate resources the server refuses to update
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        #[arg(long = "replace", action = ArgAction::SetTrue)]
        replace: bool,
        /// Only sync resources matching this label selector (a=b,c=d)
        #[arg(long = "selector", conflicts_with = "resources")]
        selector: Option<String>,
        /// Only sync this resource, as group/Kind/namespace/name (repeatable)
        #[arg(long = "resource")]
        resources: Vec<String>,
        /// Total attempts before the operation fails
        #[arg(long = "retry", default_value_t = 1)]
        retry: u32,
        /// Delay before the first retry, doubled per retry
        #[arg(long = "retry-backoff-secs", default_value_t = 5)]
        retry_backoff_secs: u64,
    },
    /// Keep the application reconciled against a live watch and print status changes
    Watch {
        #[command(flatten)]
        app: AppArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("DRIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DRIFT_METRICS_ADDR; expected host:port");
        }
    }
}

/// `group/Kind/namespace/name`; the core group and cluster scope are empty segments.
fn parse_key(s: &str) -> Option<ResourceKey> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [group, kind, ns, name] if !kind.is_empty() && !name.is_empty() => Some(ResourceKey::new(*group, *kind, *ns, *name)),
        [kind, name] if !kind.is_empty() && !name.is_empty() => Some(ResourceKey::new("", *kind, "", *name)),
        _ => None,
    }
}

async fn engine(settings: Option<&PathBuf>, app: &AppArgs) -> Result<Engine> {
    let settings = match settings {
        Some(p) => Settings::load(p)?,
        None => Settings::from_env(),
    };
    let cluster = KubeCluster::try_default().await.context("connecting to cluster")?;
    Ok(Engine::new(Arc::new(cluster), Arc::new(DirectoryRenderer::new(app.root.clone())), settings))
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_status(st: &AppStatus) {
    println!("{} • sync {} • health {} • revision {}", st.app, st.sync, st.health, st.revision.as_deref().unwrap_or("-"));
    for c in st.conditions.iter() {
        println!("  ! {:?}: {}", c.kind, c.message);
    }
    for r in st.resources.iter() {
        let health = r.health.as_ref().map(|h| h.status.to_string()).unwrap_or_else(|| "-".into());
        let mut flags = Vec::new();
        if r.hook {
            flags.push("hook");
        }
        if r.requires_pruning {
            flags.push("prune");
        }
        if !r.permitted {
            flags.push("forbidden");
        }
        println!("  {:<10} {:<12} w{:<3} {} {}", r.status.to_string(), health, r.wave, r.key, flags.join(","));
    }
    if !st.orphaned.is_empty() {
        println!("  orphaned: {}", st.orphaned.len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Diff { app, exit_code } => {
            let engine = engine(cli.settings.as_ref(), &app).await?;
            let spec = app.spec();
            let name = spec.name.clone();
            engine.register_app(spec).await?;
            let diffs = engine.diff(&name).await?;
            info!(app = %name, differing = diffs.len(), "diff computed");
            match cli.output {
                Output::Human => diffs.iter().for_each(|d| print!("{}", d.text)),
                Output::Json => print_json(&diffs)?,
            }
            if exit_code && !diffs.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Health { app } => {
            let engine = engine(cli.settings.as_ref(), &app).await?;
            let st = engine.register_app(app.spec()).await?;
            match cli.output {
                Output::Human => {
                    println!("{} • {}", st.app, st.health);
                    for r in st.resources.iter() {
                        if let Some(h) = r.health.as_ref() {
                            println!("  {:<12} {} {}", h.status.to_string(), r.key, h.message.as_deref().unwrap_or(""));
                        }
                    }
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Row<'a> { key: String, health: &'a drift_core::HealthState }
                    let rows: Vec<Row> = st.resources.iter().filter_map(|r| r.health.as_ref().map(|h| Row { key: r.key.to_string(), health: h })).collect();
                    print_json(&serde_json::json!({"app": st.app, "health": st.health, "resources": rows}))?;
                }
            }
        }
        Commands::Status { app } => {
            let engine = engine(cli.settings.as_ref(), &app).await?;
            let st = engine.register_app(app.spec()).await?;
            match cli.output {
                Output::Human => print_status(&st),
                Output::Json => print_json(&st)?,
            }
        }
        Commands::Sync { app, prune, dry_run, force, replace, selector, resources, retry, retry_backoff_secs } => {
            let scope = match (selector, resources.is_empty()) {
                (Some(sel), _) => SyncScope::Selector(LabelSelector::parse(&sel)?),
                (None, false) => {
                    let keys = resources.iter().map(|r| parse_key(r).with_context(|| format!("invalid resource {:?}", r))).collect::<Result<Vec<_>>>()?;
                    SyncScope::Resources(keys)
                }
                (None, true) => SyncScope::All,
            };
            let backoff = Backoff { duration_ms: retry_backoff_secs * 1_000, ..Backoff::default() };
            let mut request = SyncRequest::default().prune(prune).dry_run(dry_run).scope(scope).retry(RetryPolicy::new(retry, backoff));
            request.force = force;
            request.replace = replace;

            let engine = engine(cli.settings.as_ref(), &app).await?;
            let spec = app.spec();
            let name = spec.name.clone();
            engine.register_app(spec).await?;
            let id = engine.request_sync(&name, request).await?;
            let op = tokio::select! {
                op = engine.wait_operation(&name, id) => op?,
                _ = signal::ctrl_c() => {
                    warn!(app = %name, op = %id, "Ctrl-C received; terminating operation");
                    engine.terminate(&name).await?;
                    engine.wait_operation(&name, id).await?
                }
            };
            match cli.output {
                Output::Human => {
                    for r in op.result.iter() {
                        println!("  {:<12} {:?} {}", format!("{:?}", r.status), r.sync_phase, r.message);
                    }
                    println!("{} • {} • {}", op.app, op.phase, op.message);
                }
                Output::Json => print_json(&op)?,
            }
            if op.phase != OperationPhase::Succeeded {
                bail!("sync {} ended {}: {}", id, op.phase, op.message);
            }
        }
        Commands::Watch { app } => {
            let engine = engine(cli.settings.as_ref(), &app).await?;
            let spec = app.spec();
            let name = spec.name.clone();
            let namespace = spec.destination.namespace.clone();
            engine.register_app(spec).await?;
            let mut rx = engine.watch_status(&name)?;
            let (_backend, watcher) = engine.watch_live(Some(namespace));
            let mut last = None;
            loop {
                {
                    let st = rx.borrow_and_update();
                    let summary = (st.sync, st.health, st.conditions.len());
                    if last != Some(summary) {
                        last = Some(summary);
                        match cli.output {
                            Output::Human => print_status(&st),
                            Output::Json => println!("{}", serde_json::to_string(&*st)?),
                        }
                    }
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!("status channel closed; exiting watch loop");
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {
                        engine.refresh(&name).await?;
                    }
                }
            }
            engine.shutdown();
            watcher.abort();
        }
    }

    Ok(())
}
