use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kapply_apply::{parse_manifests, sort_for_apply, ManagerOptions, ManifestLimits, ResourceManager};
use kapply_core::{Object, RecordStore};
use kapply_inventory::InventoryManager;
use kapply_kubehub::{ConfigMapRecordStore, KubeObjectStore};
use kapply_persist::SqliteRecordStore;
use kube::Client;
use tokio::signal;
use tracing::{info, warn};

mod pipeline;
mod render;

use pipeline::{InventoryKey, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "kapplyctl", version, about = "Apply Kubernetes manifests with inventory-based pruning")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    /// ConfigMap in the inventory namespace
    Configmap,
    /// Local SQLite file (KAPPLY_DB_PATH)
    Sqlite,
}

#[derive(Args, Debug)]
struct FileArgs {
    /// Manifest file (YAML or JSON, multi-document), or "-" for stdin
    #[arg(short = 'f', long = "filename", required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct InventoryArgs {
    #[arg(long = "inventory-name")]
    name: String,
    #[arg(long = "inventory-namespace", default_value = "default")]
    namespace: String,
    #[arg(long = "inventory-backend", env = "KAPPLY_INVENTORY_BACKEND", value_enum, default_value_t = Backend::Configmap)]
    backend: Backend,
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Wait for applied objects to become ready and deleted ones to disappear
    #[arg(long = "wait", action = ArgAction::SetTrue)]
    wait: bool,
    /// Wait timeout in seconds
    #[arg(long = "timeout", default_value_t = 120)]
    timeout: u64,
    /// Poll interval in seconds
    #[arg(long = "interval", default_value_t = 2)]
    interval: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply manifests and record them in the inventory; with --prune, delete objects no longer listed
    Apply {
        #[command(flatten)]
        files: FileArgs,
        #[command(flatten)]
        inventory: InventoryArgs,
        #[command(flatten)]
        wait: WaitArgs,
        /// Recreate objects whose immutable fields changed
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Delete objects recorded by the previous run that are no longer listed
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Show what apply would change without writing anything
    Diff {
        #[command(flatten)]
        files: FileArgs,
    },
    /// Delete every object recorded in the inventory, then the inventory
    Delete {
        #[command(flatten)]
        inventory: InventoryArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Print the stored inventory
    Inventory {
        #[command(flatten)]
        inventory: InventoryArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("KAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAPPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAPPLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_source(path: &Path) -> Result<Vec<String>> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading manifests from stdin")?;
        return Ok(vec![buf]);
    }
    if path.is_dir() {
        return Err(anyhow!("{} is a directory; pass manifest files with -f", path.display()));
    }
    Ok(vec![std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?])
}

fn load_objects(files: &FileArgs) -> Result<Vec<Object>> {
    let limits = ManifestLimits::from_env();
    let mut objects = Vec::new();
    for path in &files.files {
        for text in read_source(path)? {
            let parsed = parse_manifests(&text, limits).with_context(|| format!("parsing {}", path.display()))?;
            objects.extend(parsed);
        }
    }
    sort_for_apply(&mut objects);
    info!(objects = objects.len(), "manifests loaded");
    Ok(objects)
}

async fn connect() -> Result<(Client, ResourceManager)> {
    let client = kapply_kubehub::get_kube_client().await?;
    let store = Arc::new(KubeObjectStore::new(client.clone(), kapply_kubehub::field_manager_from_env()));
    Ok((client, ResourceManager::new(store, ManagerOptions::from_env())))
}

fn inventory_manager(client: &Client, args: &InventoryArgs) -> Result<(InventoryManager, InventoryKey)> {
    let records: Arc<dyn RecordStore> = match args.backend {
        Backend::Configmap => {
            Arc::new(ConfigMapRecordStore::new(client.clone(), kapply_kubehub::field_manager_from_env()))
        }
        Backend::Sqlite => Arc::new(SqliteRecordStore::open_default()?),
    };
    let key = InventoryKey { name: args.name.clone(), namespace: args.namespace.clone() };
    Ok((InventoryManager::new(records, "kapplyctl"), key))
}

fn run_options(wait: &WaitArgs, force: bool, prune: bool) -> RunOptions {
    RunOptions {
        force,
        prune,
        wait: wait.wait,
        interval: Duration::from_secs(wait.interval.max(1)),
        timeout: Duration::from_secs(wait.timeout),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Apply { files, inventory, wait, force, prune } => {
            let objects = load_objects(&files)?;
            let (client, mgr) = connect().await?;
            let (inv, key) = inventory_manager(&client, &inventory)?;
            let opts = run_options(&wait, force, prune);
            let (report, res) = pipeline::apply_run(&mgr, &inv, &key, &objects, &opts).await;
            match cli.output {
                Output::Human => {
                    print!("{}", render::change_set(&report.applied, false));
                    print!("{}", render::change_set(&report.pruned, false));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            info!(applied = %render::summary(&report.applied), pruned = %render::summary(&report.pruned), "apply finished");
            res
        }
        Commands::Diff { files } => {
            let objects = load_objects(&files)?;
            let (_, mgr) = connect().await?;
            let cs = pipeline::diff_run(&mgr, &objects).await?;
            match cli.output {
                Output::Human => print!("{}", render::change_set(&cs, true)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&cs)?),
            }
            Ok(())
        }
        Commands::Delete { inventory, wait } => {
            let (client, mgr) = connect().await?;
            let (inv, key) = inventory_manager(&client, &inventory)?;
            let (cs, res) = pipeline::delete_run(&mgr, &inv, &key, &run_options(&wait, false, true)).await;
            match cli.output {
                Output::Human => print!("{}", render::change_set(&cs, false)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&cs)?),
            }
            res
        }
        Commands::Inventory { inventory } => {
            let client = kapply_kubehub::get_kube_client().await?;
            let (inv, key) = inventory_manager(&client, &inventory)?;
            let stored = inv
                .load(&key.name, &key.namespace)
                .await?
                .ok_or_else(|| anyhow!("inventory {}/{} not found", key.namespace, key.name))?;
            match cli.output {
                Output::Human => {
                    for r in stored.references()? {
                        println!("{}", r);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stored)?),
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    tokio::select! {
        res = run(cli) => res,
        _ = signal::ctrl_c() => {
            warn!("interrupted");
            Err(anyhow!("interrupted"))
        }
    }
}
