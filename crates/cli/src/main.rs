use clap::{Parser, Subcommand};
use graphstore_core::config::{self, StoreConfig};
use graphstore_core::lifecycle::bootstrap_admin;
use graphstore_core::upgrade::{read_version, UpgradeOutcome};
use graphstore_core::storage::StoreLayout;
use graphstore_core::{GraphId, Store};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphstore", about = "Administer a graphstore storage root")]
struct Args {
    /// TOML config file; missing file means defaults
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Storage root (overrides the config file)
    #[arg(short, long)]
    storage_root: Option<PathBuf>,

    /// Server identifier the administrative database is named after
    #[arg(long)]
    server_name: Option<String>,

    /// Skip the fsync after every journal record
    #[arg(long, default_value_t = false)]
    no_sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upgrade the root if needed and bootstrap the administrative database
    Init,
    /// Create the on-disk layout of a database
    Create { name: String },
    /// Delete a database and every file it owns
    Delete { name: String },
    /// Walk the on-disk format to the version this build expects
    Upgrade,
    /// Rebuild a graph from its checkpoint and journal
    Replay {
        /// Graph identifier, `<database>/<role>`
        graph: String,
        /// Print every triple as a record
        #[arg(long, default_value_t = false)]
        dump: bool,
    },
    /// Fold a graph's journal into a new checkpoint
    Compact { graph: String },
    /// Print the on-disk and expected format versions
    Version,
}

fn load_config(args: &Args) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = StoreConfig::load(&args.config)?.unwrap_or_default();
    if let Some(root) = &args.storage_root {
        config.storage_root = root.clone();
    }
    if let Some(name) = &args.server_name {
        config.server_name = name.clone();
    }
    if args.no_sync {
        config.sync_on_append = false;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("graphstore_cli=info".parse()?)
                .add_directive("graphstore_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let store_config = load_config(&args)?;
    if store_config.storage_root.exists() && !store_config.storage_root.is_dir() {
        eprintln!(
            "Error: storage_root '{}' exists but is not a directory",
            store_config.storage_root.display()
        );
        std::process::exit(1);
    }
    let layout = StoreLayout::new(store_config.storage_root.clone());
    // Opening upgrades the root, so `version` never opens it.
    let open = move || Store::open(store_config);

    match args.command {
        Command::Init => {
            let store = open()?;
            let admin = bootstrap_admin(&store)?;
            tracing::info!(
                "Store ready ({:?}), admin database '{}'",
                store.upgrade_outcome(),
                admin.name()
            );
        }
        Command::Create { name } => {
            let store = open()?;
            if store.database_exists(&name) {
                eprintln!("Error: database '{}' already exists", name);
                std::process::exit(1);
            }
            if let Err(e) = store.create_database_layout(&name) {
                if store.database_exists(&name) {
                    tracing::warn!("Removing partial layout of '{}'", name);
                    store.delete_database_layout(&name)?;
                }
                return Err(e.into());
            }
            println!("{}", json!({ "created": name }));
        }
        Command::Delete { name } => {
            let store = open()?;
            store.delete_database_layout(&name)?;
            println!("{}", json!({ "deleted": name }));
        }
        Command::Upgrade => {
            let store = open()?;
            let report = match store.upgrade_outcome() {
                UpgradeOutcome::Initialized => json!({ "initialized": config::CURRENT_STORE_VERSION }),
                UpgradeOutcome::UpToDate => json!({ "up_to_date": config::CURRENT_STORE_VERSION }),
                UpgradeOutcome::Upgraded { path } => json!({ "upgraded": path }),
            };
            println!("{}", report);
        }
        Command::Replay { graph, dump } => {
            let store = open()?;
            let replay = store.replay(&GraphId::new(graph.clone()))?;
            if dump {
                for triple in &replay.triples {
                    print!("{}", triple.to_record());
                }
            }
            let stats = &replay.stats;
            if stats.truncated_files > 0 {
                tracing::warn!(
                    "Replay of {} ignored incomplete trailing records in {} file(s)",
                    graph,
                    stats.truncated_files
                );
            }
            eprintln!(
                "{}",
                json!({
                    "graph": graph,
                    "checkpoint": replay.checkpoint,
                    "triples": replay.triples.len(),
                    "layers": stats.layers,
                    "added": stats.added,
                    "removed": stats.removed,
                })
            );
        }
        Command::Compact { graph } => {
            let store = open()?;
            let checkpoint = store.compact(&GraphId::new(graph.clone()))?;
            println!("{}", json!({ "graph": graph, "checkpoint": checkpoint }));
        }
        Command::Version => {
            let on_disk = read_version(&layout)?;
            println!(
                "{}",
                json!({ "on_disk": on_disk, "expected": config::CURRENT_STORE_VERSION })
            );
        }
    }
    Ok(())
}
