//! vmlet-ctl - Operator Command Line Interface
//!
//! Manages the node's sandbox and container metadata and the volumes
//! in its configured libvirt storage pools.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmlet_common::Config;
use vmlet_common::pool::DEFAULT_POOL;
use vmlet_meta_store::{MetaStore, MetaStoreOptions, PodSandboxConfig, SystemClock};
use vmlet_runtime::{ContainerConfig, RuntimeService, SandboxService};
use vmlet_storage::tool::{DEFAULT_CAPACITY, DEFAULT_CAPACITY_UNIT};
use vmlet_storage::{StorageOperations, StorageTool, VirshStorage};

#[derive(Parser, Debug)]
#[command(name = "vmlet-ctl")]
#[command(about = "vmlet operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/vmlet/vmlet.toml")]
    config: PathBuf,

    /// Metadata database path (overrides config)
    #[arg(long, env = "VMLET_DB")]
    db: Option<PathBuf>,

    /// libvirt connection URI (overrides config)
    #[arg(long, env = "LIBVIRT_DEFAULT_URI")]
    connect: Option<String>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the metadata collections
    Init,
    /// Pod sandbox records
    Sandbox {
        #[command(subcommand)]
        action: SandboxCommands,
    },
    /// Container records
    Container {
        #[command(subcommand)]
        action: ContainerCommands,
    },
    /// Base images in the image pool
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },
    /// Volumes in a storage pool
    Volume {
        /// Storage pool name
        #[arg(long, default_value = DEFAULT_POOL)]
        pool: String,

        #[command(subcommand)]
        action: VolumeCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SandboxCommands {
    /// List all sandboxes
    List,
    /// Show sandbox details
    Show {
        /// Sandbox ID
        sandbox_id: String,
    },
    /// Create a sandbox record
    Create {
        /// Pod name
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        /// Pod UID
        #[arg(long, default_value = "")]
        uid: String,
        /// Annotation (KEY=VALUE), may be repeated
        #[arg(long = "annotation", value_parser = parse_key_value)]
        annotations: Vec<(String, String)>,
    },
    /// Remove a sandbox with no container
    Remove {
        /// Sandbox ID
        sandbox_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ContainerCommands {
    /// List all containers
    List,
    /// Show container details
    Show {
        /// Container ID
        container_id: String,
    },
    /// Create a container from an imported image
    Create {
        /// Sandbox ID
        sandbox_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: String,
        /// Label (KEY=VALUE), may be repeated
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,
    },
    /// Mark a container as running
    Start {
        /// Container ID
        container_id: String,
    },
    /// Mark a container as exited
    Stop {
        /// Container ID
        container_id: String,
    },
    /// Remove container metadata and its root volume
    Remove {
        /// Container ID
        container_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ImageCommands {
    /// Copy a local image file into the image pool
    Import {
        /// Image reference
        image: String,
        /// Local image file
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum VolumeCommands {
    /// List volumes
    List,
    /// Create an empty volume
    Create {
        name: String,
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: u64,
        #[arg(long, default_value = DEFAULT_CAPACITY_UNIT)]
        unit: String,
    },
    /// Create a qcow2 snapshot of an image file
    Snapshot {
        name: String,
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: u64,
        #[arg(long, default_value = DEFAULT_CAPACITY_UNIT)]
        unit: String,
        /// Absolute path of the backing image
        #[arg(long)]
        backing_store: PathBuf,
    },
    /// Remove a volume
    Remove { name: String },
    /// Copy a local image file into a new volume
    Pull {
        /// Local image file
        path: PathBuf,
        /// Volume name
        name: String,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Everything a command may need, opened on demand
struct Node {
    config: Config,
}

impl Node {
    fn store(&self) -> Result<Arc<MetaStore>> {
        let store = MetaStore::open_with(
            &self.config.store.path,
            MetaStoreOptions {
                clock: Arc::new(SystemClock),
                batch: self.config.store.batch.clone(),
            },
        )
        .with_context(|| {
            format!(
                "failed to open metadata store at {}",
                self.config.store.path.display()
            )
        })?;
        Ok(Arc::new(store))
    }

    /// Sandbox verbs need no hypervisor connection
    fn sandboxes(&self) -> Result<SandboxService> {
        Ok(SandboxService::new(self.store()?))
    }

    fn storage(&self) -> Arc<dyn StorageOperations> {
        Arc::new(VirshStorage::from_config(&self.config.storage))
    }

    fn storage_tool(&self, pool: &str) -> Result<StorageTool> {
        StorageTool::new(self.storage(), &self.config.storage.pools, pool)
            .with_context(|| format!("failed to open storage pool '{pool}'"))
    }

    fn runtime(&self) -> Result<RuntimeService> {
        Ok(RuntimeService::new(
            self.store()?,
            self.storage_tool(DEFAULT_POOL)?,
            Arc::new(SystemClock),
        ))
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists, CLI flags take precedence
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(db) = args.db {
        config.store.path = db;
    }
    if let Some(connect) = args.connect {
        config.storage.connect_uri = connect;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Using metadata store at {}", config.store.path.display());
    let node = Node { config };

    match args.command {
        Commands::Init => {
            let store = node.store()?;
            store.ensure_schema()?;
            store.ensure_sandbox_schema()?;
            info!("Metadata collections ready");
        }
        Commands::Sandbox { action } => run_sandbox(&node, action)?,
        Commands::Container { action } => run_container(&node, action)?,
        Commands::Image { action } => match action {
            ImageCommands::Import { image, path } => {
                let volume = node.runtime()?.import_image(&image, &path)?;
                println!("{volume}");
            }
        },
        Commands::Volume { pool, action } => run_volume(&node, &pool, action)?,
    }

    Ok(())
}

fn run_sandbox(node: &Node, action: SandboxCommands) -> Result<()> {
    match action {
        SandboxCommands::List => {
            let sandboxes = node.store()?.list_pod_sandboxes()?;
            println!("{:<38} {:<24} {:<16} CONTAINER", "ID", "NAME", "NAMESPACE");
            for sandbox in sandboxes {
                println!(
                    "{:<38} {:<24} {:<16} {}",
                    sandbox.id, sandbox.name, sandbox.namespace, sandbox.container_id
                );
            }
        }
        SandboxCommands::Show { sandbox_id } => match node.store()?.get_pod_sandbox(&sandbox_id)? {
            Some(sandbox) => print_json(&sandbox)?,
            None => bail!("sandbox '{sandbox_id}' doesn't exist"),
        },
        SandboxCommands::Create {
            name,
            namespace,
            uid,
            annotations,
        } => {
            let config = PodSandboxConfig {
                name,
                uid,
                namespace,
                annotations: annotations.into_iter().collect::<HashMap<_, _>>(),
                ..Default::default()
            };
            let sandbox_id = node.sandboxes()?.run_pod_sandbox(&config)?;
            println!("{sandbox_id}");
        }
        SandboxCommands::Remove { sandbox_id } => {
            node.sandboxes()?.remove_pod_sandbox(&sandbox_id)?;
            println!("Removed sandbox {sandbox_id}");
        }
    }
    Ok(())
}

fn run_container(node: &Node, action: ContainerCommands) -> Result<()> {
    match action {
        ContainerCommands::List => {
            let containers = node.store()?.list_containers()?;
            println!(
                "{:<38} {:<24} {:<8} {:<38} IMAGE",
                "ID", "NAME", "STATE", "SANDBOX"
            );
            for container in containers {
                println!(
                    "{:<38} {:<24} {:<8} {:<38} {}",
                    container.id,
                    container.name,
                    container.state,
                    container.sandbox_id,
                    container.image
                );
            }
        }
        ContainerCommands::Show { container_id } => {
            match node.store()?.get_container_info(&container_id)? {
                Some(container) => print_json(&container)?,
                None => bail!("container '{container_id}' doesn't exist"),
            }
        }
        ContainerCommands::Create {
            sandbox_id,
            name,
            image,
            labels,
        } => {
            let config = ContainerConfig {
                name,
                image,
                labels: labels.into_iter().collect(),
                ..Default::default()
            };
            let container_id = node.runtime()?.create_container(&sandbox_id, &config)?;
            println!("{container_id}");
        }
        ContainerCommands::Start { container_id } => {
            node.runtime()?.start_container(&container_id)?;
        }
        ContainerCommands::Stop { container_id } => {
            node.runtime()?.stop_container(&container_id)?;
        }
        ContainerCommands::Remove { container_id } => {
            node.runtime()?.remove_container(&container_id)?;
            println!("Removed container {container_id}");
        }
    }
    Ok(())
}

fn run_volume(node: &Node, pool: &str, action: VolumeCommands) -> Result<()> {
    let tool = node.storage_tool(pool)?;
    match action {
        VolumeCommands::List => {
            println!("{:<48} SIZE", "NAME");
            for volume in tool.list_volumes()? {
                println!("{:<48} {}", volume.name, volume.size);
            }
        }
        VolumeCommands::Create {
            name,
            capacity,
            unit,
        } => {
            let volume = tool.create_volume(&name, capacity, &unit)?;
            println!("{}", volume.path()?.display());
        }
        VolumeCommands::Snapshot {
            name,
            capacity,
            unit,
            backing_store,
        } => {
            let volume = tool.create_snapshot(&name, capacity, &unit, &backing_store)?;
            println!("{}", volume.path()?.display());
        }
        VolumeCommands::Remove { name } => {
            tool.remove_volume(&name)?;
            println!("Removed volume {name}");
        }
        VolumeCommands::Pull { path, name } => {
            tool.pull_image_to_volume(&path, &name)?;
            println!("Pulled {} into {name}", path.display());
        }
    }
    Ok(())
}
