use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use rand::RngCore;
use tracing::{info, warn, Level};

use loralink_core::{checksum, generate_room_code, resolve, DownloadStatus, Event, EventKind, PeerId, RoomKind};
use loralink_grid::MemorySwarm;
use loralink_session::{P2pService, SessionConfig};
use loralink_storage::{
    AdapterStore, DirectoryAdapterStore, FileKvStore, KvStore, PersistenceStore,
};

mod config;

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "loralinkd")]
#[command(about = "LoraLink peer daemon - share LoRA adapters in rooms without a server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Peer id (defaults to hostname)
    #[arg(short, long, global = true)]
    peer_id: Option<String>,

    /// Data directory
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    General,
    Local,
    Private,
}

impl From<Kind> for RoomKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::General => RoomKind::General,
            Kind::Local => RoomKind::Local,
            Kind::Private => RoomKind::Private,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the topic a room resolves to
    Topic {
        #[arg(value_enum)]
        kind: Kind,
        /// Room code or local network name
        code: Option<String>,
    },
    /// Print a fresh private room code
    Code,
    /// Join a room and share every adapter in a directory
    Share {
        /// Room to join; restores the last room when omitted
        #[arg(long, value_enum)]
        kind: Option<Kind>,
        #[arg(long)]
        code: Option<String>,
        /// Adapter directory (defaults to <data-dir>/adapters)
        #[arg(long)]
        adapters: Option<PathBuf>,
    },
    /// Run two in-process peers through a share and download
    Demo {
        /// Adapter size in bytes
        #[arg(long, default_value = "300000")]
        size: usize,
    },
    /// Show persisted room history
    History,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = NodeConfig::new(cli.peer_id, cli.data_dir, cli.verbose);

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match cli.command {
        Commands::Topic { kind, code } => {
            let topic = resolve(kind.into(), code.as_deref().unwrap_or_default())?;
            println!("{topic}");
        }
        Commands::Code => {
            println!("{}", generate_room_code());
        }
        Commands::Share {
            kind,
            code,
            adapters,
        } => {
            let adapters = adapters.unwrap_or_else(|| config.adapters_dir());
            run_share(&config, kind.map(RoomKind::from), code, adapters).await?;
        }
        Commands::Demo { size } => {
            run_demo(&config, size).await?;
        }
        Commands::History => {
            print_history(&config).await;
        }
    }

    Ok(())
}

async fn run_share(
    config: &NodeConfig,
    kind: Option<RoomKind>,
    code: Option<String>,
    adapters_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("🔗 LoraLink peer {}", config.peer_id);
    info!("   Data: {}", config.data_dir.display());
    info!("   Adapters: {}", adapters_dir.display());

    let swarm = MemorySwarm::new();
    let (transport, events) = swarm.endpoint(config.peer_id.clone());
    let adapters = Arc::new(DirectoryAdapterStore::new(adapters_dir));
    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::new(config.state_dir()));
    let service = P2pService::new(
        Arc::new(transport),
        events,
        adapters.clone(),
        kv,
        SessionConfig::default(),
    )
    .await;

    match kind {
        Some(kind) => {
            service.connect(kind, code.as_deref()).await?;
        }
        None => {
            if !service.check_and_auto_reconnect().await {
                if service.should_offer_manual_reconnect().await {
                    service.reconnect_to_last_session().await?;
                } else {
                    info!("No previous room, joining the general room");
                    service.connect(RoomKind::General, None).await?;
                }
            }
        }
    }

    for name in adapters.list().await? {
        match service.share(&name).await {
            Ok(outcome) => info!("📦 Sharing {} as {}", name, &outcome.info.topic[..8]),
            Err(e) => warn!("Could not share {}: {}", name, e),
        }
    }

    let status = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            if let Some(room) = status.current_room() {
                info!(
                    "📊 Status: {} room {}, {} peers, {} shared",
                    room.kind,
                    room.short_topic(),
                    room.peers_count,
                    status.shared_adapters().len()
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down...");
    service.shutdown().await;
    info!("✅ Peer stopped");
    Ok(())
}

async fn run_demo(config: &NodeConfig, size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let root = config.data_dir.join("demo");
    let swarm = MemorySwarm::new();

    let mut weights = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut weights);
    let owner_store = Arc::new(DirectoryAdapterStore::new(root.join("owner/adapters")));
    owner_store.store("gemma-lora-v1", &weights).await?;

    let owner = demo_peer(&swarm, "owner", &root, owner_store).await;
    let fetcher_store = Arc::new(DirectoryAdapterStore::new(root.join("fetcher/adapters")));
    let fetcher = demo_peer(&swarm, "fetcher", &root, fetcher_store.clone()).await;

    let code = "PIZZA-123";
    let mut available = fetcher.events().channel(&[EventKind::AdaptersAvailable]);
    let mut downloads = fetcher.events().channel(&[EventKind::DownloadProgress]);

    owner.connect(RoomKind::Private, Some(code)).await?;
    let shared = owner.share("gemma-lora-v1").await?;
    info!("📦 Owner shares gemma-lora-v1 ({} bytes)", shared.info.size_bytes);

    fetcher.connect(RoomKind::Private, Some(code)).await?;
    let offered = loop {
        match tokio::time::timeout(Duration::from_secs(5), available.recv()).await? {
            Some(Event::AdaptersAvailable(list)) if !list.is_empty() => break list,
            Some(_) => continue,
            None => return Err("event bus closed".into()),
        }
    };
    info!("✨ Fetcher sees {} adapter(s)", offered.len());

    fetcher.request_download(&offered[0].info.topic, None).await?;
    loop {
        match tokio::time::timeout(Duration::from_secs(70), downloads.recv()).await? {
            Some(Event::DownloadProgress(p)) => {
                info!("⬇️  {} {:.0}%", p.adapter_name, p.progress);
                match p.status {
                    DownloadStatus::Downloading => continue,
                    DownloadStatus::Completed => break,
                    _ => return Err(p.error.unwrap_or_else(|| "download failed".into()).into()),
                }
            }
            Some(_) => continue,
            None => return Err("event bus closed".into()),
        }
    }

    let stored = fetcher_store
        .locate("gemma-lora-v1")
        .await?
        .ok_or("downloaded adapter missing from store")?;
    let verified = checksum(&stored.bytes) == shared.info.checksum;
    info!(
        "✅ Stored {} bytes, checksum {}",
        stored.size_bytes,
        if verified { "verified" } else { "MISMATCH" }
    );

    owner.shutdown().await;
    fetcher.shutdown().await;
    if verified {
        Ok(())
    } else {
        Err("checksum mismatch".into())
    }
}

async fn demo_peer(
    swarm: &MemorySwarm,
    name: &str,
    root: &std::path::Path,
    adapters: Arc<DirectoryAdapterStore>,
) -> P2pService {
    let (transport, events) = swarm.endpoint(PeerId::new(name));
    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::new(root.join(name).join("state")));
    P2pService::new(
        Arc::new(transport),
        events,
        adapters,
        kv,
        SessionConfig::default(),
    )
    .await
}

async fn print_history(config: &NodeConfig) {
    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::new(config.state_dir()));
    let state = PersistenceStore::new(kv).load().await;

    match &state.last_room {
        Some(room) => println!(
            "Last room: {} {}",
            room.kind,
            room.code.as_deref().unwrap_or("-")
        ),
        None => println!("Last room: none"),
    }
    println!("Shared: {}", state.shared_adapter_names.len());
    for entry in &state.room_history {
        println!(
            "  {:<8} {:<12} {}",
            entry.kind.as_str(),
            entry.code.as_deref().unwrap_or("-"),
            entry.timestamp
        );
    }
}
