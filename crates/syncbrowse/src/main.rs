use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use syncbrowse::browse::{self, Session};
use syncbrowse::db::IndexStore;
use syncbrowse::devices::PeerRegistry;
use syncbrowse::engine::{NavOutcome, NavigationEngine};
use syncbrowse::memory::MemoryIndex;
use syncbrowse::mirror::MirrorClient;
use syncbrowse::refresh::{RefreshCompletion, RefreshCoordinator, RefreshEvent};
use syncbrowse::settings::{Settings, SharedSettings};
use syncbrowse::source::IndexClient;
use syncbrowse::state::AppState;
use syncbrowse::transfer::TransferQueue;

#[derive(Parser)]
#[command(name = "syncbrowse")]
#[command(about = "Browse synchronized folders from a lazily cached index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to database file
    #[arg(short, long, default_value = "~/.config/syncbrowse/index.db")]
    db: String,

    /// Path to settings file
    #[arg(short = 'c', long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List synchronized folders
    Folders,
    /// List a directory of a folder
    Ls {
        /// Folder ID
        folder: String,
        /// Path inside the folder
        path: Option<String>,
    },
    /// Update the index from the configured folders
    Refresh,
    /// List known devices
    Devices,
    /// Add a peer device
    AddDevice {
        /// Device ID (8 groups of 7 characters)
        device_id: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Remove a peer device
    RemoveDevice {
        /// Device ID
        device_id: String,
    },
    /// Forget the local index
    Clear,
    /// Browse a simulated index (no filesystem or database access)
    Demo,
    /// Browse interactively
    Browse,
}

struct App {
    settings: Arc<SharedSettings>,
    settings_path: PathBuf,
    client: Arc<MirrorClient>,
}

impl App {
    fn state_path(&self) -> PathBuf {
        AppState::path_for(&self.settings_path)
    }

    fn coordinator(&self) -> (RefreshCoordinator<MirrorClient>, mpsc::UnboundedReceiver<RefreshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let last = AppState::load(self.state_path())
            .map(|state| state.last_refresh)
            .unwrap_or_default();
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&self.client), tx).with_last_completed(last);
        (coordinator, rx)
    }

    fn save_refresh(&self, completion: &RefreshCompletion) -> Result<()> {
        AppState {
            last_refresh: Some(completion.finished_at),
        }
        .save(self.state_path())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("syncbrowse=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Demo) = cli.command {
        return run_demo().await;
    }

    let settings_path = if let Some(config) = &cli.config {
        PathBuf::from(shellexpand::tilde(config).to_string())
    } else {
        Settings::default_path()
    };
    let settings = Settings::load(&settings_path).context("Failed to load settings")?;

    let db_path = shellexpand::tilde(&cli.db).to_string();
    let store = IndexStore::new(&db_path)
        .await
        .context("Failed to open database")?;

    let shared = Arc::new(SharedSettings::new(settings, settings_path.clone()));
    let app = App {
        client: Arc::new(MirrorClient::new(store, Arc::clone(&shared))),
        settings: shared,
        settings_path,
    };

    match cli.command.unwrap_or(Commands::Browse) {
        Commands::Folders => {
            let mut folders = app.client.folders().await?;
            folders.sort_by(|(a, _), (b, _)| a.label.cmp(&b.label));
            browse::print_folders(&folders);
        }
        Commands::Ls { folder, path } => {
            let settings = app.settings.snapshot();
            let (transfers, _) = TransferQueue::new(Arc::clone(&app.client));
            let mut engine =
                NavigationEngine::new(Arc::clone(&app.client), settings.cache_config(), transfers);
            let mut outcome = engine.enter_folder(&folder, path.as_deref()).await;
            if let Ok(NavOutcome::Loading { label }) = &outcome {
                println!("{} ...", label);
                if let Some(done) = engine.wait_pending().await {
                    outcome = done;
                }
            }
            match outcome? {
                NavOutcome::Listing(listing) => browse::print_listing(&listing),
                NavOutcome::Folders(folders) => browse::print_folders(&folders),
                _ => {}
            }
        }
        Commands::Refresh => {
            let (coordinator, mut events) = app.coordinator();
            coordinator.trigger()?;
            let cancel = app.client.cancel_flag();
            let completion = loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(RefreshEvent::Completed(completion)) => break completion,
                        Some(event) => println!("{}", event.describe()),
                        None => bail!("index update stopped without completing"),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("cancelling index update");
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            };
            app.save_refresh(&completion)?;
            completion.result?;
            println!("Index updated at {}", completion.finished_at.format("%Y-%m-%d %H:%M:%S"));
        }
        Commands::Devices => {
            let (coordinator, _) = app.coordinator();
            let registry =
                PeerRegistry::new(Arc::clone(&app.client), Arc::clone(&app.settings), coordinator);
            let devices = registry.device_list().await?;
            println!("{:<20} {:<16} {:<20}", "Name", "Status", "Device");
            println!("{}", "-".repeat(60));
            for device in devices {
                let short = device.device_id.split('-').next().unwrap_or_default();
                println!(
                    "{:<20} {:<16} {:<20}",
                    device.name,
                    device.status.display_name(),
                    short
                );
            }
        }
        Commands::AddDevice { device_id, name } => {
            let (coordinator, mut events) = app.coordinator();
            let registry =
                PeerRegistry::new(Arc::clone(&app.client), Arc::clone(&app.settings), coordinator);
            if registry.import_device(&device_id, name.as_deref()).await? {
                println!("Device added, updating index...");
                while let Some(event) = events.recv().await {
                    if let RefreshEvent::Completed(completion) = &event {
                        app.save_refresh(completion)?;
                        println!("{}", event.describe());
                        break;
                    }
                }
            } else {
                println!("Device already known");
            }
        }
        Commands::RemoveDevice { device_id } => {
            let (coordinator, _) = app.coordinator();
            let registry =
                PeerRegistry::new(Arc::clone(&app.client), Arc::clone(&app.settings), coordinator);
            if registry.remove_device(&device_id).await? {
                println!("Device removed");
            } else {
                println!("Device not found");
            }
        }
        Commands::Clear => {
            app.client.store().clear().await?;
            AppState::default().save(app.state_path())?;
            println!("Local index cleared");
        }
        Commands::Browse => {
            let settings = app.settings.snapshot();
            let (coordinator, refresh_events) = app.coordinator();
            let (transfers, transfer_events) = TransferQueue::new(Arc::clone(&app.client));
            let engine =
                NavigationEngine::new(Arc::clone(&app.client), settings.cache_config(), transfers);

            if settings.refresh.on_start && coordinator.is_due(settings.stale_after()) {
                info!("index is stale, updating");
                coordinator.trigger()?;
            }

            Session::new(
                engine,
                coordinator,
                refresh_events,
                transfer_events,
                Some(app.state_path()),
            )
            .with_sort(settings.browser.sort)
            .run()
            .await?;
        }
        Commands::Demo => unreachable!("handled before opening the database"),
    }

    Ok(())
}

async fn run_demo() -> Result<()> {
    println!("Browsing a simulated index (in-memory)...");
    let index = Arc::new(MemoryIndex::demo().with_latency(Duration::from_millis(400)));
    let (tx, refresh_events) = mpsc::unbounded_channel();
    let coordinator = RefreshCoordinator::new(Arc::clone(&index), tx);
    let (transfers, transfer_events) = TransferQueue::new(Arc::clone(&index));
    let engine = NavigationEngine::new(
        Arc::clone(&index),
        Settings::default().cache_config(),
        transfers,
    );

    Session::new(engine, coordinator, refresh_events, transfer_events, None)
        .run()
        .await
}
