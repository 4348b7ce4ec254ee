//! Line-driven interactive browsing session

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::{Listing, NavOutcome, NavigationEngine};
use crate::error::{BrowseError, BrowseResult};
use crate::model::{Entry, Folder, FolderStats};
use crate::ordering::SortMode;
use crate::refresh::{RefreshCoordinator, RefreshEvent};
use crate::source::{IndexClient, Transfers};
use crate::state::AppState;
use crate::transfer::TransferEvent;

const HELP: &str =
    "commands: <number> open, .. or b up, f folders, r refresh, s sort, u <file> upload here, ? help, q quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(usize),
    Up,
    Folders,
    Refresh,
    Sort,
    Upload(PathBuf),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        ".." | "b" | "back" => Some(Command::Up),
        "f" | "folders" => Some(Command::Folders),
        "r" | "refresh" => Some(Command::Refresh),
        "s" | "sort" => Some(Command::Sort),
        "u" | "upload" if !rest.is_empty() => Some(Command::Upload(PathBuf::from(
            shellexpand::tilde(rest).to_string(),
        ))),
        "?" | "h" | "help" => Some(Command::Help),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => word.parse().ok().map(Command::Open),
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn print_folders(folders: &[(Folder, FolderStats)]) {
    if folders.is_empty() {
        println!("No folders indexed yet. Run 'syncbrowse refresh' to update the index.");
        return;
    }
    println!(
        "{:>3}  {:<24} {:<16} {:>8} {:>12}  {:<20}",
        "#", "Label", "ID", "Files", "Size", "Last update"
    );
    println!("{}", "-".repeat(90));
    for (i, (folder, stats)) in folders.iter().enumerate() {
        let updated = stats
            .last_update
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>3}  {:<24} {:<16} {:>8} {:>12}  {:<20}",
            i + 1,
            folder.label,
            folder.id,
            stats.file_count,
            format_size(stats.size),
            updated
        );
    }
}

pub fn print_listing(listing: &Listing) {
    println!("{} ({}:/{})", listing.label, listing.folder, listing.path);
    for (i, entry) in listing.entries.iter().enumerate() {
        if entry.is_directory() {
            println!("{:>3}  {}/", i + 1, entry.name);
        } else {
            println!("{:>3}  {:<40} {:>12}", i + 1, entry.name, format_size(entry.size));
        }
    }
}

/// What the numbers typed by the user currently refer to.
enum Shown {
    Nothing,
    Folders(Vec<Folder>),
    Entries(Vec<Entry>),
}

pub struct Session<C: IndexClient, T: Transfers> {
    engine: NavigationEngine<C, T>,
    refresh: RefreshCoordinator<C>,
    refresh_events: mpsc::UnboundedReceiver<RefreshEvent>,
    transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
    state_path: Option<PathBuf>,
    sort: SortMode,
    shown: Shown,
}

impl<C: IndexClient, T: Transfers> Session<C, T> {
    pub fn new(
        engine: NavigationEngine<C, T>,
        refresh: RefreshCoordinator<C>,
        refresh_events: mpsc::UnboundedReceiver<RefreshEvent>,
        transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
        state_path: Option<PathBuf>,
    ) -> Self {
        Self {
            engine,
            refresh,
            refresh_events,
            transfer_events,
            state_path,
            sort: SortMode::default(),
            shown: Shown::Nothing,
        }
    }

    /// The order the engine's cache was configured with.
    pub fn with_sort(mut self, sort: SortMode) -> Self {
        self.sort = sort;
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{}", HELP);
        let outcome = self.engine.show_all_folders().await;
        self.render(outcome);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_command(&line) {
                        Some(Command::Quit) => break,
                        Some(command) => self.execute(command).await,
                        None if line.trim().is_empty() => {}
                        None => println!("{}", HELP),
                    }
                }
                Some(event) = self.refresh_events.recv() => self.on_refresh_event(event).await,
                Some(event) = self.transfer_events.recv() => self.on_transfer_event(event).await,
                Some(outcome) = self.engine.wait_pending(), if self.engine.is_loading() => {
                    self.render(outcome);
                }
            }
        }

        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        let outcome = match command {
            Command::Open(number) => match self.pick(number) {
                Some(Picked::Folder(id)) => self.engine.enter_folder(&id, None).await,
                Some(Picked::Entry(entry)) => self.engine.navigate(&entry).await,
                None => {
                    println!("no entry {}", number);
                    return;
                }
            },
            Command::Up if self.engine.is_browsing() => self.engine.go_up().await,
            Command::Up | Command::Folders => self.engine.show_all_folders().await,
            Command::Refresh => {
                if let Err(err) = self.refresh.trigger() {
                    report(&err);
                }
                return;
            }
            Command::Sort => {
                self.sort = self.sort.toggle();
                println!("sort: {}", self.sort.display_name());
                self.engine.set_comparator(self.sort.comparator()).await
            }
            Command::Upload(source) => self.engine.upload_here(source),
            Command::Help => {
                println!("{}", HELP);
                return;
            }
            Command::Quit => return,
        };
        self.render(outcome);
    }

    fn pick(&self, number: usize) -> Option<Picked> {
        let index = number.checked_sub(1)?;
        match &self.shown {
            Shown::Folders(folders) => folders.get(index).map(|f| Picked::Folder(f.id.clone())),
            Shown::Entries(entries) => entries.get(index).cloned().map(Picked::Entry),
            Shown::Nothing => None,
        }
    }

    async fn on_refresh_event(&mut self, event: RefreshEvent) {
        println!("{}", event.describe());
        let RefreshEvent::Completed(completion) = event else {
            return;
        };
        if let Some(path) = &self.state_path {
            let state = AppState {
                last_refresh: Some(completion.finished_at),
            };
            if let Err(err) = state.save(path) {
                warn!(error = %format!("{:#}", err), "could not save application state");
            }
        }
        let outcome = self.engine.refresh_completed().await;
        self.render(outcome);
    }

    async fn on_transfer_event(&mut self, event: TransferEvent) {
        println!("{}", event.describe());
        match self.engine.transfer_completed(&event).await {
            Ok(Some(outcome)) => self.render(Ok(outcome)),
            Ok(None) => {}
            Err(err) => report(&err),
        }
    }

    fn render(&mut self, outcome: BrowseResult<NavOutcome>) {
        match outcome {
            Ok(NavOutcome::Folders(folders)) => {
                print_folders(&folders);
                self.shown = Shown::Folders(folders.into_iter().map(|(f, _)| f).collect());
            }
            Ok(NavOutcome::Listing(listing)) => {
                print_listing(&listing);
                self.shown = Shown::Entries(listing.entries);
            }
            Ok(NavOutcome::Loading { label }) => println!("{} ...", label),
            Ok(NavOutcome::Queued { label }) => println!("queued: {}", label),
            Ok(NavOutcome::Transfer { name }) => {
                println!("transfer of {} started at {}", name, Utc::now().format("%H:%M:%S"))
            }
            Err(err) => report(&err),
        }
    }
}

enum Picked {
    Folder(String),
    Entry(Entry),
}

fn report(err: &BrowseError) {
    if err.is_informational() {
        println!("{}", err);
    } else {
        eprintln!("error: {}", err);
    }
}
