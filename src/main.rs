use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podsync::{
    Collection, CollectionStore, CoordinatorError, CoordinatorOptions, DownloadCoordinator,
    DownloadId, DownloadKind, FileStorage, HttpTransport, Observer, ReqwestClient,
    RssFeedParser, SyncEvent,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static HOURGLASS: Emoji<'_, '_> = Emoji("⏳ ", "[-] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Subscribe to podcast feeds and keep them in sync
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Subscribe to podcast feeds and keep them in sync")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the collection and downloaded files
    #[arg(long, global = true, default_value = ".podsync")]
    data_dir: PathBuf,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to one or more podcast feeds
    Add {
        /// RSS feed URLs
        #[arg(required = true)]
        feeds: Vec<String>,
    },

    /// Re-download the feeds of all subscriptions
    Update {
        /// Update even if the last update was only moments ago
        #[arg(short, long)]
        force: bool,
    },

    /// Show the podcasts in the collection
    List,
}

/// Observer drawing coordinator events with indicatif
struct IndicatifObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<DownloadId, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifObserver {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<DownloadId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_bar(&self, id: DownloadId, kind: DownloadKind, url: &str) {
        // Transports report bytes only, so there is no total to fill up to
        let style = ProgressStyle::default_spinner()
            .template(&format!("  {DOWNLOAD}{{spinner:.cyan}} {{bytes:>10}} {{wide_msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style);
        bar.set_message(format!("{} {}", kind.to_string().dimmed(), truncate(url, 60)));
        self.bars().insert(id, bar);
    }

    fn take_bar(&self, id: DownloadId) -> Option<ProgressBar> {
        self.bars().remove(&id)
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
        for (_, bar) in self.bars().drain() {
            bar.finish_and_clear();
        }
    }
}

impl Observer for IndicatifObserver {
    fn notify(&self, event: SyncEvent) {
        match event {
            SyncEvent::DownloadRequested { id, kind, url } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Requested {}", url.cyan()));
                self.create_bar(id, kind, &url);
            }

            SyncEvent::DownloadRejected { url, error } => {
                self.main_bar.println(format!(
                    "{FAILURE}{} - {}",
                    truncate(&url, 50).red(),
                    error.red()
                ));
            }

            SyncEvent::ProgressUpdate { id, bytes_so_far } => {
                if let Some(bar) = self.bars().get(&id) {
                    bar.set_position(bytes_so_far);
                }
            }

            SyncEvent::DownloadComplete { id } => {
                if let Some(bar) = self.take_bar(id) {
                    bar.finish_and_clear();
                }
            }

            SyncEvent::DownloadFailed { id, url, error } => {
                if let Some(bar) = self.take_bar(id) {
                    bar.abandon_with_message(format!(
                        "{FAILURE}{} - {}",
                        truncate(&url, 40).red(),
                        error.red()
                    ));
                }
            }

            SyncEvent::FeedFailed { url, error } => {
                self.main_bar.println(format!(
                    "{FAILURE}{} {} - {}",
                    "Not a usable feed:".red().bold(),
                    truncate(&url, 50).yellow(),
                    error.dimmed()
                ));
            }

            SyncEvent::CollectionChanged { collection } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}Collection now holds {} podcasts",
                    collection.len().to_string().cyan()
                ));
            }
        }
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn format_duration(seconds: u64) -> String {
    let (hours, minutes, seconds) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_collection(collection: &Collection) {
    if collection.is_empty() {
        println!("{}", "No podcasts in the collection yet.".dimmed());
        return;
    }

    for podcast in &collection.podcasts {
        println!(
            "{HEADPHONES}{} {}",
            podcast.title.bold().green(),
            format!("({} episodes)", podcast.episodes.len()).dimmed()
        );
        println!("   {}", podcast.feed_location.cyan());

        for episode in podcast.episodes.iter().take(3) {
            let date = episode
                .publish_date
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "----------".to_string());
            let duration = episode
                .duration_seconds
                .map(format_duration)
                .unwrap_or_default();
            println!(
                "   {} {} {}",
                date.dimmed(),
                truncate(&episode.title, 60),
                duration.yellow()
            );
        }
    }

    if let Some(last_update) = collection.last_update {
        println!(
            "\n{}",
            format!("Last update: {}", last_update.format("%Y-%m-%d %H:%M UTC")).dimmed()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let storage = Arc::new(FileStorage::new(&args.data_dir));
    let store = Arc::new(CollectionStore::new(storage));
    let coordinator = DownloadCoordinator::load(
        store.clone(),
        Arc::new(RssFeedParser),
        CoordinatorOptions::default(),
    )
    .await
    .with_context(|| format!("Failed to load collection from {}", store.location().display()))?;

    if let Command::List = args.command {
        print_collection(&coordinator.collection());
        return Ok(());
    }

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podsync".bold().magenta(),
            "- Podcast Collection Sync".dimmed()
        );
    }

    let (transport, events) =
        HttpTransport::new(ReqwestClient::new(), args.data_dir.join("downloads"));
    coordinator.bind_transport(Arc::new(transport));
    tokio::spawn(coordinator.clone().run(events));

    let observer = (!args.quiet).then(|| Arc::new(IndicatifObserver::new()));
    if let Some(observer) = &observer {
        coordinator.register_observer(observer.clone());
    }

    let mut wanted = Vec::new();
    match args.command {
        Command::Add { feeds } => {
            for feed in feeds {
                match coordinator.add_podcast(&feed) {
                    Ok(_) => wanted.push(feed),
                    Err(CoordinatorError::DuplicateSubscription(url)) => {
                        println!("{CROSS}{} is already subscribed", url.yellow());
                    }
                    Err(e) => {
                        println!("{CROSS}{} - {}", feed.yellow(), e.to_string().dimmed());
                    }
                }
            }
        }

        Command::Update { force } => match coordinator.update_collection(force) {
            Ok(ids) => {
                if ids.is_empty() && !args.quiet {
                    println!("{}", "Nothing to update.".dimmed());
                }
            }
            Err(CoordinatorError::UpdateThrottled { remaining }) => {
                println!(
                    "{HOURGLASS}Collection was updated recently, try again in {} or use {}",
                    format_duration(remaining.as_secs()).cyan(),
                    "--force".bold()
                );
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to update collection"),
        },

        Command::List => {}
    }

    coordinator.settled().await;
    if let Some(observer) = &observer {
        observer.finish();
    }

    coordinator
        .flush()
        .await
        .context("Failed to save collection")?;

    let collection = coordinator.collection();
    let missing: Vec<&String> = wanted
        .iter()
        .filter(|feed| !collection.contains(feed))
        .collect();

    if !args.quiet {
        for podcast in collection
            .podcasts
            .iter()
            .filter(|podcast| wanted.contains(&podcast.feed_location))
        {
            println!(
                "{SUCCESS}{} {}",
                podcast.title.bold().green(),
                format!("({} episodes)", podcast.episodes.len()).dimmed()
            );
        }
        println!(
            "\n{FOLDER}Collection: {}\n",
            store.location().display().to_string().cyan()
        );
    }

    if !missing.is_empty() {
        println!("{}", "Could not subscribe to:".red().bold());
        for feed in missing {
            println!("  {CROSS}{}", feed.yellow());
        }
        std::process::exit(1);
    }

    Ok(())
}
