// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use podhost::{
    ArtifactStore, CommandFetcher, EpisodeEdit, EpisodeId, FeedPublisher, FileRepository,
    FsArtifactStore, HttpFetcher, IngestionRequest, Ingestor, JobHandle, JobId, JobQueue,
    JobState, JobStatus, MediaFetcher, NewPodcast, NoopReporter, PipelineOptions, PodcastId,
    PodcastService, ProgressEvent, ProgressReporter, ReqwestClient, SharedProgressReporter,
    WorkerPool,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static INBOX: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[~] ");
static FEED: Emoji<'_, '_> = Emoji("📡 ", "[*] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");

/// Config file looked up in the data directory when --config is not given
const CONFIG_FILE_NAME: &str = "podhost.json";

/// Ingest podcast episodes and publish their RSS feeds
#[derive(Parser, Debug)]
#[command(name = "podhost")]
#[command(about = "Ingest podcast episodes and publish their RSS feeds")]
#[command(version)]
struct Cli {
    /// Directory holding records, stored audio and feeds
    #[arg(short, long, default_value = "podhost-data")]
    data_dir: PathBuf,

    /// JSON config file (defaults to <data-dir>/podhost.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How media is fetched
    #[arg(long, value_enum, default_value_t = FetcherKind::Command)]
    fetcher: FetcherKind,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Log pipeline activity (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FetcherKind {
    /// yt-dlp followed by ffmpeg
    Command,
    /// Direct download of audio files
    Http,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a podcast
    PodcastCreate {
        name: String,
        #[arg(long, default_value = "admin")]
        owner: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        link: Option<Url>,
        #[arg(long)]
        image: Option<Url>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        explicit: bool,
    },

    /// List podcasts
    Podcasts,

    /// Submit an episode and process the queue until it is drained
    Ingest {
        podcast: PodcastId,
        /// Source media URL
        source: String,
        #[arg(short, long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        image: Option<String>,
        /// Only queue the job
        #[arg(long)]
        no_wait: bool,
    },

    /// Run workers until interrupted
    Work,

    /// Show the status of a job
    Status {
        job: JobId,
        #[arg(long)]
        json: bool,
    },

    /// Start a new job for the episode of a failed job
    Retry {
        job: JobId,
        #[arg(long)]
        no_wait: bool,
    },

    /// Cancel a job
    Cancel { job: JobId },

    /// Edit episode metadata
    Edit {
        episode: EpisodeId,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        image: Option<Url>,
    },

    /// Delete (archive) an episode
    Delete { episode: EpisodeId },

    /// Print the feed of a podcast
    Feed { podcast: PodcastId },

    /// Re-render every feed
    Regenerate,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<JobId, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, job_id: JobId) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(bar) = bars.get(&job_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {INBOX}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(job_id, bar.clone());
        bar
    }

    fn finish_bar(&self, job_id: JobId) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.remove(&job_id);
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::JobEnqueued { job_id, .. } => {
                self.main_bar
                    .set_message(format!("Queued job {}", short_id(job_id).cyan()));
            }

            ProgressEvent::JobCoalesced { job_id, .. } => {
                self.main_bar.set_message(format!(
                    "Episode already has job {} in progress",
                    short_id(job_id).yellow()
                ));
            }

            ProgressEvent::JobClaimed {
                worker,
                job_id,
                attempt,
                reclaimed,
            } => {
                let bar = self.get_or_create_bar(job_id);
                bar.set_position(0);
                bar.set_message(format!(
                    "{} attempt {} on {}{}",
                    short_id(job_id).cyan(),
                    attempt.to_string().cyan(),
                    worker.dimmed(),
                    if reclaimed { " (reclaimed)" } else { "" }
                ));
            }

            ProgressEvent::JobStateChanged { job_id, state } => {
                if let Some(bar) = self.existing_bar(job_id) {
                    bar.set_message(format!("{} {}", short_id(job_id).cyan(), state));
                }
            }

            ProgressEvent::FetchProgress {
                job_id,
                bytes_downloaded,
                total_bytes,
            } => {
                let bar = self.get_or_create_bar(job_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::RetryScheduled {
                job_id,
                attempt,
                delay,
                error,
            } => {
                let bar = self.get_or_create_bar(job_id);
                bar.set_message(format!(
                    "{RETRY}{} attempt {} failed, retrying in {:?}: {}",
                    short_id(job_id).yellow(),
                    attempt,
                    delay,
                    error.dimmed()
                ));
            }

            ProgressEvent::JobAttached {
                job_id, audio_url, ..
            } => {
                let bar = self.get_or_create_bar(job_id);
                bar.finish_with_message(format!(
                    "{SUCCESS}{} {}",
                    short_id(job_id).green(),
                    audio_url.as_str().dimmed()
                ));
                self.finish_bar(job_id);
            }

            ProgressEvent::JobFailed { job_id, error } => {
                let bar = self.get_or_create_bar(job_id);
                bar.abandon_with_message(format!(
                    "{FAILURE}{} - {}",
                    short_id(job_id).red(),
                    error.red()
                ));
                self.finish_bar(job_id);
            }

            ProgressEvent::FeedPublished {
                version,
                episode_count,
                ..
            } => {
                self.main_bar.set_message(format!(
                    "{FEED}Feed version {} published with {} episodes",
                    version.to_string().cyan(),
                    episode_count.to_string().cyan()
                ));
            }

            ProgressEvent::PartialFilesCleanedUp { count } => {
                self.main_bar.set_message(format!(
                    "{BROOM}Removed {} interrupted writes",
                    count.to_string().yellow()
                ));
            }
        }
    }
}

impl IndicatifReporter {
    fn existing_bar(&self, job_id: JobId) -> Option<ProgressBar> {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.get(&job_id).cloned()
    }
}

fn short_id(job_id: JobId) -> String {
    job_id.to_string()[..8].to_string()
}

/// Everything wired over one data directory
struct App {
    service: PodcastService,
    pool: WorkerPool,
}

fn load_options(cli: &Cli) -> Result<PipelineOptions> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let default = cli.data_dir.join(CONFIG_FILE_NAME);
            if !default.exists() {
                return Ok(PipelineOptions::default());
            }
            default
        }
    };

    PipelineOptions::from_json_file(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn open_store(data_dir: &Path, options: &PipelineOptions) -> Result<FsArtifactStore> {
    let root = options
        .store
        .root
        .clone()
        .unwrap_or_else(|| data_dir.join("objects"));

    let store = match &options.store.public_base_url {
        Some(base_url) => FsArtifactStore::open(&root, base_url.clone(), options.store.quota_bytes),
        None => FsArtifactStore::open_local(&root, options.store.quota_bytes),
    };
    store.with_context(|| format!("Failed to open artifact store at {}", root.display()))
}

fn build_app(cli: &Cli, options: &PipelineOptions, reporter: SharedProgressReporter) -> Result<App> {
    let repo = FileRepository::open(&cli.data_dir.join("data"))
        .with_context(|| format!("Failed to open data directory {}", cli.data_dir.display()))?;
    if repo.partial_files_cleaned() > 0 {
        reporter.report(ProgressEvent::PartialFilesCleanedUp {
            count: repo.partial_files_cleaned(),
        });
    }
    let repo = Arc::new(repo);

    let store: Arc<dyn ArtifactStore> = Arc::new(open_store(&cli.data_dir, options)?);
    let fetcher: Arc<dyn MediaFetcher> = match cli.fetcher {
        FetcherKind::Command => Arc::new(CommandFetcher::new(options.fetcher.clone())),
        FetcherKind::Http => Arc::new(HttpFetcher::new(ReqwestClient::new())),
    };

    let publisher = Arc::new(
        FeedPublisher::new(repo.clone(), options.feed.clone(), reporter.clone())
            .with_feeds_dir(cli.data_dir.join("feeds")),
    );
    let queue = Arc::new(JobQueue::new(repo.clone(), reporter.clone()));
    let ingestor = Arc::new(Ingestor::new(
        repo.clone(),
        fetcher,
        store,
        publisher.clone(),
        reporter,
        options,
    ));

    Ok(App {
        service: PodcastService::new(repo, queue.clone(), publisher),
        pool: WorkerPool::new(queue, ingestor, options.workers, options.poll_interval()),
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "podhost=info" } else { "podhost=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_status(status: &JobStatus) {
    let state = match status.state {
        JobState::Attached => status.state.to_string().green().bold(),
        JobState::Failed => status.state.to_string().red().bold(),
        _ => status.state.to_string().yellow(),
    };

    println!("{} {}", "Job:".bold(), status.job_id);
    println!("{} {}", "Episode:".bold(), status.episode_id);
    println!("{} {}", "State:".bold(), state);
    println!(
        "{} {} ({} retries)",
        "Attempts:".bold(),
        status.attempts,
        status.retries
    );
    if let Some(error) = &status.last_error {
        println!("{} {}", "Last error:".bold(), error.to_string().red());
    }
    if let Some(at) = status.next_retry_at {
        println!("{} {}", "Next retry:".bold(), at.to_rfc3339());
    }
    if let Some(at) = status.finished_at {
        println!("{} {}", "Finished:".bold(), at.to_rfc3339());
    }
}

/// Drain the queue, then report how the job ended
async fn wait_for(app: &App, handle: &JobHandle) -> Result<JobStatus> {
    app.pool
        .run_until_idle()
        .await
        .context("Failed to process the queue")?;
    Ok(app.service.status(handle).await?)
}

async fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\n{}", "Shutting down, waiting for running jobs...".yellow());
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = load_options(&cli)?;

    let indicatif = (!cli.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &indicatif {
        Some(reporter) => reporter.clone() as SharedProgressReporter,
        None => NoopReporter::shared(),
    };

    let app = build_app(&cli, &options, reporter)?;

    if !cli.quiet && matches!(cli.command, Command::Ingest { .. } | Command::Work) {
        eprintln!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podhost".bold().magenta(),
            "- Podcast Ingestion".dimmed()
        );
    }

    let status = match cli.command {
        Command::PodcastCreate {
            name,
            owner,
            description,
            author,
            link,
            image,
            language,
            explicit,
        } => {
            let podcast = app
                .service
                .create_podcast(NewPodcast {
                    name,
                    description,
                    image_url: image,
                    link,
                    author,
                    language,
                    explicit,
                    owner,
                })
                .await
                .context("Failed to create podcast")?;
            println!("{} {}", "Podcast:".bold(), podcast.id.to_string().cyan());
            println!("{} {}", "Feed id:".bold(), podcast.publish_id);
            None
        }

        Command::Podcasts => {
            for podcast in app.service.podcasts().await? {
                let episodes = app.service.episodes(podcast.id).await?;
                let published = episodes.iter().filter(|e| e.is_listable()).count();
                println!(
                    "{}  {}  {} ({} published, {} total)",
                    podcast.id.to_string().cyan(),
                    podcast.publish_id.dimmed(),
                    podcast.name.bold(),
                    published.to_string().green(),
                    episodes.len()
                );
            }
            None
        }

        Command::Ingest {
            podcast,
            source,
            title,
            description,
            author,
            image,
            no_wait,
        } => {
            let handle = app
                .service
                .submit(IngestionRequest {
                    podcast_id: podcast,
                    title,
                    description,
                    author,
                    image_url: image,
                    source,
                })
                .await
                .context("Failed to submit episode")?;
            println!("{} {}", "Job:".bold(), handle.job_id.to_string().cyan());
            println!("{} {}", "Episode:".bold(), handle.episode_id);

            if no_wait {
                None
            } else {
                Some(wait_for(&app, &handle).await?)
            }
        }

        Command::Work => {
            let shutdown = CancellationToken::new();
            tokio::spawn(shutdown_on_ctrl_c(shutdown.clone()));
            app.pool.run(shutdown).await;
            None
        }

        Command::Status { job, json } => {
            let handle = app.service.handle(job).await?;
            let status = app.service.status(&handle).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            None
        }

        Command::Retry { job, no_wait } => {
            let handle = app.service.handle(job).await?;
            let retried = app.service.retry(&handle).await?;
            println!("{} {}", "New job:".bold(), retried.job_id.to_string().cyan());

            if no_wait {
                None
            } else {
                Some(wait_for(&app, &retried).await?)
            }
        }

        Command::Cancel { job } => {
            let handle = app.service.handle(job).await?;
            let status = app.service.cancel(&handle).await?;
            print_status(&status);
            None
        }

        Command::Edit {
            episode,
            title,
            description,
            author,
            image,
        } => {
            let edit = EpisodeEdit {
                title,
                description,
                author,
                image_url: image,
            };
            if edit.is_empty() {
                bail!("Nothing to edit; pass at least one of --title, --description, --author, --image");
            }
            let episode = app.service.edit_episode(episode, edit).await?;
            println!("{}{}", SUCCESS, episode.title.green());
            None
        }

        Command::Delete { episode } => {
            let archived = app.service.delete_episode(episode).await?;
            println!(
                "{}Archived {} (was {})",
                SUCCESS,
                archived.episode.title.bold(),
                archived.previous_state
            );
            if let Some(job) = archived.cancelled_job {
                println!("{} {}", "Cancelled job:".bold(), job);
            }
            None
        }

        Command::Feed { podcast } => {
            let feed = app.service.feed(podcast).await?;
            println!("{}", feed.xml);
            None
        }

        Command::Regenerate => {
            for feed in app.service.regenerate_feeds().await? {
                println!(
                    "{FEED}{} version {} ({} episodes)",
                    feed.publish_id.cyan(),
                    feed.version,
                    feed.episode_count
                );
            }
            None
        }
    };

    if let Some(reporter) = &indicatif {
        reporter.finish();
    }

    if let Some(status) = status {
        if !cli.quiet {
            println!();
            print_status(&status);
        }
        if status.state == JobState::Failed {
            std::process::exit(1);
        }
    }

    Ok(())
}
