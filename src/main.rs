mod cli;

use std::process::ExitCode;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tvcine::config::{self, Config};
use tvcine::error::{Error, Result};
use tvcine::import::{self, ImportOptions, ImportOutcome};
use tvcine::metadata::{MediaType, MetadataCache, MetadataProvider, TmdbClient};
use tvcine::storage::RecordStore;
use tvcine::tracking::{SeriesCategory, Tracker};

use crate::cli::{CliArgs, Command};

/// Exit code for an archive without any known export file
const EXIT_MISSING_FILES: u8 = 2;

fn setup_logging() -> Result<()> {
    let data_dir = config::data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    let file_appender = tracing_appender::rolling::daily(&data_dir, "tvcine.log");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tvcine=info")))
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .init();

    Ok(())
}

fn print_outcome(outcome: &ImportOutcome) {
    match outcome {
        ImportOutcome::Changed(summary) => {
            println!(
                "Imported {} movies, {} episodes, {} watchlist entries, {} series statuses",
                summary.movies, summary.episodes, summary.watchlist, summary.statuses
            );
            if summary.skipped_rows > 0 {
                println!("Skipped {} entries that could not be matched", summary.skipped_rows);
            }
        }
        ImportOutcome::Unchanged => println!("Nothing new to import"),
    }
}

async fn execute(
    command: Command,
    tracker: &mut Tracker,
    client: &TmdbClient,
    options: &ImportOptions,
) -> Result<()> {
    let mut report = |value: f32| debug!(progress = value, "Import progress");

    match command {
        Command::ImportCsv { file } => {
            let text = tokio::fs::read_to_string(&file).await?;
            let outcome = import::import_csv(tracker, client, &text, options, &mut report).await?;
            print_outcome(&outcome);
        }
        Command::ImportZip { file } => {
            let bytes = tokio::fs::read(&file).await?;
            let outcome =
                import::import_trakt_zip(tracker, client, &bytes, options, &mut report).await?;
            print_outcome(&outcome);
        }
        Command::ExportCsv { file } => {
            let bytes = import::export_csv(&tracker.snapshot())?;
            tokio::fs::write(&file, bytes).await?;
            println!("Wrote {}", file.display());
        }
        Command::Next { series_id } => {
            let Some(details) = client.details(series_id, MediaType::Tv).await else {
                println!("Series {series_id} not found");
                return Ok(());
            };
            let state = tracker.snapshot();
            let category =
                state.series_category(series_id, &details.seasons, details.status.as_deref());
            if category == SeriesCategory::Stopped {
                println!("{} is marked as stopped", details.display_title());
            }

            match tracker.refresh_next_episode_details(series_id, client).await {
                Some(next) => {
                    let name = next.name.as_deref().unwrap_or("TBA");
                    let air_date = next.air_date.as_deref().unwrap_or("unknown air date");
                    println!(
                        "{}: S{:02}E{:02} {} ({})",
                        details.display_title(),
                        next.season,
                        next.episode,
                        name,
                        air_date
                    );
                }
                None => match category {
                    SeriesCategory::Completed => {
                        println!("{}: completed", details.display_title())
                    }
                    _ => println!("{}: up to date", details.display_title()),
                },
            }
        }
        Command::Summary => {
            let state = tracker.snapshot();
            let series = state.tracked_series_ids();
            let stopped = series.iter().filter(|id| state.is_stopped(**id)).count();
            let buckets = state.watchlist_buckets();

            println!("Movies watched:     {}", state.tracked_movie_ids().len());
            println!("Series tracked:     {} ({} stopped)", series.len(), stopped);
            println!(
                "Watchlist:          {} movies, {} series in progress, {} not started",
                buckets.movies.len(),
                buckets.series_in_progress.len(),
                buckets.series_not_started.len()
            );
            println!("Favorites:          {}", state.favorites().len());
        }
    }

    Ok(())
}

async fn run(args: CliArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Loaded config");
    if config.metadata.api_key.is_empty() {
        warn!("No metadata API key configured, remote lookups will come back empty");
    }

    let store = RecordStore::open(&config.storage)?;
    let cache = MetadataCache::open(
        &store,
        config.metadata.cache_ttl(),
        config.storage.cache_flush_delay(),
    );
    let client = TmdbClient::new(&config.metadata, cache.clone());
    let mut tracker = Tracker::load(store);
    let options = ImportOptions::from(&config.import);

    let result = execute(args.command, &mut tracker, &client, &options).await;

    // Write out pending cache entries
    cache.flush().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse_args();

    if let Err(e) = setup_logging() {
        eprintln!("Warning: Could not set up logging: {}", e);
    }

    info!("Starting tvcine");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::MissingArchiveFiles) => {
            eprintln!(
                "The archive does not contain any Trakt export files \
                 (movies.csv, episodes.csv, watched/history-*.json, lists/watchlist.json, hidden/*.json)"
            );
            ExitCode::from(EXIT_MISSING_FILES)
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
