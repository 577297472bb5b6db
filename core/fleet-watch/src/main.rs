//! fleet-watch: inspect fleet sync state against a store fixture.
//!
//! ## Subcommands
//!
//! - `summary`: run the fleet aggregator until every binding settled and
//!   print the snapshot
//! - `watch`: print every update and error of one live binding as JSON lines
//! - `normalize`: normalize a single raw value

mod fixture;
mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use fixture::Fixture;
use fleet_sync::{
    load_config, normalize, now_millis, BindingOptions, Callbacks, CollectionNormalizer,
    EntityKind, FleetAggregator, FleetMode, FleetSyncError, LiveBinding, Normalizer,
    RecordNormalizer, Store, StorePath, SyncConfig, Update,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fleet-watch")]
#[command(about = "Fleet sync inspector")]
#[command(version)]
struct Cli {
    /// Config file (defaults to FLEET_SYNC_CONFIG, then ~/.fleet-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Presence,
    Detail,
}

impl From<ModeArg> for FleetMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Presence => FleetMode::PresenceOnly,
            ModeArg::Detail => FleetMode::Detail,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fleet summary for a fixture
    Summary {
        #[arg(long)]
        fixture: PathBuf,

        #[arg(long, value_enum, default_value = "presence")]
        mode: ModeArg,

        /// Classify presence as of this instant (epoch millis)
        #[arg(long)]
        now_ms: Option<i64>,

        /// Give up waiting for bindings after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Stream one binding's updates as JSON lines
    Watch {
        #[arg(long)]
        fixture: PathBuf,

        /// Store path, e.g. device/abc/messages
        #[arg(long)]
        path: String,

        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// Treat the path as one record even for collection kinds
        #[arg(long)]
        single: bool,

        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Normalize one raw value
    Normalize {
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// Store key the value was found under
        #[arg(long, default_value = "")]
        key: String,

        /// Raw value as JSON
        #[arg(value_name = "VALUE_JSON")]
        value: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Sync(#[from] FleetSyncError),

    #[error("Invalid fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid JSON value: {0}")]
    Value(#[source] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Output(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn parse_kind(value: &str) -> Result<EntityKind, String> {
    value.parse()
}

/// Set by `--now-ms`; unset means the wall clock.
static NOW_OVERRIDE: OnceLock<i64> = OnceLock::new();

fn cli_clock() -> i64 {
    NOW_OVERRIDE.get().copied().unwrap_or_else(now_millis)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|err| CliError::Output(err.to_string()))?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", rendered).map_err(|err| CliError::Output(err.to_string()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fleet-watch failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Normalize { kind, key, value } => {
            let raw: serde_json::Value = serde_json::from_str(&value).map_err(CliError::Value)?;
            print_json(&normalize(kind, &key, &raw, cli_clock()), true)
        }
        Commands::Summary {
            fixture,
            mode,
            now_ms,
            timeout_secs,
        } => {
            if let Some(now_ms) = now_ms {
                let _ = NOW_OVERRIDE.set(now_ms);
            }
            let fixture = Fixture::load(&fixture)?;
            let timeout = Duration::from_secs(timeout_secs);
            runtime()?.block_on(summary(fixture, &config, mode.into(), timeout))
        }
        Commands::Watch {
            fixture,
            path,
            kind,
            single,
            seconds,
        } => {
            let fixture = Fixture::load(&fixture)?;
            let path = StorePath::parse(&path).map_err(FleetSyncError::from)?;
            let (store, _directory) = fixture.into_parts();
            let mut options = config.binding_options();
            options.clock = cli_clock;
            let watch = Watch {
                store: Arc::new(store),
                path,
                options,
                duration: Duration::from_secs(seconds),
            };

            runtime()?.block_on(async move {
                if single || !is_collection(kind) {
                    watch.run(RecordNormalizer::new(kind)).await
                } else {
                    watch
                        .run(CollectionNormalizer::with_limit(kind, config.fleet.message_limit))
                        .await
                }
            })
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

/// Kinds whose store section is a keyed collection of entities.
fn is_collection(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Message | EntityKind::Notification | EntityKind::Contact
    )
}

async fn summary(
    fixture: Fixture,
    config: &SyncConfig,
    mode: FleetMode,
    timeout: Duration,
) -> Result<(), CliError> {
    let (store, directory) = fixture.into_parts();
    let mut aggregator =
        FleetAggregator::start_with_clock(Arc::new(store), &directory, config, mode, cli_clock)
            .await?;

    let snapshot = match tokio::time::timeout(timeout, aggregator.settled()).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            let snapshot = aggregator.snapshot();
            warn!(
                pending = snapshot.pending,
                "Timed out waiting for bindings; printing partial snapshot"
            );
            snapshot
        }
    };
    aggregator.shutdown();
    print_json(&snapshot, true)
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WatchLine<'a, T> {
    Update { path: &'a str, update: Update<T> },
    Error { path: &'a str, message: String, retryable: bool },
}

struct Watch {
    store: Arc<dyn Store>,
    path: StorePath,
    options: BindingOptions,
    duration: Duration,
}

impl Watch {
    async fn run<N>(self, normalizer: N) -> Result<(), CliError>
    where
        N: Normalizer,
        N::Output: Serialize,
    {
        let update_path = self.path.to_string();
        let error_path = self.path.to_string();
        let callbacks = Callbacks::new()
            .on_update(move |update| {
                let line = WatchLine::Update {
                    path: &update_path,
                    update,
                };
                if let Err(err) = print_json(&line, false) {
                    warn!(error = %err, "Dropped update line");
                }
            })
            .on_error(move |sync_error| {
                let line: WatchLine<'_, N::Output> = WatchLine::Error {
                    path: &error_path,
                    message: sync_error.to_string(),
                    retryable: sync_error.is_retryable(),
                };
                if let Err(err) = print_json(&line, false) {
                    warn!(error = %err, "Dropped error line");
                }
            });

        info!(path = %self.path, seconds = self.duration.as_secs(), "Starting watch");
        let handle =
            LiveBinding::spawn(self.store, self.path, normalizer, self.options, callbacks);
        tokio::time::sleep(self.duration).await;
        info!(path = %handle.path(), state = %handle.state(), "Watch finished");
        handle.release();
        Ok(())
    }
}
