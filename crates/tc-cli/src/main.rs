//! CLI entry point for the topology change listener.
//!
//! This binary drives a [`TopologyChangeListener`] outside of a running
//! cluster: it replays recorded change events, watches a filesystem mirror of
//! the repository, and prints the paths derived from a configuration.
//!
//! # Usage
//!
//! ```bash
//! tc-listen [OPTIONS] <COMMAND>
//!
//! # Replay recorded changes and summarize what would have triggered
//! tc-listen replay --events changes.jsonl
//!
//! # Watch a directory tree that mirrors the repository
//! tc-listen watch --root /srv/mirror
//!
//! # Show derived paths as JSON
//! tc-listen --config listener.json paths --format json
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{WrapErr, eyre};
use tc_core::{ChangeEvent, Config};
use tc_listener::{
    DispatchSnapshot, FsObservation, ObservationHub, ObservationService, RecordingTrigger,
    TopologyChangeListener,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Listens for repository changes that may alter the cluster topology.
///
/// Relevant changes are queued and handed to a re-evaluation entry point on a
/// background worker; heartbeat refreshes are ignored.
#[derive(Parser)]
#[command(name = "tc-listen", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file.
    ///
    /// Built-in defaults are used if not specified.
    #[arg(short, long, global = true, env = "TC_LISTEN_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Replay recorded change events through the listener.
    Replay {
        /// JSON Lines file, one change event per line.
        #[arg(short, long)]
        events: Utf8PathBuf,

        /// Output format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// How long to wait for the worker to drain the queue.
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },

    /// Watch a directory tree that mirrors the repository.
    Watch {
        /// Mirror root; the discovery path is resolved below it.
        #[arg(short, long)]
        root: Utf8PathBuf,

        /// Output format for the final summary.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the paths derived from the configuration.
    Paths {
        /// Output format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Output format.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON format.
    Json,
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// `notify` and `mio` are filtered to `warn` level.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn,notify=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(use_ansi),
        )
        .with(filter)
        .init();
}

/// Loads the configuration file, or the defaults if none was given.
fn load_config(path: Option<&Utf8Path>) -> color_eyre::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let config = Config::load(path).wrap_err_with(|| format!("Failed to load config {path}"))?;
    info!(path = %path, "Loaded configuration");
    Ok(config)
}

/// Parses change events from JSON Lines.
///
/// Blank lines and lines starting with `#` are skipped.
fn parse_events(content: &str) -> color_eyre::Result<Vec<ChangeEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str::<ChangeEvent>(line)
                .wrap_err_with(|| format!("Invalid change event on line {}", index + 1))
        })
        .collect()
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// What a run of the listener did.
#[derive(serde::Serialize)]
struct Summary {
    /// Changes delivered to the listener.
    received: u64,
    /// Re-evaluations that reached the entry point.
    triggers: u64,
    /// Dispatcher counters.
    dispatch: DispatchSnapshot,
}

/// Creates a listener wired to a [`RecordingTrigger`].
fn start_listener(
    config: Config,
    observation: Arc<dyn ObservationService>,
) -> color_eyre::Result<(TopologyChangeListener, Arc<RecordingTrigger>)> {
    let (trigger, weak) = RecordingTrigger::shared();
    let listener = TopologyChangeListener::new(config, observation, weak);
    listener
        .activate()
        .map_err(|e| eyre!("Failed to activate listener: {e}"))?;
    Ok((listener, trigger))
}

/// Replays a recorded event file through an in-memory observation hub.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the listener
/// cannot be activated.
async fn run_replay(
    config: Config,
    events: &Utf8Path,
    format: OutputFormat,
    timeout: Duration,
) -> color_eyre::Result<()> {
    let content = tokio::fs::read_to_string(events.as_std_path())
        .await
        .wrap_err_with(|| format!("Failed to read {events}"))?;
    let changes = parse_events(&content)?;
    info!(path = %events, changes = changes.len(), "Replaying change events");

    let hub = Arc::new(ObservationHub::new());
    let (listener, trigger) = start_listener(config, Arc::<ObservationHub>::clone(&hub))?;

    let mut received = 0_u64;
    for change in changes {
        if hub.publish_one(change) > 0 {
            received += 1;
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while !listener.stats().is_idle() {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                pending = listener.stats().pending(),
                "Timed out waiting for the dispatcher to drain"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    listener.deactivate();

    let summary = Summary {
        received,
        triggers: trigger.count(),
        dispatch: listener.stats(),
    };
    print_summary(&summary, format)
}

/// Watches a filesystem mirror until interrupted.
///
/// # Errors
///
/// Returns an error if the mirror cannot be watched.
async fn run_watch(
    config: Config,
    root: &Utf8Path,
    format: OutputFormat,
) -> color_eyre::Result<()> {
    let observation = FsObservation::new(root).map_err(|e| eyre!("Invalid mirror root: {e}"))?;
    info!(
        root = %observation.root(),
        path = %observation.mirror_path(&config.discovery.listener_path()),
        "Starting watch"
    );
    let (listener, trigger) = start_listener(config, Arc::new(observation))?;

    // Handle SIGTERM for graceful shutdown on Unix
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl-C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C, shutting down");
    }

    listener.deactivate();
    let dispatch = listener.stats();
    let summary = Summary {
        received: dispatch.accepted + dispatch.rejected,
        triggers: trigger.count(),
        dispatch,
    };
    print_summary(&summary, format)
}

/// Prints the derived paths.
fn run_paths(config: &Config, format: OutputFormat) -> color_eyre::Result<()> {
    let discovery = &config.discovery;
    let paths = [
        ("resource_path", discovery.resource_path()),
        ("listener_path", discovery.listener_path()),
        ("established_view", discovery.established_view_path()),
        ("cluster_instances", discovery.cluster_instances_path()),
        ("ongoing_votings", discovery.ongoing_votings_path()),
        ("previous_view", discovery.previous_view_path()),
        ("sync_tokens", discovery.sync_tokens_path()),
        ("id_map", discovery.id_map_path()),
    ];

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    match format {
        OutputFormat::Text => {
            for (name, path) in &paths {
                writeln!(handle, "{name:<18} {path}")?;
            }
        }
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = paths
                .into_iter()
                .map(|(name, path)| (name.to_owned(), serde_json::Value::String(path)))
                .collect();
            writeln!(handle, "{}", serde_json::to_string_pretty(&map)?)?;
        }
    }
    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Prints a run summary.
fn print_summary(summary: &Summary, format: OutputFormat) -> color_eyre::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(summary)
                .map_err(|e| eyre!("Failed to serialize JSON: {e}"))?;
            writeln!(handle, "{json}")?;
        }
        OutputFormat::Text => {
            let d = &summary.dispatch;
            writeln!(handle)?;
            writeln!(handle, "Topology Change Summary")?;
            writeln!(handle, "=======================")?;
            writeln!(handle)?;
            writeln!(handle, "Changes received:   {}", summary.received)?;
            writeln!(handle, "  Accepted:         {}", d.accepted)?;
            writeln!(handle, "  Rejected:         {} (after stop)", d.rejected)?;
            writeln!(handle, "  Dropped:          {} (queue full)", d.dropped)?;
            writeln!(handle, "  Discarded:        {} (at shutdown)", d.discarded)?;
            writeln!(handle)?;
            writeln!(handle, "Changes processed:  {}", d.processed)?;
            writeln!(handle, "  Unrelated:        {}", d.unrelated)?;
            writeln!(handle, "  Heartbeats:       {}", d.suppressed)?;
            writeln!(handle, "  Relevant:         {}", d.triggered)?;
            writeln!(handle, "  Detached:         {} (entry point gone)", d.detached)?;
            writeln!(handle)?;
            writeln!(handle, "Re-evaluations:     {}", summary.triggers)?;
            writeln!(handle, "  Failed:           {}", d.trigger_failures)?;
        }
    }
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Load configuration
    let config = load_config(cli.config.as_deref())?;

    // 5. Route to appropriate command
    match &cli.command {
        Commands::Replay {
            events,
            format,
            timeout_ms,
        } => run_replay(config, events, *format, Duration::from_millis(*timeout_ms)).await,
        Commands::Watch { root, format } => run_watch(config, root, *format).await,
        Commands::Paths { format } => run_paths(&config, *format),
    }
}

#[cfg(test)]
mod tests {
    use tc_core::ChangeKind;

    use super::*;

    #[test]
    fn test_parse_events() {
        let content = r#"
# recorded on node a
{"path": "/var/discovery/impl/establishedView/foo"}
{"path": "/var/discovery/impl/clusterInstances/a", "kind": "node_added", "changed_properties": ["lastHeartbeat"]}

{"path": "/unrelated", "kind": "removed"}
"#;
        let events = parse_events(content).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, ChangeKind::Changed);
        assert_eq!(events[1].kind, ChangeKind::Added);
        assert!(events[1].touches_only("lastHeartbeat"));
        assert_eq!(events[2].kind, ChangeKind::Removed);
    }

    #[test]
    fn test_parse_events_reports_line() {
        let content = "{\"path\": \"/a\"}\nnot json\n";
        let err = parse_events(content).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("listener.json")).unwrap();
        std::fs::write(&path, r#"{"discovery": {"resource_path": "/disco"}}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.discovery.listener_path(), "/disco");
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "tc-listen",
            "--verbose",
            "replay",
            "--events",
            "changes.jsonl",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Replay {
                format: OutputFormat::Json,
                timeout_ms: 5_000,
                ..
            }
        ));
    }
}
