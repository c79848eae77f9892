//! vsrelay CLI
//!
//! Thin wrapper over `vsrelay-core`: loads configuration, wires the history
//! source, sink and checkpoint store into a [`Relay`], and maps outcomes to
//! exit codes (0 cancelled, 1 fatal, 2 configuration).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use vsrelay_core::checkpoint::{CheckpointConfig, ResumeOrigin, resolve_begin};
use vsrelay_core::checkpoint_store::{CheckpointStore, open_store};
use vsrelay_core::config::{Config, SourceConfig, format_duration};
use vsrelay_core::error::Remediation;
use vsrelay_core::logging::init_logging;
use vsrelay_core::relay::{Relay, RelaySettings};
use vsrelay_core::sink::{HttpSink, StdoutSink};
use vsrelay_core::source::{EventSource, HistoryFileSource};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Config file used when `--config` is not given and it exists.
const DEFAULT_CONFIG_FILE: &str = "vsrelay.toml";

/// Sink address placeholder for dry runs without a configured sink.
const DRY_RUN_SINK: &str = "stdout://";

#[derive(Parser)]
#[command(name = "vsrelay")]
#[command(version, about = "Relay a vCenter-style event history to a CloudEvents sink")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and run until Ctrl-C or SIGTERM
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Write envelopes to stdout instead of the configured sink
        #[arg(long)]
        dry_run: bool,

        /// Keep checkpoints in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Inspect the durable checkpoint
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Print the durable checkpoint and the begin time a restart would use
    Show {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate and print the resolved configuration
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to the TOML config file (default: ./vsrelay.toml when present)
    #[arg(long, env = "VSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint policy as JSON, e.g. {"maxAge":"1h","period":"30s"}
    #[arg(long, env = "VSRELAY_CHECKPOINT_CONFIG")]
    checkpoint_config: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

/// Why a command failed, and therefore which exit code it maps to.
#[derive(Debug)]
enum Failure {
    Config(anyhow::Error),
    Fatal(anyhow::Error),
}

impl Failure {
    fn config(err: impl Into<anyhow::Error>) -> Self {
        Self::Config(err.into())
    }

    fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Fatal(_) => EXIT_FATAL,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Self::Config(err) | Self::Fatal(err) => err,
        }
    }

    fn remediation(&self) -> Option<Remediation> {
        self.error()
            .downcast_ref::<vsrelay_core::Error>()
            .and_then(vsrelay_core::Error::remediation)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            config,
            dry_run,
            ephemeral,
        } => cmd_run(&config, dry_run, ephemeral).await,
        Commands::Checkpoint {
            command: CheckpointCommands::Show { config, format },
        } => cmd_checkpoint_show(&config, format).await,
        Commands::Config {
            command: ConfigCommands::Check { config },
        } => cmd_config_check(&config),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("error: {:#}", failure.error());
            if let Some(remediation) = failure.remediation() {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::from(failure.exit_code())
        }
    }
}

// =============================================================================
// Config loading
// =============================================================================

/// Resolve the config file, apply the checkpoint policy override, validate.
fn load_config(args: &ConfigArgs, adjust: impl FnOnce(&mut Config)) -> Result<Config, Failure> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).map_err(Failure::config)?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            Config::load_from(Path::new(DEFAULT_CONFIG_FILE)).map_err(Failure::config)?
        }
        None => Config::default(),
    };

    if let Some(blob) = &args.checkpoint_config {
        let policy = CheckpointConfig::from_json(blob)
            .map_err(|e| Failure::config(vsrelay_core::Error::from(e)))?;
        config.checkpoint.apply_policy(policy);
    }

    adjust(&mut config);
    config.validate().map_err(Failure::config)?;
    Ok(config)
}

fn build_source(config: &SourceConfig) -> HistoryFileSource {
    let mut source = HistoryFileSource::new(&config.path);
    if let Some(identity) = &config.identity {
        source = source.with_identity(identity);
    }
    if let Some(api_version) = &config.api_version {
        source = source.with_api_version(api_version);
    }
    source
}

// =============================================================================
// run
// =============================================================================

async fn cmd_run(args: &ConfigArgs, dry_run: bool, ephemeral: bool) -> Result<(), Failure> {
    let config = load_config(args, |config| {
        if ephemeral {
            config.checkpoint.store = "memory://".to_string();
        }
        if dry_run && config.sink.url.trim().is_empty() {
            config.sink.url = DRY_RUN_SINK.to_string();
        }
    })?;

    init_logging(&config.general.log_config()).map_err(Failure::fatal)?;

    let settings = RelaySettings::from_config(&config).map_err(Failure::config)?;
    let source = build_source(&config.source);
    let store = open_store(&config.checkpoint.store)
        .map_err(|e| Failure::fatal(vsrelay_core::Error::from(e)))?;

    tracing::info!(
        source = source.identity(),
        store = %store.describe(),
        sink = if dry_run { "stdout" } else { config.sink.url.as_str() },
        max_age = %format_duration(config.checkpoint.max_age),
        period = %format_duration(config.checkpoint.period),
        "starting relay"
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tx));

    let err = if dry_run {
        let mut relay = Relay::new(source, StdoutSink::stdout(), store, settings);
        relay.run(rx).await
    } else {
        let sink = HttpSink::new(&config.sink.url, config.sink.timeout())
            .map_err(|e| Failure::fatal(vsrelay_core::Error::from(e)))?;
        let mut relay = Relay::new(source, sink, store, settings);
        relay.run(rx).await
    };

    if err.is_cancelled() {
        Ok(())
    } else {
        Err(Failure::fatal(err))
    }
}

/// Flip the shutdown flag on Ctrl-C or SIGTERM.
async fn forward_shutdown(tx: watch::Sender<bool>) {
    wait_for_signal().await;
    tracing::info!("shutdown requested");
    let _ = tx.send(true);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// =============================================================================
// checkpoint show
// =============================================================================

async fn cmd_checkpoint_show(args: &ConfigArgs, format: OutputFormat) -> Result<(), Failure> {
    let config = load_config(args, |config| {
        // Inspection never talks to the sink.
        if config.sink.url.trim().is_empty() {
            config.sink.url = DRY_RUN_SINK.to_string();
        }
    })?;

    let store = open_store(&config.checkpoint.store)
        .map_err(|e| Failure::fatal(vsrelay_core::Error::from(e)))?;
    let checkpoint = store
        .get(&config.checkpoint.key)
        .await
        .map_err(|e| Failure::fatal(vsrelay_core::Error::from(e)))?;

    let source = build_source(&config.source);
    let now = source
        .current_time()
        .await
        .map_err(|e| Failure::fatal(vsrelay_core::Error::from(e)))?;
    let plan = resolve_begin(now, checkpoint.as_ref(), config.checkpoint.max_age);

    let origin = match plan.origin {
        ResumeOrigin::Fresh => "fresh",
        ResumeOrigin::Checkpoint { .. } => "checkpoint",
        ResumeOrigin::Clamped { .. } => "clamped",
    };

    match format {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "store": store.describe(),
                "key": config.checkpoint.key,
                "checkpoint": checkpoint,
                "resume": {
                    "now": now,
                    "begin": plan.begin,
                    "origin": origin,
                    "loses_data": plan.loses_data(),
                    "max_age": format_duration(config.checkpoint.max_age),
                },
            });
            let text = serde_json::to_string_pretty(&doc).map_err(Failure::fatal)?;
            println!("{text}");
        }
        OutputFormat::Plain => {
            println!("store:      {}", store.describe());
            println!("key:        {}", config.checkpoint.key);
            match &checkpoint {
                Some(cp) => {
                    println!("source:     {}", cp.source);
                    println!("event key:  {}", cp.last_event_key);
                    println!("event type: {}", cp.last_event_type);
                    println!("timestamp:  {}", cp.last_event_timestamp.to_rfc3339());
                    println!("written at: {}", cp.written_at.to_rfc3339());
                }
                None => println!("checkpoint: none"),
            }
            println!(
                "resume:     {} ({origin}, max_age {})",
                plan.begin.to_rfc3339(),
                format_duration(config.checkpoint.max_age)
            );
            if plan.loses_data() {
                println!(
                    "warning:    checkpoint is older than the replay window; events before the resume time will be skipped"
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// config check
// =============================================================================

fn cmd_config_check(args: &ConfigArgs) -> Result<(), Failure> {
    let config = load_config(args, |_| {})?;
    let text = config.to_toml_string().map_err(Failure::fatal)?;
    print!("{text}");
    if config.checkpoint.max_age.is_zero() {
        eprintln!(
            "warning: checkpoint.max_age is 0s; replay is disabled and every restart begins at the source's current time"
        );
    }
    Ok(())
}
