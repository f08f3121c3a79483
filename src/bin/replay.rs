//! Replay CLI - Command-line interface for Sensor Replay
//!
//! Commands:
//! - run: Replay recorded sources to the broker at their recorded cadence
//! - inspect: Summarize what a run would replay, without connecting
//! - generate: Write a dataset expanded to several simulated users
//! - convert: Rewrite a JSON-lines file as a JSON array
//! - watch: Subscribe to the replay topic and print incoming messages

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sensor_replay::config::DEFAULT_SOURCES;
use sensor_replay::generator::generate_multi_user;
use sensor_replay::ingest::{convert_jsonl_to_array, load_source};
use sensor_replay::pipeline::{InspectReport, PipelineReport};
use sensor_replay::transport::{Connector, LogConnector, MqttConnector, Transport};
use sensor_replay::{
    BrokerConfig, IgnoreSet, ReplayConfig, ReplayError, ReplayPipeline, Routing, SynthesisConfig,
    TopicMode, TransportError, UserId, DEFAULT_TOPIC, PRODUCER_NAME, REPLAY_VERSION,
};

/// Replay - timed MQTT replay of recorded wearable sensor data
#[derive(Parser)]
#[command(name = "replay")]
#[command(version = REPLAY_VERSION)]
#[command(about = "Replay recorded sensor data to an MQTT broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded sources to the broker
    Run {
        #[command(flatten)]
        replay: ReplayArgs,

        #[command(flatten)]
        broker: BrokerArgs,

        /// Log messages instead of sending them to a broker
        #[arg(long)]
        dry_run: bool,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize sources without publishing
    Inspect {
        #[command(flatten)]
        replay: ReplayArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Expand a recording to several simulated users
    Generate {
        /// Input recording
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (JSON array)
        #[arg(short, long)]
        output: PathBuf,

        /// Number of simulated users
        #[arg(long)]
        users: usize,

        /// Explicit user ids, one per user (comma separated)
        #[arg(long, value_delimiter = ',')]
        user_ids: Option<Vec<UserId>>,

        /// Keep only phone GPS measurements
        #[arg(long)]
        gps_only: bool,

        /// Seed for reproducible jitter
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Convert a JSON-lines file to a JSON array
    Convert {
        /// Input file (one JSON object per line)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Subscribe to the replay topic and print every message
    Watch {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Topic filter to subscribe to
        #[arg(long, env = "REPLAY_TOPIC", default_value = DEFAULT_TOPIC)]
        topic: String,

        /// Stop after this many messages
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args, Clone)]
struct ReplayArgs {
    /// Source files relative to the data folder [default: user1.json 05ago2025.json 07ago2025.json]
    sources: Vec<String>,

    /// Folder holding the recorded sources
    #[arg(long, env = "DATA_FOLDER", default_value = "data")]
    data_folder: PathBuf,

    /// Topic to publish on
    #[arg(long, env = "REPLAY_TOPIC", default_value = DEFAULT_TOPIC)]
    topic: String,

    /// One topic for every kind, or one sub-topic per kind
    #[arg(long, env = "TOPIC_MODE", value_enum, default_value = "unified")]
    topic_mode: TopicModeArg,

    /// Measurement kinds to leave out (comma separated)
    #[arg(long, env = "IGNORE_KINDS", default_value = "R2R,ECG,Position")]
    ignore: String,

    /// Playback speed multiplier
    #[arg(long, env = "REPLAY_SPEED", default_value = "1.0")]
    speed: f64,

    /// Simulated users per source
    #[arg(long, default_value = "1")]
    users: usize,

    /// Explicit user ids, one per simulated user (comma separated)
    #[arg(long, value_delimiter = ',')]
    user_ids: Option<Vec<UserId>>,

    /// Keep only phone GPS measurements when synthesizing users
    #[arg(long)]
    gps_only: bool,

    /// Seed for reproducible synthesis
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone)]
struct BrokerArgs {
    /// Broker URL (mqtt://host, tcp://host or host)
    #[arg(long, env = "BROKER_URL", default_value = "mqtt://broker.hivemq.com")]
    broker_url: String,

    /// Broker port, unless the URL names one
    #[arg(long, env = "BROKER_PORT", default_value = "1883")]
    broker_port: u16,

    #[arg(long, env = "BROKER_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// MQTT QoS level
    #[arg(long, env = "QOS", default_value = "2")]
    qos: u8,

    /// Keep-alive interval in seconds
    #[arg(long, env = "BROKER_KEEPALIVE", default_value = "2")]
    keep_alive: u64,

    /// Seconds to wait for the broker to accept the connection
    #[arg(long, env = "BROKER_CONNECT_TIMEOUT", default_value = "15")]
    connect_timeout: u64,

    /// Fixed MQTT client id
    #[arg(long)]
    client_id: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TopicModeArg {
    /// All kinds on one topic
    Unified,
    /// `<topic>/<Kind>` per measurement kind
    PerKind,
}

impl From<TopicModeArg> for TopicMode {
    fn from(mode: TopicModeArg) -> Self {
        match mode {
            TopicModeArg::Unified => TopicMode::Unified,
            TopicModeArg::PerKind => TopicMode::PerKind,
        }
    }
}

impl BrokerArgs {
    fn into_config(self) -> BrokerConfig {
        BrokerConfig {
            url: self.broker_url,
            port: self.broker_port,
            username: self.username,
            password: self.password,
            qos: self.qos,
            keep_alive: Duration::from_secs(self.keep_alive),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            client_id: self.client_id,
            ..Default::default()
        }
    }
}

impl ReplayArgs {
    fn into_config(self, broker: BrokerConfig) -> Result<ReplayConfig, ReplayCliError> {
        let ignore = IgnoreSet::parse_list(&self.ignore).map_err(ReplayCliError::InvalidArgument)?;
        let sources = if self.sources.is_empty() {
            DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect()
        } else {
            self.sources
        };

        Ok(ReplayConfig {
            data_folder: self.data_folder,
            sources,
            routing: Routing::new(self.topic, self.topic_mode.into()),
            ignore,
            speed: self.speed,
            synthesis: SynthesisConfig {
                users: self.users,
                custom_user_ids: self.user_ids,
                gps_only: self.gps_only,
                seed: self.seed,
            },
            broker,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Values from .env take precedence over the process environment
    let env_file = load_env_file(Path::new(".env"));
    init_logging();
    match env_file {
        Ok(true) => info!("loaded settings from .env"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "ignoring unreadable .env file"),
    }
    let cli = Cli::parse();

    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    match run(cli, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Load `path` into the environment, overriding variables already set.
///
/// Returns `Ok(false)` when the file does not exist.
fn load_env_file(path: &Path) -> Result<bool, dotenvy::Error> {
    match dotenvy::from_path_override(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, stopping replay streams");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(cli: Cli, token: CancellationToken) -> Result<(), ReplayCliError> {
    match cli.command {
        Commands::Run {
            replay,
            broker,
            dry_run,
            json,
        } => cmd_run(replay, broker, dry_run, json, &token).await,
        Commands::Inspect { replay, json } => cmd_inspect(replay, json),
        Commands::Generate {
            input,
            output,
            users,
            user_ids,
            gps_only,
            seed,
        } => cmd_generate(
            &input,
            &output,
            SynthesisConfig {
                users,
                custom_user_ids: user_ids,
                gps_only,
                seed,
            },
        ),
        Commands::Convert { input, output } => cmd_convert(&input, &output),
        Commands::Watch {
            broker,
            topic,
            limit,
        } => cmd_watch(broker.into_config(), &topic, limit, &token).await,
    }
}

async fn cmd_run(
    replay: ReplayArgs,
    broker: BrokerArgs,
    dry_run: bool,
    json: bool,
    token: &CancellationToken,
) -> Result<(), ReplayCliError> {
    let config = replay.into_config(broker.into_config())?;
    let pipeline = ReplayPipeline::new(config)?;

    let report = if dry_run {
        pipeline.run(&LogConnector, token).await?
    } else {
        let connector = MqttConnector::new(pipeline.config().broker.clone());
        pipeline.run(&connector, token).await?
    };

    print_run_report(&report, json)?;

    if report.replay.failures.is_empty() {
        Ok(())
    } else {
        Err(ReplayCliError::StreamsFailed(report.replay.failures.len()))
    }
}

fn print_run_report(report: &PipelineReport, json: bool) -> Result<(), ReplayCliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Replay Report");
    println!("=============");
    println!(
        "{:<24} {:>10} {:>10} {:>12} {:>10} {:>8}",
        "SOURCE", "USER", "STATE", "GROUPS", "PUBLISHED", "FAILED"
    );
    for stream in &report.replay.streams {
        println!(
            "{:<24} {:>10} {:>10} {:>12} {:>10} {:>8}",
            stream.source,
            stream.user_id,
            stream.state.to_string(),
            format!("{}/{}", stream.groups_emitted, stream.total_groups),
            stream.messages_published,
            stream.publish_failures
        );
    }
    println!();
    println!(
        "Published {} messages ({} failed)",
        report.replay.messages_published(),
        report.replay.publish_failures()
    );
    for failure in &report.failed_sources {
        println!("Skipped {}: {}", failure.source, failure.message);
    }
    for failure in &report.replay.failures {
        println!("Failed: {}", failure);
    }
    Ok(())
}

fn cmd_inspect(replay: ReplayArgs, json: bool) -> Result<(), ReplayCliError> {
    let config = replay.into_config(BrokerConfig::default())?;
    let report = ReplayPipeline::new(config)?.inspect()?;
    print_inspect_report(&report, json)
}

fn print_inspect_report(report: &InspectReport, json: bool) -> Result<(), ReplayCliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Replay Inspection");
    println!("=================");
    for stream in &report.streams {
        let span = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
        };
        let kinds: Vec<&str> = stream.kinds.iter().map(|k| k.as_str()).collect();

        println!("{} / user {}", stream.source, stream.user_id);
        println!("  measurements: {}", stream.measurements);
        println!("  groups:       {}", stream.groups);
        println!("  first:        {}", span(stream.first));
        println!("  last:         {}", span(stream.last));
        println!("  duration:     {}s", stream.duration_secs);
        println!("  kinds:        {}", kinds.join(", "));
    }
    for failure in &report.failed_sources {
        println!("Skipped {}: {}", failure.source, failure.message);
    }
    Ok(())
}

fn cmd_generate(
    input: &Path,
    output: &Path,
    synthesis: SynthesisConfig,
) -> Result<(), ReplayCliError> {
    let measurements = load_source(input).map_err(ReplayError::from)?;
    let mut rng = match synthesis.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let expanded = generate_multi_user(measurements, &synthesis, &mut rng)?;
    fs::write(output, serde_json::to_string_pretty(&expanded)?)?;

    info!(
        input = %input.display(),
        output = %output.display(),
        users = synthesis.users,
        measurements = expanded.len(),
        "dataset generated"
    );
    Ok(())
}

fn cmd_convert(input: &Path, output: &Path) -> Result<(), ReplayCliError> {
    let records = convert_jsonl_to_array(input, output).map_err(ReplayError::from)?;
    info!(input = %input.display(), output = %output.display(), records, "converted");
    Ok(())
}

async fn cmd_watch(
    broker: BrokerConfig,
    topic: &str,
    limit: Option<usize>,
    token: &CancellationToken,
) -> Result<(), ReplayCliError> {
    let transport = MqttConnector::new(broker).connect().await?;
    let mut messages = transport.subscribe(topic).await?;
    info!(producer = PRODUCER_NAME, topic, "watching");

    let mut count = 0usize;
    let mut previous: Option<chrono::DateTime<chrono::Utc>> = None;
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        count += 1;
        let since = previous
            .map(|p| format!("+{} ms", (message.received_at - p).num_milliseconds()))
            .unwrap_or_else(|| "first".to_string());
        previous = Some(message.received_at);

        println!(
            "[{}] {} ({}) {}",
            count,
            message.topic,
            since,
            String::from_utf8_lossy(&message.payload)
        );

        if limit.is_some_and(|limit| count >= limit) {
            break;
        }
    }

    transport.disconnect().await?;
    info!(received = count, "watch finished");
    Ok(())
}

// Error types

#[derive(Debug)]
enum ReplayCliError {
    Io(io::Error),
    Replay(ReplayError),
    Json(serde_json::Error),
    InvalidArgument(String),
    StreamsFailed(usize),
}

impl From<io::Error> for ReplayCliError {
    fn from(e: io::Error) -> Self {
        ReplayCliError::Io(e)
    }
}

impl From<ReplayError> for ReplayCliError {
    fn from(e: ReplayError) -> Self {
        ReplayCliError::Replay(e)
    }
}

impl From<TransportError> for ReplayCliError {
    fn from(e: TransportError) -> Self {
        ReplayCliError::Replay(ReplayError::Connection(e))
    }
}

impl From<serde_json::Error> for ReplayCliError {
    fn from(e: serde_json::Error) -> Self {
        ReplayCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<ReplayCliError> for CliError {
    fn from(e: ReplayCliError) -> Self {
        match e {
            ReplayCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            ReplayCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            ReplayCliError::InvalidArgument(message) => CliError {
                code: "INVALID_ARGUMENT".to_string(),
                message,
                hint: Some("Run 'replay --help' for usage".to_string()),
            },
            ReplayCliError::StreamsFailed(count) => CliError {
                code: "STREAMS_FAILED".to_string(),
                message: format!("{} replay streams ended abnormally", count),
                hint: Some("See the log for the affected source and user".to_string()),
            },
            ReplayCliError::Replay(e) => {
                let (code, hint) = match &e {
                    ReplayError::Connection(_) => (
                        "CONNECTION_ERROR",
                        Some("Check BROKER_URL, BROKER_PORT and credentials"),
                    ),
                    ReplayError::Ingest(_) => (
                        "INGEST_ERROR",
                        Some("Check DATA_FOLDER and the source file names"),
                    ),
                    ReplayError::Synthesis(_) => (
                        "SYNTHESIS_ERROR",
                        Some("Give exactly one --user-ids entry per user"),
                    ),
                    ReplayError::Config(_) => ("CONFIG_ERROR", None),
                    ReplayError::StreamPanicked { .. } => ("STREAM_FAILED", None),
                    ReplayError::Json(_) => ("JSON_ERROR", Some("Check JSON syntax")),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_file_overrides_process_environment() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let key = format!("REPLAY_TEST_BROKER_{}", id);
        let path = std::env::temp_dir().join(format!("replay-{}.env", id));
        fs::write(&path, format!("{}=mqtt://from-file\n", key)).unwrap();
        std::env::set_var(&key, "mqtt://from-process");

        assert!(load_env_file(&path).unwrap());
        assert_eq!(std::env::var(&key).unwrap(), "mqtt://from-file");

        fs::remove_file(&path).unwrap();
        std::env::remove_var(&key);
    }

    #[test]
    fn test_missing_env_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("missing-{}.env", uuid::Uuid::new_v4()));
        assert!(!load_env_file(&path).unwrap());
    }
}
