// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tracing::metadata::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use tailwatch::bounded_channel::BoundedReceiver;
use tailwatch::init::args::{ReadMode, TailArgs};
use tailwatch::init::wait::{self, TaskResult};
use tailwatch::{
    Action, ChannelObserver, ChunkOrder, ChunkedReader, ObservedEvent, ReadStrategy, TailReader,
};

type BoxError = Box<dyn Error + Send + Sync>;

const EVENT_QUEUE_SIZE: usize = 1_000;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "tailwatch")]
#[command(bin_name = "tailwatch")]
#[command(version, about, long_about = None)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "TAILWATCH_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[arg(value_enum, long, env = "TAILWATCH_OUTPUT", default_value = "text")]
    /// Event output on stdout. Text prints file data only, json prints every event
    output: OutputFormat,

    /// Glob patterns of the files to follow
    #[arg(required = true)]
    patterns: Vec<String>,

    #[command(flatten)]
    tail: TailArgs,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let _guard = match setup_logging(&opt.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to setup logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = e, "Failed to run.");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(opt: Arguments) -> Result<(), BoxError> {
    let config = opt.tail.build_config();
    info!(
        version = get_version(),
        mode = ?opt.tail.mode,
        stat_interval = ?config.stat_interval,
        max_open_files = config.max_open_files,
        "Starting tailwatch"
    );

    match opt.tail.mode {
        ReadMode::Line => {
            let reader = TailReader::new(&config)?;
            follow(Arc::new(reader), &opt.patterns, opt.output).await
        }
        ReadMode::Depth => {
            let reader = ChunkedReader::new(&config, ChunkOrder::DepthFirst)?;
            follow(Arc::new(reader), &opt.patterns, opt.output).await
        }
        ReadMode::Breadth => {
            let reader = ChunkedReader::new(&config, ChunkOrder::BreadthFirst)?;
            follow(Arc::new(reader), &opt.patterns, opt.output).await
        }
    }
}

/// Run `reader` on a blocking thread and print what it observes until a shutdown signal,
/// or until either side stops on its own.
async fn follow<R>(reader: Arc<R>, patterns: &[String], output: OutputFormat) -> TaskResult
where
    R: ReadStrategy + 'static,
{
    for pattern in patterns {
        reader.monitor(pattern)?;
    }

    let (observer, rx) = ChannelObserver::with_capacity(EVENT_QUEUE_SIZE);
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();
    {
        let reader = reader.clone();
        tasks.spawn_blocking(move || reader.subscribe(&observer).map_err(|e| e.into()));
    }
    tasks.spawn(write_events(rx, output));

    let result = select! {
        r = signal_wait() => {
            info!("Shutdown signal received.");
            r
        },
        e = wait::wait_for_any_task(&mut tasks) => {
            if e.is_ok() {
                warn!("Unexpected early exit of reader or output.");
            }
            e
        },
    };

    if let Err(e) = reader.quit() {
        warn!(error = %e, "Failed to write checkpoints on quit");
    }
    let drained = wait::wait_for_tasks_with_timeout(&mut tasks, SHUTDOWN_TIMEOUT).await;
    result.and(drained)
}

async fn write_events(mut rx: BoundedReceiver<ObservedEvent>, output: OutputFormat) -> TaskResult {
    while let Some(event) = rx.next().await {
        let mut out = io::stdout().lock();
        match output {
            OutputFormat::Text => match &event.action {
                Action::Line(line) => {
                    out.write_all(line)?;
                    out.write_all(b"\n")?;
                }
                Action::Chunk(chunk) => out.write_all(chunk)?,
                action => debug!(path = ?event.context.path, %action, "File event"),
            },
            OutputFormat::Json => {
                serde_json::to_writer(&mut out, &event_json(&event))?;
                out.write_all(b"\n")?;
            }
        }
        if rx.is_empty() {
            out.flush()?;
        }
    }
    Ok(())
}

fn event_json(event: &ObservedEvent) -> serde_json::Value {
    serde_json::json!({
        "path": event.context.path.display().to_string(),
        "identity": event.context.identity.map(|id| id.to_string()),
        "action": event.action.name(),
        "data": event.action.data().map(String::from_utf8_lossy),
        "error": match &event.action {
            Action::Error(message) => Some(message.as_str()),
            _ => None,
        },
    })
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

// Logs go to stderr, stdout carries the followed data.
fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stderr().is_terminal();

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(unix)]
async fn signal_wait() -> TaskResult {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn signal_wait() -> TaskResult {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
