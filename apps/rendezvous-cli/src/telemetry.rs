use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Overrides the computed filter entirely when set.
const FILTER_ENV: &str = "RENDEZVOUS_LOG_FILTER";
/// Lets trace level reach the webrtc and http stacks.
const TRACE_DEPS_ENV: &str = "RENDEZVOUS_TRACE_DEPS";

const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_mdns",
    "hyper",
    "reqwest",
    "rustls",
    "h2",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Repeated calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    if let Ok(filter) = std::env::var(FILTER_ENV) {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_directives(level.to_filter(), trace_deps()))
}

fn trace_deps() -> bool {
    std::env::var(TRACE_DEPS_ENV)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

fn default_directives(level: LevelFilter, trace_deps: bool) -> String {
    let mut directives = match level {
        LevelFilter::TRACE => "info,rendezvous=trace,rendezvous_engine=trace".to_owned(),
        LevelFilter::DEBUG => "info,rendezvous=debug,rendezvous_engine=debug".to_owned(),
        other => other.to_string().to_lowercase(),
    };
    if level == LevelFilter::TRACE && !trace_deps {
        for target in NOISY_DEPENDENCIES {
            directives.push_str(&format!(",{target}=info"));
        }
    }
    directives
}
