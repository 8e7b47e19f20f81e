use anyhow::{anyhow, Result};
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use tracing::{warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Directory for rolling log files: `REEL_LOG_DIR`, or the platform's local data dir.
pub fn log_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var("REEL_LOG_DIR") {
        return PathBuf::from(custom_dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("reel")
        .join("logs")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Log to stderr and to a daily rolling file. Keep the returned guard alive
/// until exit so buffered file output is flushed.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let log_dir = log_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "reel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(env_filter(log_level)),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter(log_level)),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    Ok(guard)
}

/// Parse a `key=value` command-line variable. The value is read as YAML so
/// `count=3` is a number and `flags=[a, b]` a list.
pub fn parse_var(input: &str) -> Result<(String, Value)> {
    let (key, raw) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("Variable '{}' must look like key=value", input))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Variable '{}' has an empty name", input));
    }
    let value = match serde_yaml::from_str::<Value>(raw) {
        Ok(Value::Null) if !raw.trim().is_empty() && raw.trim() != "null" && raw.trim() != "~" => {
            Value::String(raw.to_string())
        }
        Ok(value) => value,
        Err(e) => {
            warn!("Treating '{}' as text: {}", raw, e);
            Value::String(raw.to_string())
        }
    };
    Ok((key.to_string(), value))
}
