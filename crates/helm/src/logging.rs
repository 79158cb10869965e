use std::io;

use eyre::{Result, eyre};
use helm_core::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const LOG_FILE_PREFIX: &str = "helm.log";

/// Filter precedence: an explicit `--log-level`, then `RUST_LOG`, then the
/// configured level.
pub fn env_filter(config: &LogConfig, explicit: bool) -> Result<EnvFilter> {
    if !explicit && let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| eyre!("Invalid log filter '{}': {}", config.level, e))
}

/// Console output goes to stderr so command output on stdout stays
/// parseable. With `log.dir` set, a daily rolling file is written too; keep
/// the returned guard alive until exit so buffered lines are flushed.
pub fn init_tracing(config: &LogConfig, explicit_level: bool) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config, explicit_level)?;

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config
        .json
        .then(|| fmt::Layer::new().json().with_writer(io::stderr));
    let text_layer = (!config.json).then(|| {
        fmt::Layer::new()
            .with_writer(io::stderr)
            .with_target(true)
    });

    let subscriber = tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .with(filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| eyre!("Failed to set global default subscriber: {}", e))?;

    tracing::debug!(
        target: "helm::logging",
        level = %config.level,
        json = config.json,
        dir = ?config.dir,
        "Tracing initialized"
    );
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_wins() {
        let config = LogConfig {
            level: "helm::engine=trace,warn".to_string(),
            ..LogConfig::default()
        };
        let filter = env_filter(&config, true).unwrap();
        assert!(filter.to_string().contains("helm::engine=trace"));
    }

    #[test]
    fn invalid_levels_are_errors() {
        let config = LogConfig {
            level: "helm=loud".to_string(),
            ..LogConfig::default()
        };
        assert!(env_filter(&config, true).is_err());
    }
}
