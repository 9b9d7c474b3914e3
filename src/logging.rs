//! Logging setup on tracing + tracing-subscriber
//!
//! Every subsystem logs under its module path (`shoal_worker::socket`,
//! `shoal_worker::commission`, ...). The filter is built from the global
//! level plus the `[logging.modules]` table:
//!
//! ```text
//! shoal_worker=info,shoal_worker::commission=debug,shoal_worker::tunnel=warn
//! ```
//!
//! `-v`/`-vv`/`--quiet` replace the per-subsystem levels with one level for
//! the whole crate. A non-empty `RUST_LOG` replaces the filter entirely.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Subsystems that accept their own level in `[logging.modules]`
pub const SUBSYSTEMS: &[&str] = &[
    "tunnel",
    "protocol",
    "socket",
    "group",
    "commission",
    "membership",
    "peer",
];

const CRATE_TARGET: &str = "shoal_worker";

/// Keeps the file writer flushing until dropped
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber for `shoal-worker run`
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let overridden = quiet || verbose > 0;
    let level = determine_level(settings, verbose, quiet);
    let filter = build_env_filter(&directives(settings, level, overridden))?;

    let console = format_layer(settings.json_format, true, std::io::stderr);

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(log_file) => {
            let (writer, guard) = file_writer(log_file, settings)?;
            (Some(format_layer(settings.json_format, false, writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::info!(
        level = %level,
        modules = ?settings.modules,
        file = ?settings.file,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// Console-only logging for the short `config` and `seed` commands
pub fn init_console(level: Level) -> Result<()> {
    let filter = build_env_filter(&[level_directive(CRATE_TARGET, level)])?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn level_directive(target: &str, level: Level) -> String {
    format!("{}={}", target, level.as_str().to_lowercase())
}

/// Filter directives, crate-wide level first and subsystem levels after it
fn directives(settings: &LoggingSettings, level: Level, overridden: bool) -> Vec<String> {
    let mut directives = vec!["warn".to_string(), level_directive(CRATE_TARGET, level)];
    if !overridden {
        for (module, module_level) in &settings.modules {
            directives.push(level_directive(
                &format!("{}::{}", CRATE_TARGET, module),
                parse_level(module_level),
            ));
        }
    }
    directives
}

fn build_env_filter(directives: &[String]) -> Result<EnvFilter> {
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !env.trim().is_empty() {
            return EnvFilter::try_new(&env)
                .map_err(|e| Error::Config(format!("Invalid RUST_LOG '{}': {}", env, e)));
        }
    }
    directives.iter().try_fold(EnvFilter::new(""), |filter, text| {
        let directive = text
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", text, e)))?;
        Ok(filter.add_directive(directive))
    })
}

/// One fmt layer; JSON carries spans and source locations, text stays compact
fn format_layer<S, W>(json: bool, ansi: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(ansi)
                .compact(),
        )
    }
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn file_writer(
    log_file: &str,
    settings: &LoggingSettings,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let path = Path::new(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let prefix = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("shoal-worker");

    let appender = RollingFileAppender::builder()
        .rotation(rotation(&settings.rotation))
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(settings.max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to open log file '{}': {}", log_file, e)))?;

    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_modules(pairs: &[(&str, &str)]) -> LoggingSettings {
        let mut settings = LoggingSettings::default();
        for (module, level) in pairs {
            settings.modules.insert(module.to_string(), level.to_string());
        }
        settings
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_determine_level_flags() {
        let settings = LoggingSettings {
            level: "warn".to_string(),
            ..Default::default()
        };
        assert_eq!(determine_level(&settings, 0, false), Level::WARN);
        assert_eq!(determine_level(&settings, 1, false), Level::DEBUG);
        assert_eq!(determine_level(&settings, 2, false), Level::TRACE);
        assert_eq!(determine_level(&settings, 2, true), Level::ERROR);
    }

    #[test]
    fn test_subsystem_directives() {
        let settings = with_modules(&[("commission", "debug"), ("tunnel", "warn")]);
        assert_eq!(
            directives(&settings, Level::INFO, false),
            vec![
                "warn",
                "shoal_worker=info",
                "shoal_worker::commission=debug",
                "shoal_worker::tunnel=warn",
            ]
        );
    }

    #[test]
    fn test_verbosity_flags_replace_subsystem_levels() {
        let settings = with_modules(&[("socket", "error")]);
        assert_eq!(
            directives(&settings, Level::TRACE, true),
            vec!["warn", "shoal_worker=trace"]
        );
    }

    #[test]
    fn test_directives_parse() {
        let settings = with_modules(&[("group", "trace")]);
        assert!(build_env_filter(&directives(&settings, Level::INFO, false)).is_ok());
    }

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("daily"), Rotation::DAILY);
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs").join("worker.log");
        let settings = LoggingSettings::default();

        let result = file_writer(log_path.to_str().unwrap(), &settings);

        assert!(result.is_ok());
        assert!(temp_dir.path().join("logs").exists());
    }
}
