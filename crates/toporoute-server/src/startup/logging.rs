//! File-based logging split by component.
//!
//! | Log File        | Component                | Target Prefixes                                 |
//! |-----------------|--------------------------|-------------------------------------------------|
//! | toporoute.log   | Root logger              | (all)                                           |
//! | coordinator.log | Registry and election    | toporoute_core::{coordinator,election,registry} |
//! | assignment.log  | Assignment publish/watch | toporoute_core::{assignment,lease}              |
//! | balance.log     | Hash ring and cache      | toporoute_core::{balancer,cache,ring}           |
//! | gossip.log      | Topic ownership gossip   | toporoute_gossip                                |
//! | store.log       | Coordination store       | toporoute_store                                 |
//!
//! Log files are stored in `~/toporoute/logs` by default.
//! Override with `toporoute.logs.path` or `--log-dir`.

use std::path::PathBuf;

use anyhow::Context;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use toporoute_core::Configuration;

const ROOT_LOG_FILE: &str = "toporoute.log";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "coordinator.log",
        targets: &[
            "toporoute_core::coordinator",
            "toporoute_core::election",
            "toporoute_core::registry",
        ],
    },
    ComponentLogDef {
        file_name: "assignment.log",
        targets: &["toporoute_core::assignment", "toporoute_core::lease"],
    },
    ComponentLogDef {
        file_name: "balance.log",
        targets: &[
            "toporoute_core::balancer",
            "toporoute_core::cache",
            "toporoute_core::ring",
        ],
    },
    ComponentLogDef {
        file_name: "gossip.log",
        targets: &["toporoute_gossip"],
    },
    ComponentLogDef {
        file_name: "store.log",
        targets: &["toporoute_store"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl LogRotation {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    /// Level used when `RUST_LOG` is not set
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/toporoute/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    pub fn from_config(
        log_dir: Option<String>,
        console_output: bool,
        file_logging: bool,
        level: String,
    ) -> Self {
        let level = level.parse().unwrap_or(Level::INFO);

        Self {
            log_dir: log_dir.map(PathBuf::from).unwrap_or_else(default_log_dir),
            console_output,
            console_level: level,
            file_logging,
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }

    /// Read the `toporoute.logs.*` keys
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let config = &configuration.config;
        let mut logging = Self::from_config(
            config.get_string("toporoute.logs.path").ok(),
            config.get_bool("toporoute.logs.console").unwrap_or(true),
            config.get_bool("toporoute.logs.file").unwrap_or(true),
            config
                .get_string("toporoute.logs.level")
                .unwrap_or("info".to_string()),
        );
        if let Ok(rotation) = config.get_string("toporoute.logs.rotation") {
            logging.rotation = LogRotation::parse(&rotation);
        }
        logging
    }
}

/// Keeps the non-blocking file writers alive; dropping it flushes buffered output
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber: console output, the root `toporoute.log`
/// and one file per component routed by tracing target.
///
/// `RUST_LOG` overrides the configured level for the console and root file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        let component_level: LevelFilter = config.file_level.into();
        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, component_level);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .context("Failed to initialize logging")?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use config::Config;

    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.log_dir.ends_with("toporoute/logs"));
    }

    #[test]
    fn test_logging_config_from_configuration() {
        let config = Config::builder()
            .set_override("toporoute.logs.path", "/tmp/toporoute-test-logs")
            .unwrap()
            .set_override("toporoute.logs.console", false)
            .unwrap()
            .set_override("toporoute.logs.level", "debug")
            .unwrap()
            .set_override("toporoute.logs.rotation", "hourly")
            .unwrap()
            .build()
            .unwrap();
        let logging = LoggingConfig::from_configuration(&Configuration::new(config));

        assert_eq!(logging.log_dir, PathBuf::from("/tmp/toporoute-test-logs"));
        assert!(!logging.console_output);
        assert!(logging.file_logging);
        assert_eq!(logging.file_level, Level::DEBUG);
        assert_eq!(logging.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let logging = LoggingConfig::from_config(None, true, false, "loud".to_string());
        assert_eq!(logging.console_level, Level::INFO);
    }

    #[test]
    fn test_component_targets_are_crate_paths() {
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert_ne!(component.file_name, ROOT_LOG_FILE);
            assert!(
                component
                    .targets
                    .iter()
                    .all(|t| t.starts_with("toporoute_"))
            );
        }
    }

    #[test]
    fn test_init_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LoggingConfig {
            log_dir: log_dir.clone(),
            console_output: false,
            rotation: LogRotation::Never,
            ..LoggingConfig::default()
        };

        let guard = init_logging(&config).unwrap();
        tracing::info!(target: "toporoute_gossip", "hello");
        drop(guard);

        assert!(log_dir.join(ROOT_LOG_FILE).exists());
        assert!(log_dir.join("gossip.log").exists());
    }
}
