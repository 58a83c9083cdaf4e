//! Command line arguments and layered configuration loading

use clap::Parser;
use config::{Config, Environment, File};

use toporoute_core::Configuration;

pub const DEFAULT_CONFIG_FILE: &str = "conf/toporoute.yml";
pub const DEFAULT_SERVICE_ID: &str = "1";

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "toporoute-server", version, about = "Topic routing coordinator node")]
pub struct Cli {
    /// Configuration file, skipped when missing
    #[arg(
        short = 'c',
        long = "config",
        env = "TOPOROUTE_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config_file: String,
    #[arg(long = "id")]
    pub id: Option<String>,
    /// Claim leadership explicitly
    #[arg(long = "leader")]
    pub leader: bool,
    #[arg(short = 't', long = "topics", value_delimiter = ',')]
    pub topics: Vec<String>,
    #[arg(long = "registry-key")]
    pub registry_key: Option<String>,
    #[arg(long = "gossip-port")]
    pub gossip_port: Option<u16>,
    /// Coordinators to run in this process against one shared store
    #[arg(short = 'n', long = "nodes", default_value_t = 1)]
    pub nodes: usize,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[arg(long = "log-dir")]
    pub log_dir: Option<String>,
    /// Prometheus scrape address, e.g. 127.0.0.1:9464
    #[arg(long = "metrics-listen")]
    pub metrics_listen: Option<String>,
}

/// Build the configuration from the file, `TOPOROUTE__*` environment
/// variables and command line overrides, in increasing precedence
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .set_default("toporoute.service.id", DEFAULT_SERVICE_ID)?
        .set_default("toporoute.registry.key", "services")?
        .add_source(File::with_name(&cli.config_file).required(false))
        .add_source(
            Environment::with_prefix("toporoute")
                .separator("__")
                .keep_prefix(true)
                .try_parsing(true),
        );

    if let Some(v) = &cli.id {
        builder = builder.set_override("toporoute.service.id", v.as_str())?;
    }
    if cli.leader {
        builder = builder.set_override("toporoute.service.leader", true)?;
    }
    if !cli.topics.is_empty() {
        builder = builder.set_override("toporoute.topics", cli.topics.join(","))?;
    }
    if let Some(v) = &cli.registry_key {
        builder = builder.set_override("toporoute.registry.key", v.as_str())?;
    }
    if let Some(v) = cli.gossip_port {
        builder = builder.set_override("toporoute.gossip.port", i64::from(v))?;
    }
    if let Some(v) = &cli.log_level {
        builder = builder.set_override("toporoute.logs.level", v.as_str())?;
    }
    if let Some(v) = &cli.log_dir {
        builder = builder.set_override("toporoute.logs.path", v.as_str())?;
    }
    if let Some(v) = &cli.metrics_listen {
        builder = builder.set_override("toporoute.metrics.listen", v.as_str())?;
    }

    Ok(Configuration::new(builder.build()?))
}
