use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::config::{ClientConfig, ConfigError, parse_servers};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tideline",
    about = "Follow a live app session and keep its scene in sync",
    version
)]
pub struct Cli {
    #[arg(
        long = "server",
        value_name = "URL",
        value_delimiter = ',',
        help = "Server base URL; repeat or comma separate to probe several (overrides TIDELINE_SERVERS)"
    )]
    pub servers: Vec<String>,

    #[arg(
        long = "host-token",
        value_name = "TOKEN",
        help = "Session token to offer on the first connection (overrides TIDELINE_HOST_TOKEN)"
    )]
    pub host_token: Option<String>,

    #[arg(
        long = "connect-timeout-ms",
        value_name = "MS",
        help = "Give up on a websocket handshake after this long"
    )]
    pub connect_timeout_ms: Option<u64>,

    #[arg(
        long = "retry-warning",
        value_name = "COUNT",
        help = "Report connection errors once this many probe rounds have failed"
    )]
    pub retry_warning: Option<u32>,

    #[arg(
        long = "heartbeat-secs",
        value_name = "SECS",
        default_value_t = 30,
        help = "Interval between heartbeats while connected"
    )]
    pub heartbeat_secs: u64,

    #[arg(long, help = "Ask the server to rerun the script once connected")]
    pub rerun: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    /// Overlays command line values on a configuration loaded from the
    /// environment.
    pub fn apply(&self, config: &mut ClientConfig) -> Result<(), ConfigError> {
        if !self.servers.is_empty() {
            config.servers = parse_servers(&self.servers.join(","))?;
        }
        if let Some(token) = &self.host_token {
            config.host_token = Some(token.clone());
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(count) = self.retry_warning {
            config.retry_warning_threshold = count;
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TIDELINE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TIDELINE_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
