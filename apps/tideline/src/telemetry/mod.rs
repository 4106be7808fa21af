fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

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
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
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

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (env_filter, throttled_deps) = build_env_filter(config.level);

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
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled_deps {
            tracing::info!(
                "suppressing dependency trace noise; set TIDELINE_TRACE_DEPS=1 or TIDELINE_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LogLevel) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var("TIDELINE_LOG_FILTER") {
            return (EnvFilter::new(filter), false);
        }
        let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
        (EnvFilter::new(filter), throttled)
    }

    const TRACE_DEP_TARGETS: &[&str] = &[
        "hyper",
        "hyper_util",
        "tokio_tungstenite",
        "tungstenite",
        "reqwest",
        "rustls",
        "native_tls",
        "mio",
        "h2",
    ];

    const OWN_TARGETS: &[&str] = &["tideline_client_core", "tideline", "scene_tree"];

    /// Quiet levels apply globally. Debug and trace open up this
    /// workspace's crates and keep everything else at info.
    fn default_filter_for(level: LogLevel, allow_deps: bool) -> (String, bool) {
        let base = match level {
            LogLevel::Debug | LogLevel::Trace => {
                let mut filter = String::from("info");
                for target in OWN_TARGETS {
                    filter.push_str(&format!(",{target}={}", level.as_str()));
                }
                filter
            }
            quiet => quiet.as_str().to_owned(),
        };
        if level == LogLevel::Trace && !allow_deps {
            (throttle_dependency_traces(&base), true)
        } else {
            (base, false)
        }
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy("TIDELINE_TRACE_DEPS").unwrap_or(false)
    }

    fn throttle_dependency_traces(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }

    const MAX_DUMP: usize = 512;

    /// Offset / hex / ascii rendering of a frame, truncated after
    /// `MAX_DUMP` bytes.
    pub fn hexdump(bytes: &[u8]) -> String {
        use std::fmt::Write as _;
        const WIDTH: usize = 16;

        let shown = &bytes[..bytes.len().min(MAX_DUMP)];
        let mut out = String::new();
        for (i, chunk) in shown.chunks(WIDTH).enumerate() {
            let _ = write!(out, "{:08x}  ", i * WIDTH);
            for (j, byte) in chunk.iter().enumerate() {
                if j == WIDTH / 2 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x} ");
            }
            for _ in chunk.len()..WIDTH {
                out.push_str("   ");
            }
            out.push(' ');
            out.extend(chunk.iter().map(|&byte| {
                if (0x20..=0x7e).contains(&byte) {
                    byte as char
                } else {
                    '.'
                }
            }));
            out.push('\n');
        }
        if bytes.len() > shown.len() {
            let _ = writeln!(out, "... {} more bytes", bytes.len() - shown.len());
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_level_throttles_dependencies_unless_allowed() {
            let (filter, throttled) = default_filter_for(LogLevel::Trace, false);
            assert!(throttled);
            assert!(filter.starts_with("info,tideline_client_core=trace"));
            assert!(filter.contains("tungstenite=info"));

            let (filter, throttled) = default_filter_for(LogLevel::Trace, true);
            assert!(!throttled);
            assert!(!filter.contains("tungstenite=info"));
        }

        #[test]
        fn quiet_levels_use_plain_filters() {
            assert_eq!(default_filter_for(LogLevel::Warn, false), ("warn".to_string(), false));
            assert_eq!(LogLevel::default(), LogLevel::Warn);
            assert_eq!(
                default_filter_for(LogLevel::Debug, false),
                (
                    "info,tideline_client_core=debug,tideline=debug,scene_tree=debug".to_string(),
                    false
                )
            );
        }

        #[test]
        fn hexdump_renders_offsets_and_ascii() {
            let dump = hexdump(b"{\"hash\":\"h1\"}\x00");
            assert_eq!(dump.lines().count(), 1);
            assert!(dump.starts_with("00000000  7b 22 68 61"));
            assert!(dump.trim_end().ends_with("{\"hash\":\"h1\"}."));
        }

        #[test]
        fn hexdump_truncates_large_frames() {
            let dump = hexdump(&[0u8; MAX_DUMP + 10]);
            assert_eq!(dump.lines().count(), MAX_DUMP / 16 + 1);
            assert!(dump.ends_with("... 10 more bytes\n"));
        }
    }
}
