use std::env;
use std::io::IsTerminal;

use serde::{Deserialize, Serialize};
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

/// Crates of this workspace, enabled at maximum verbosity by default.
const CRATE_NAMES: &[&str] = &[
    "ferry_log",
    "ferry_model",
    "ferry_queue",
    "ferry_relabel",
    "ferry_statsd",
];

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise
    /// [`LogFormat::Simplified`].
    Auto,

    /// Compact printing with colors, for interactive use.
    Pretty,

    /// Plain text output with timestamps, for log files.
    Simplified,

    /// One JSON object per line, for log collectors.
    Json,
}

mod level_serde {
    use std::fmt;

    use serde::de::{Error, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(level)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de> Visitor<'de> for V {
            type Value = Level;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a log level")
            }

            fn visit_str<E>(self, value: &str) -> Result<Level, E>
            where
                E: Error,
            {
                value
                    .parse()
                    .map_err(|_| Error::invalid_value(Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(V)
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for the workspace crates.
    #[serde(with = "level_serde")]
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based
    /// on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE`
    /// variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Configures the given log level for all workspace crates.
fn default_filters(level: Level) -> EnvFilter {
    let mut env_filter = EnvFilter::new("WARN");
    for name in CRATE_NAMES {
        env_filter = env_filter.add_directive(format!("{name}={level}").parse().unwrap());
    }
    env_filter
}

/// Initializes the logging system.
///
/// # Example
///
/// ```
/// let config = ferry_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// ferry_log::init(&config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "full");
    }

    let subscriber = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let format = match (config.format, std::io::stderr().is_terminal()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            subscriber.compact().without_time().boxed()
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            subscriber.with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => subscriber
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(config.level)))
        .with(match env::var(EnvFilter::DEFAULT_ENV) {
            Ok(value) => EnvFilter::new(value),
            Err(_) => default_filters(config.level),
        })
        .init();
}

/// Initializes the logger for tests.
///
/// This logs to the output registered by the Rust test runner and only
/// captures logs from the workspace crates. Repeated calls are no-ops, so
/// every test may call it.
pub fn init_test() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filters(Level::TRACE))
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
