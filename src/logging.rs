//! Structured logging setup and the request-scoped [`Logger`].
//!
//! The process installs one `tracing` subscriber at startup with [`init`].
//! Per-request logging happens through a [`Logger`] that
//! [`request_logger`](crate::middleware::request_logger) attaches to every
//! request's context: a span carrying the method and URL, so events recorded
//! inside it are tagged with the request they belong to.
//!
//! ```rust,no_run
//! use toolkit::logging;
//!
//! let config = logging::Config::from_env().expect("bad log config");
//! logging::init(&config).expect("logger already installed");
//! ```

use std::io::IsTerminal;

use thiserror::Error;
use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::config::{self, ConfigError};
use crate::context::{Context, Key};

/// Context key for the request [`Logger`].
pub static LOGGER: Key<Logger> = Key::new("logger");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines, for terminals.
    Text,
    /// One JSON object per line, for log collectors.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// An `EnvFilter` directive such as `info` or `toolkit=debug,warn`.
    pub filter: String,
    pub format: Format,
}

impl Config {
    /// Reads `LOG_LEVEL` (default `info`) and `LOG_FORMAT` (`text` or `json`).
    ///
    /// Without `LOG_FORMAT`, text is used when stdin is a terminal and JSON
    /// otherwise.
    pub fn from_env() -> Result<Self, ConfigError> {
        let filter = config::var_or("LOG_LEVEL", "info");
        if let Err(e) = EnvFilter::try_new(&filter) {
            return Err(ConfigError::Invalid {
                var: "LOG_LEVEL",
                value: filter,
                reason: e.to_string(),
            });
        }

        let format = match config::var("LOG_FORMAT").as_deref() {
            None if std::io::stdin().is_terminal() => Format::Text,
            None => Format::Json,
            Some(v) if v.eq_ignore_ascii_case("text") => Format::Text,
            Some(v) if v.eq_ignore_ascii_case("json") => Format::Json,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    value: v.to_owned(),
                    reason: "expected `text` or `json`".to_owned(),
                });
            }
        };

        Ok(Self { filter, format })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { filter: "info".to_owned(), format: Format::Text }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install log subscriber: {0}")]
    Install(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &Config) -> Result<(), InitError> {
    let filter = EnvFilter::try_new(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true);

    match config.format {
        Format::Text => builder.try_init(),
        Format::Json => builder.json().try_init(),
    }
    .map_err(InitError::Install)
}

/// A request-scoped logger.
///
/// Record events under it with `tracing`'s `parent:` argument, or enter it
/// with [`Logger::in_scope`]:
///
/// ```rust
/// # use toolkit::logging::Logger;
/// let logger = Logger::new(tracing::info_span!("job", id = 7));
/// logger.in_scope(|| tracing::info!("started"));
/// tracing::warn!(parent: logger.span(), "slow");
/// ```
#[derive(Clone, Debug)]
pub struct Logger {
    span: Span,
}

impl Logger {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn in_scope<F: FnOnce() -> T, T>(&self, f: F) -> T {
        self.span.in_scope(f)
    }
}

/// Returns the request logger.
///
/// # Panics
///
/// Panics if no logger was attached; installing
/// [`request_logger`](crate::middleware::request_logger) is a precondition
/// of any code that calls this.
pub fn extract(ctx: &Context) -> &Logger {
    match ctx.value(LOGGER) {
        Some(logger) => logger,
        None => panic!("no logger in context"),
    }
}
