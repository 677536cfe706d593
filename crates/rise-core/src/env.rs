//! Process environment handling.
//!
//! Every Rise service resolves its runtime environment from `RISE_ENV`
//! and derives its default log level from it. `RISE_LOG_LEVEL` overrides
//! the default when it parses as a valid `tracing` filter directive.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Default sender address for outgoing mail when `MAILER_EMAIL` is unset.
pub const DEFAULT_MAILER_EMAIL: &str = "Rise.sh <support@rise.sh>";

/// The runtime environment a Rise process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiseEnv {
    /// Local development (the default).
    #[default]
    Development,
    /// Test runs; logging is silenced.
    Test,
    /// Production.
    Production,
}

impl RiseEnv {
    /// Resolve the environment from `RISE_ENV`, defaulting to
    /// development when unset or unrecognised.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("RISE_ENV")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Environment name as used in `RISE_ENV`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    /// Default log filter directive for this environment.
    #[must_use]
    pub const fn default_log_directive(&self) -> &'static str {
        match self {
            Self::Production => "info",
            Self::Test => "off",
            Self::Development => "debug",
        }
    }
}

impl fmt::Display for RiseEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiseEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" => Ok(Self::Production),
            _ => Err(format!("unknown environment: {s}")),
        }
    }
}

/// The configured mailer sender address.
///
/// Reads `MAILER_EMAIL`, falling back to [`DEFAULT_MAILER_EMAIL`].
#[must_use]
pub fn mailer_email() -> String {
    match std::env::var("MAILER_EMAIL") {
        Ok(v) if !v.is_empty() => v,
        _ => DEFAULT_MAILER_EMAIL.to_owned(),
    }
}

/// Build the log filter for the current process.
///
/// `RISE_LOG_LEVEL` wins when it parses; otherwise the per-environment
/// default applies (production → info, test → off, development → debug).
#[must_use]
pub fn log_filter(env: RiseEnv) -> EnvFilter {
    match std::env::var("RISE_LOG_LEVEL") {
        Ok(level) if !level.is_empty() => EnvFilter::try_new(&level)
            .unwrap_or_else(|_| EnvFilter::new(env.default_log_directive())),
        _ => EnvFilter::new(env.default_log_directive()),
    }
}

/// Initialise tracing for a Rise binary.
pub fn init_tracing() {
    let env = RiseEnv::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env))
        .init();
}
