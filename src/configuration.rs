use config::builder::DefaultState;
use config::{Config, ConfigBuilder};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{prelude::*, EnvFilter};

pub const SETTINGS_FILE: &str = "locksbench.yml";
pub const ENV_PREFIX: &str = "LOCKSBENCH";

//
// Limits
//

/// Accepted range and default for one run parameter.
#[derive(Debug, Clone, Copy)]
pub struct Limit<T> {
    pub min: T,
    pub max: T,
    pub default: T,
}

impl<T: PartialOrd + fmt::Display + Copy> Limit<T> {
    fn check(&self, field: &'static str, value: T) -> Result<T, ConfigError> {
        if value < self.min || value > self.max {
            Err(ConfigError::OutOfRange {
                field,
                value: value.to_string(),
                min: self.min.to_string(),
                max: self.max.to_string(),
            })
        } else {
            Ok(value)
        }
    }
}

pub const READERS: Limit<usize> = Limit {
    min: 1,
    max: 1_000_000,
    default: 1,
};

pub const WRITERS: Limit<usize> = Limit {
    min: 1,
    max: 1_000_000,
    default: 1,
};

pub const ROUNDS: Limit<usize> = Limit {
    min: 5,
    max: 1_000_000,
    default: 5,
};

/// Bounds for a target read from the command line, settings file or
/// environment. `RunConfiguration::new` only needs a positive target.
pub const TARGET: Limit<i64> = Limit {
    min: 10_000,
    max: 100_000_000_000_000,
    default: 1_000_000,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} MUST be between [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("could not load settings")]
    Settings(#[from] config::ConfigError),
}

//
// RunConfiguration
//

/// Parameters for one benchmark invocation. Validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfiguration {
    readers: usize,
    writers: usize,
    rounds: usize,
    target: i64,
}

impl RunConfiguration {
    pub fn new(
        readers: usize,
        writers: usize,
        rounds: usize,
        target: i64,
    ) -> Result<Self, ConfigError> {
        let target_limit = Limit {
            min: 1,
            ..TARGET
        };
        Ok(Self {
            readers: READERS.check("readers", readers)?,
            writers: WRITERS.check("writers", writers)?,
            rounds: ROUNDS.check("rounds", rounds)?,
            target: target_limit.check("target", target)?,
        })
    }

    pub fn readers(&self) -> usize {
        self.readers
    }

    pub fn writers(&self) -> usize {
        self.writers
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn total_threads(&self) -> usize {
        self.readers + self.writers
    }
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            readers: READERS.default,
            writers: WRITERS.default,
            rounds: ROUNDS.default,
            target: TARGET.default,
        }
    }
}

impl fmt::Display for RunConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reader threads: {}, writer threads: {}, rounds: {}, target value: {}",
            self.readers, self.writers, self.rounds, self.target
        )
    }
}

impl TryFrom<Settings> for RunConfiguration {
    type Error = ConfigError;

    fn try_from(settings: Settings) -> Result<Self, Self::Error> {
        let target = TARGET.check("target", settings.target.unwrap_or(TARGET.default))?;
        Self::new(
            settings.readers.unwrap_or(READERS.default),
            settings.writers.unwrap_or(WRITERS.default),
            settings.rounds.unwrap_or(ROUNDS.default),
            target,
        )
    }
}

//
// Settings
//

/// Run parameters from the settings file and environment. Anything left
/// unset falls back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub readers: Option<usize>,
    pub writers: Option<usize>,
    pub rounds: Option<usize>,
    pub target: Option<i64>,
}

impl Settings {
    /// Fill anything unset in `overrides` from `self`.
    pub fn overridden_by(self, overrides: Settings) -> Settings {
        Settings {
            readers: overrides.readers.or(self.readers),
            writers: overrides.writers.or(self.writers),
            rounds: overrides.rounds.or(self.rounds),
            target: overrides.target.or(self.target),
        }
    }
}

/// Load settings from `locksbench.yml` (if present) and `LOCKSBENCH_*`
/// environment variables, the latter taking precedence.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(config::File::new(SETTINGS_FILE, config::FileFormat::Yaml).required(false))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));
    settings_from(builder)
}

fn settings_from(builder: ConfigBuilder<DefaultState>) -> Result<Settings, ConfigError> {
    let settings = builder.build()?;
    Ok(settings.try_deserialize::<Settings>()?)
}

//
// Tracing
//

/// Install a bunyan-formatted subscriber writing to stderr.
///
/// Filtering follows `RUST_LOG` and defaults to `warn` so the logs stay out
/// of the way of the benchmark report on stdout. Keep the returned guard alive
/// until exit so buffered lines get flushed.
pub fn setup_tracing(name: String) -> Result<WorkerGuard, SetGlobalDefaultError> {
    let (non_blocking, guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stderr());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = BunyanFormattingLayer::new(name, non_blocking);
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(fmt_layer);

    set_global_default(subscriber)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = RunConfiguration::default();
        assert_eq!(config.readers(), 1);
        assert_eq!(config.writers(), 1);
        assert_eq!(config.rounds(), 5);
        assert_eq!(config.target(), 1_000_000);
        assert_eq!(config.total_threads(), 2);
        assert_eq!(
            config.to_string(),
            "Reader threads: 1, writer threads: 1, rounds: 5, target value: 1000000"
        );
    }

    #[test]
    fn test_too_few_rounds_rejected() {
        let err = RunConfiguration::new(1, 1, 4, 1000).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "rounds", .. }));
        assert_eq!(err.to_string(), "rounds MUST be between [5, 1000000], got 4");
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(RunConfiguration::new(0, 1, 5, 1000).is_err());
        assert!(RunConfiguration::new(1, 0, 5, 1000).is_err());
        assert!(RunConfiguration::new(1, 1, 5, 0).is_err());
    }

    #[test]
    fn test_small_target_allowed_for_library_callers() {
        let config = RunConfiguration::new(1, 1, 5, 1000).unwrap();
        assert_eq!(config.target(), 1000);
    }

    #[test]
    fn test_settings_target_below_floor_rejected() {
        let err = RunConfiguration::try_from(Settings {
            target: Some(1),
            ..Settings::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "target", .. }));
        assert_eq!(
            err.to_string(),
            "target MUST be between [10000, 100000000000000], got 1"
        );

        let config = RunConfiguration::try_from(Settings {
            target: Some(10_000),
            ..Settings::default()
        })
        .unwrap();
        assert_eq!(config.target(), 10_000);
    }

    #[test]
    fn test_settings_from_environment() {
        let builder = Config::builder().add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(Some(
                    [("LOCKSBENCH_TARGET".to_string(), "1".to_string())]
                        .into_iter()
                        .collect(),
                )),
        );
        let settings = settings_from(builder).unwrap();
        assert_eq!(settings.target, Some(1));
        assert!(RunConfiguration::try_from(settings).is_err());
    }

    #[test]
    fn test_settings_from_yaml() {
        let builder = Config::builder().add_source(config::File::from_str(
            "rounds: 10\ntarget: 50000\n",
            config::FileFormat::Yaml,
        ));
        let settings = settings_from(builder).unwrap();
        assert_eq!(
            settings,
            Settings {
                rounds: Some(10),
                target: Some(50_000),
                ..Settings::default()
            }
        );

        let config = RunConfiguration::try_from(settings).unwrap();
        assert_eq!(config.readers(), 1);
        assert_eq!(config.rounds(), 10);
        assert_eq!(config.target(), 50_000);
    }

    #[test]
    fn test_malformed_settings_rejected() {
        let builder = Config::builder().add_source(config::File::from_str(
            "rounds: lots\n",
            config::FileFormat::Yaml,
        ));
        assert!(matches!(settings_from(builder), Err(ConfigError::Settings(_))));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let file = Settings {
            readers: Some(4),
            rounds: Some(20),
            ..Settings::default()
        };
        let cli = Settings {
            rounds: Some(8),
            ..Settings::default()
        };
        let merged = file.overridden_by(cli);
        assert_eq!(merged.readers, Some(4));
        assert_eq!(merged.rounds, Some(8));
        assert_eq!(merged.writers, None);
    }

    proptest! {
        #[test]
        fn test_in_range_values_accepted(
            readers in 1usize..=1_000_000,
            writers in 1usize..=1_000_000,
            rounds in 5usize..=1_000_000,
            target in 1i64..=100_000_000_000_000,
        ) {
            let config = RunConfiguration::new(readers, writers, rounds, target).unwrap();
            prop_assert_eq!(config.total_threads(), readers + writers);
        }

        #[test]
        fn test_rounds_below_five_rejected(rounds in 0usize..5) {
            prop_assert!(RunConfiguration::new(1, 1, rounds, 1000).is_err());
        }
    }
}
