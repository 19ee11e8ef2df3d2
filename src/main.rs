use anyhow::Context;
use clap::builder::RangedU64ValueParser;
use clap::Parser;
use locksbench::benchmark;
use locksbench::configuration::{
    self, Limit, RunConfiguration, Settings, READERS, ROUNDS, TARGET, WRITERS,
};
use locksbench::counter::Variant;
use locksbench::report::{self, ConsoleProgress};
use std::io;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(
        short,
        long,
        help = "The number of reader threads, MUST be between [1, 1000000], default is 1",
        value_parser = count(READERS)
    )]
    readers: Option<usize>,

    #[clap(
        short,
        long,
        help = "The number of writer threads, MUST be between [1, 1000000], default is 1",
        value_parser = count(WRITERS)
    )]
    writers: Option<usize>,

    #[clap(
        short = 'R',
        long,
        help = "The rounds of testing, MUST be between [5, 1000000], default is 5",
        value_parser = count(ROUNDS)
    )]
    rounds: Option<usize>,

    #[clap(
        short,
        long,
        help = "The target value, MUST be between [10000, 100000000000000], default is 1000000",
        value_parser = clap::value_parser!(i64).range(TARGET.min..=TARGET.max)
    )]
    target: Option<i64>,

    #[clap(
        short = 'c',
        long = "counter",
        help = "Only benchmark this counter (repeatable), e.g. AtomicLong"
    )]
    counters: Vec<Variant>,

    #[clap(long, help = "Also print the averages as JSON", default_value_t = false)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> Settings {
        Settings {
            readers: self.readers,
            writers: self.writers,
            rounds: self.rounds,
            target: self.target,
        }
    }

    fn variants(&self) -> Vec<Variant> {
        if self.counters.is_empty() {
            Variant::ALL.to_vec()
        } else {
            self.counters.clone()
        }
    }
}

fn count(limit: Limit<usize>) -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(limit.min as u64..=limit.max as u64)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = configuration::setup_tracing("locksbench".into())
        .context("Failed to set up tracing")?;

    let settings = configuration::get_configuration().context("Failed to read settings")?;
    let config = RunConfiguration::try_from(settings.overridden_by(cli.overrides()))
        .context("Invalid run configuration")?;
    tracing::info!(%config, json = cli.json, "Starting sweep");

    println!("{}", report::host_info());
    println!("{config}");

    let mut console = ConsoleProgress::new(io::stdout());
    let result = benchmark::sweep(&cli.variants(), &config, &mut console)?;

    println!("{}", report::ranking_line(&result));
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result.milliseconds())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "locksbench", "-r", "5", "-w", "5", "-R", "20", "-t", "100000",
        ])
        .unwrap();
        let config = RunConfiguration::try_from(cli.overrides()).unwrap();
        assert_eq!(config.readers(), 5);
        assert_eq!(config.writers(), 5);
        assert_eq!(config.rounds(), 20);
        assert_eq!(config.target(), 100_000);
        assert_eq!(cli.variants(), Variant::ALL.to_vec());
    }

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::try_parse_from(["locksbench"]).unwrap();
        assert_eq!(cli.overrides(), Settings::default());
        assert_eq!(
            RunConfiguration::try_from(cli.overrides()).unwrap(),
            RunConfiguration::default()
        );
    }

    #[test]
    fn test_settings_target_needs_same_floor_as_flag() {
        let file = Settings {
            target: Some(1),
            ..Settings::default()
        };

        let cli = Cli::try_parse_from(["locksbench"]).unwrap();
        assert!(RunConfiguration::try_from(file.clone().overridden_by(cli.overrides())).is_err());

        let cli = Cli::try_parse_from(["locksbench", "-t", "20000"]).unwrap();
        let config = RunConfiguration::try_from(file.overridden_by(cli.overrides())).unwrap();
        assert_eq!(config.target(), 20_000);
    }

    #[test]
    fn test_help_requested() {
        let err = Cli::try_parse_from(["locksbench", "-h"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let err = Cli::try_parse_from(["locksbench", "-s"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for args in [
            ["locksbench", "-R", "4"],
            ["locksbench", "-r", "0"],
            ["locksbench", "-t", "9999"],
            ["locksbench", "-w", "many"],
        ] {
            assert!(Cli::try_parse_from(args).is_err(), "{args:?}");
        }
    }

    #[test]
    fn test_counter_filter() {
        let cli =
            Cli::try_parse_from(["locksbench", "-c", "atomiclong", "--counter", "RWLock"]).unwrap();
        assert_eq!(cli.variants(), vec![Variant::AtomicLong, Variant::RWLock]);
        assert!(Cli::try_parse_from(["locksbench", "-c", "Semaphore"]).is_err());
    }
}
