use anyhow::Context;
use clap::Parser;
use locksbench::benchmark::contend;
use locksbench::configuration;
use locksbench::counter::Variant;

/// Hammer every counter with concurrent writers and show how many increments
/// survived.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, help = "Number of writer threads", default_value_t = 4)]
    writers: usize,

    #[clap(
        short,
        long,
        help = "Increments performed by each writer",
        default_value_t = 100_000
    )]
    increments: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = configuration::setup_tracing("lost-updates".into())
        .context("Failed to set up tracing")?;

    let expected = cli.writers as u64 * cli.increments;
    for variant in Variant::ALL {
        let observed = contend(variant, cli.writers, cli.increments)?;
        let lost = expected as i64 - observed;
        tracing::debug!(%variant, observed, expected, lost, "Contention finished");
        println!("{variant}: {observed}/{expected} (lost {lost})");
    }
    Ok(())
}
