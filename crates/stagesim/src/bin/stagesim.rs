//! stagesim command-line runner.
//!
//! ```bash
//! # Run the built-in default scenario
//! stagesim
//!
//! # Run a scenario file with a different seed, JSON output
//! stagesim --config scenarios/cache-breaker.toml --seed 7 --json --pretty
//! ```

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stagesim::config::ConfigLoader;
use stagesim::{
    Driver, DriverConfig, JsonSink, Pipeline, ReportSink, SimRng, TracingSink, VirtualClock,
};

/// Simulate a resilience pipeline in virtual time.
#[derive(Parser)]
#[command(name = "stagesim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the scenario seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the arrival rate (events per 1000 ticks).
    #[arg(long)]
    rate: Option<f64>,

    /// Override the number of events.
    #[arg(long)]
    events: Option<u64>,

    /// Write the report as JSON to stdout instead of logging it.
    #[arg(long)]
    json: bool,

    /// Pretty-print JSON output.
    #[arg(long, requires = "json")]
    pretty: bool,

    /// Include per-event records in JSON output.
    #[arg(long, requires = "json")]
    events_detail: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(io::stderr)
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut scenario = loader.load().context("Failed to load scenario")?;
    if let Some(seed) = cli.seed {
        scenario.simulation.seed = seed;
    }
    if let Some(rate) = cli.rate {
        scenario.simulation.events_per_1000_ticks = rate;
    }
    if let Some(events) = cli.events {
        scenario.simulation.total_events = events;
    }

    let mut vclock = VirtualClock::new();
    let mut rng = SimRng::new(scenario.simulation.seed);
    let pipeline = Pipeline::from_config(&vclock.clock(), &scenario, &mut rng)
        .context("Failed to build pipeline")?;
    let samples = scenario
        .simulation
        .cache_sample_period
        .map(|period| pipeline.sample_caches(period));

    let driver_config = DriverConfig::from_simulation(&scenario.simulation)
        .context("Invalid keyspace distribution")?;
    let mut driver = Driver::new(driver_config);
    let report = driver
        .run(
            &mut vclock,
            pipeline.top(),
            scenario.simulation.events_per_1000_ticks,
            scenario.simulation.total_events,
        )
        .context("Simulation failed")?;

    let stats = pipeline.stage_stats();
    if cli.json {
        let mut sink = JsonSink::new(io::stdout().lock())
            .pretty(cli.pretty)
            .include_events(cli.events_detail);
        sink.write_report(&report)?;
        sink.write_stage_stats(&stats)?;
    } else {
        let mut sink = TracingSink;
        sink.write_report(&report)?;
        sink.write_stage_stats(&stats)?;
    }

    if let Some(samples) = samples {
        for sample in samples.borrow().iter() {
            tracing::info!(
                tick = sample.tick,
                stage = %sample.stage,
                live_keys = sample.live_keys,
                average_age = format_args!("{:.1}", sample.average_age),
                "cache sample"
            );
        }
    }

    Ok(())
}
