//! dialfit CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use df_prop::{FitConfig, Propagator};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dialfit")]
#[command(about = "dialfit - Deterministic event reweighting and likelihood propagation")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Propagate one parameter point and report the likelihood
    Eval {
        /// Input fit model (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Parameter override, repeatable (NAME=VALUE). Unset parameters
        /// stay at their priors.
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto). Use 1 for deterministic parity.
        #[arg(long, default_value = "1")]
        threads: usize,
    },

    /// Likelihood scan over one parameter
    Scan {
        /// Input fit model (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Parameter name to scan
        #[arg(long)]
        parameter: String,

        /// Scan start value
        #[arg(long)]
        start: f64,

        /// Scan stop value (inclusive)
        #[arg(long)]
        stop: f64,

        /// Number of scan points
        #[arg(long, default_value = "21")]
        points: usize,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto). Use 1 for deterministic parity.
        #[arg(long, default_value = "1")]
        threads: usize,
    },

    /// Numerical-accuracy self-test: replay thrown parameter vectors and
    /// require bit-identical likelihoods
    Accuracy {
        /// Input fit model (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Number of thrown parameter vectors
        #[arg(long, default_value = "10")]
        throws: usize,

        /// Replays per thrown vector
        #[arg(long, default_value = "3")]
        replays: usize,

        /// Seed for the throws
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Eval { input, set, output, threads } => {
            cmd_eval(&input, &set, output.as_ref(), threads)
        }
        Commands::Scan { input, parameter, start, stop, points, output, threads } => {
            cmd_scan(&input, &parameter, start, stop, points, output.as_ref(), threads)
        }
        Commands::Accuracy { input, throws, replays, seed, output, threads } => {
            cmd_accuracy(&input, throws, replays, seed, output.as_ref(), threads)
        }
    }
}

fn load_propagator(input: &PathBuf, threads: usize) -> Result<Propagator> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let mut config = FitConfig::from_json(&text).context("parsing fit model")?;
    config.n_workers = threads;
    Propagator::from_config(&config).context("building propagator")
}

fn parse_override(spec: &str) -> Result<(&str, f64)> {
    let Some((name, value)) = spec.split_once('=') else {
        bail!("bad parameter override '{spec}', expected NAME=VALUE");
    };
    let value: f64 = value
        .parse()
        .with_context(|| format!("bad value in parameter override '{spec}'"))?;
    Ok((name, value))
}

fn likelihood_json(propagator: &Propagator) -> Result<serde_json::Value> {
    let breakdown = propagator.breakdown()?;
    Ok(serde_json::json!({
        "stat": breakdown.stat,
        "penalty": breakdown.penalty,
        "total": breakdown.total(),
    }))
}

fn cmd_eval(
    input: &PathBuf,
    overrides: &[String],
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    let mut propagator = load_propagator(input, threads)?;
    for spec in overrides {
        let (name, value) = parse_override(spec)?;
        let index = propagator.parameter_index(name)?;
        propagator.set_parameter(index, value)?;
    }
    propagator.propagate()?;

    let parameters: Vec<serde_json::Value> = propagator
        .parameter_names()
        .iter()
        .enumerate()
        .map(|(index, name)| {
            serde_json::json!({
                "name": name,
                "value": propagator.bank().value(index),
                "prior": propagator.bank().prior(index),
            })
        })
        .collect();
    let samples: Vec<serde_json::Value> = propagator
        .samples()
        .iter()
        .map(|sample| {
            let n_bins = sample.mc.histogram.n_bins();
            serde_json::json!({
                "name": sample.name,
                "mc": (0..n_bins).map(|b| sample.mc.histogram.content(b)).collect::<Vec<_>>(),
                "mc_errors": (0..n_bins).map(|b| sample.mc.histogram.error(b)).collect::<Vec<_>>(),
                "data": (0..n_bins).map(|b| sample.data.histogram.content(b)).collect::<Vec<_>>(),
            })
        })
        .collect();

    let output_json = serde_json::json!({
        "likelihood": likelihood_json(&propagator)?,
        "parameters": parameters,
        "samples": samples,
    });
    write_json(output, output_json)
}

fn cmd_scan(
    input: &PathBuf,
    parameter: &str,
    start: f64,
    stop: f64,
    points: usize,
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    let mut propagator = load_propagator(input, threads)?;
    let index = propagator.parameter_index(parameter)?;
    let scan = propagator.scan_parameter(index, start, stop, points)?;

    let minimum = scan.minimum().map(|point| {
        serde_json::json!({"value": point.value, "total": point.total})
    });
    let output_json = serde_json::json!({
        "parameter": parameter,
        "points": scan.points,
        "minimum": minimum,
    });
    write_json(output, output_json)
}

fn cmd_accuracy(
    input: &PathBuf,
    throws: usize,
    replays: usize,
    seed: u64,
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    let mut propagator = load_propagator(input, threads)?;
    let result = propagator.check_numerical_accuracy(throws, replays, seed);
    let output_json = match &result {
        Ok(()) => serde_json::json!({
            "passed": true,
            "throws": throws,
            "replays": replays,
            "seed": seed,
            "workers": threads,
        }),
        Err(error) => serde_json::json!({
            "passed": false,
            "throws": throws,
            "replays": replays,
            "seed": seed,
            "workers": threads,
            "error": error.to_string(),
        }),
    };
    write_json(output, output_json)?;
    result.map_err(Into::into)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
