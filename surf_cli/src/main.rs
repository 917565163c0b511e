use surf_core::config::RunConfig;
use surf_core::harness::Harness;
use surf_core::property::PropertyVerdict;
use surf_core::runner::TrialRecord;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "surf.toml";
const DEFAULT_LOG_FILTER: &str = "surf_core=info,surf_cli=info";
const EXIT_ERROR: u8 = 2;

/// How a completed run ended, before it becomes a process exit status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RunStatus {
    Clean,
    PropertyFailed,
}

impl RunStatus {
    fn code(self) -> u8 {
        match self {
            RunStatus::Clean => 0,
            RunStatus::PropertyFailed => 1,
        }
    }
}

/// 0 with no Fail, 1 when a property failed, 2 when the run itself errored.
fn exit_status(result: &Result<RunStatus, anyhow::Error>) -> u8 {
    match result {
        Ok(status) => status.code(),
        Err(_) => EXIT_ERROR,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Property-based fuzzing of a destination-search web service.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file. Defaults to ./surf.toml when present.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    #[clap(long)]
    host: Option<String>,
    #[clap(long)]
    port: Option<u16>,
    /// Base URL for HTTP properties, e.g. http://localhost:5001.
    #[clap(long)]
    base_url: Option<String>,
    /// Trials per property.
    #[clap(short, long)]
    trials: Option<u64>,
    /// Pause between consecutive trials.
    #[clap(long)]
    delay_ms: Option<u64>,
    /// Global time budget for the whole run.
    #[clap(long)]
    deadline_secs: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long)]
    workers: Option<usize>,
    /// Stop a property at its first failing trial.
    #[clap(long)]
    fail_fast: bool,
    /// Run only the named property. Repeatable.
    #[clap(long = "only", value_name = "PROPERTY")]
    only: Vec<String>,
    /// Write each distinct failure as JSON into this directory.
    #[clap(long)]
    findings_dir: Option<PathBuf>,
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
    /// Print the available properties and exit.
    #[clap(long)]
    list: bool,
    /// Re-run a single trial index of each selected property. Needs a seed
    /// from --seed or the config file.
    #[clap(long, value_name = "INDEX")]
    replay: Option<u64>,
    /// Send the autocomplete query value without percent-encoding.
    #[clap(long)]
    raw_query: bool,
}

fn load_config(cli: &Cli) -> Result<RunConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            RunConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                info!(path = %default_path.display(), "Loading default configuration");
                RunConfig::load_from_file(&default_path)?
            } else {
                RunConfig::default()
            }
        }
    };

    if let Some(host) = &cli.host {
        config.target.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.target.port = port;
    }
    if let Some(base_url) = &cli.base_url {
        config.target.base_url = Some(base_url.clone());
    }
    if let Some(trials) = cli.trials {
        config.run.trials = trials;
    }
    if let Some(delay_ms) = cli.delay_ms {
        config.run.delay_ms = delay_ms;
    }
    if let Some(deadline_secs) = cli.deadline_secs {
        config.run.deadline_secs = Some(deadline_secs);
    }
    if let Some(seed) = cli.seed {
        config.run.seed = Some(seed);
    }
    if let Some(workers) = cli.workers {
        config.run.workers = workers;
    }
    if cli.fail_fast {
        config.run.fail_fast = true;
    }
    if let Some(dir) = &cli.findings_dir {
        config.run.findings_dir = Some(dir.clone());
    }
    if cli.raw_query {
        config.target.raw_query = true;
    }
    Ok(config)
}

fn render_replay(
    records: &[(&'static str, TrialRecord)],
    seed: u64,
    format: OutputFormat,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Text => {
            let mut out = format!("replay with seed {seed}\n");
            for (property, record) in records {
                let reason = match &record.verdict {
                    PropertyVerdict::Fail { reason, .. } | PropertyVerdict::Skipped { reason } => {
                        format!(": {reason}")
                    }
                    PropertyVerdict::Pass => String::new(),
                };
                out.push_str(&format!(
                    "\n{property} trial {}\n  input: {}\n  outcome: {}\n  verdict: {}{reason}\n",
                    record.index,
                    record.input,
                    record.outcome,
                    record.verdict.label()
                ));
            }
            Ok(out)
        }
        OutputFormat::Json => {
            let entries: Vec<_> = records
                .iter()
                .map(|(property, record)| {
                    serde_json::json!({
                        "property": property,
                        "trial": record.index,
                        "input": record.input,
                        "fingerprint": record.input.fingerprint(),
                        "outcome": record.outcome.to_string(),
                        "verdict": record.verdict.label(),
                        "elapsed_ms": record.elapsed.as_millis() as u64,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&serde_json::json!({ "seed": seed, "replay": entries }))
        }
    }
}

fn run(cli: Cli) -> Result<RunStatus, anyhow::Error> {
    let config = load_config(&cli)?;
    if cli.replay.is_some() && config.run.seed.is_none() {
        anyhow::bail!("--replay needs a seed from --seed or [run] seed in the config file");
    }
    let mut harness = Harness::new(config)?;
    harness.select(&cli.only)?;

    if cli.list {
        for property in harness.properties() {
            println!("{:<22} {}", property.name(), property.description());
        }
        return Ok(RunStatus::Clean);
    }

    if let Some(index) = cli.replay {
        let records = harness.replay(index)?;
        println!("{}", render_replay(&records, harness.seed(), cli.output)?);
        let failed = records.iter().any(|(_, record)| record.verdict.is_fail());
        return Ok(if failed {
            RunStatus::PropertyFailed
        } else {
            RunStatus::Clean
        });
    }

    let summary = harness.run()?;
    match cli.output {
        OutputFormat::Text => print!("{}", summary.render_text()),
        OutputFormat::Json => println!("{}", summary.to_json()?),
    }

    Ok(if summary.has_failures() {
        RunStatus::PropertyFailed
    } else {
        RunStatus::Clean
    })
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = run(cli);
    if let Err(e) = &result {
        error!(error = %e, "Run aborted");
        eprintln!("Error: {e:#}");
    }
    ExitCode::from(exit_status(&result))
}
