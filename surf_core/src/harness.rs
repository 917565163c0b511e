use crate::config::{ConfigError, RunConfig};
use crate::findings::{FindingsError, FindingsStore};
use crate::generator::GeneratorError;
use crate::http::HttpTransport;
use crate::property::{AutocompleteProperty, Property, RawBytesProperty, RouteProperty};
use crate::report::RunSummary;
use crate::runner::{FuzzRunner, RunnerError, RunnerSettings, TrialRecord};
use crate::socket::SocketTransport;
use crate::transport::{Target, Transport};
use chrono::Utc;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to build property generators: {0}")]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Findings(#[from] FindingsError),
    #[error("Unknown property '{name}' (expected one of: {known})")]
    UnknownProperty { name: String, known: String },
}

/// Builds every property in the order they run.
pub fn build_properties(config: &RunConfig) -> Result<Vec<Box<dyn Property>>, HarnessError> {
    let mut properties: Vec<Box<dyn Property>> = Vec::with_capacity(3);
    properties.push(Box::new(RouteProperty::new()?));
    properties.push(Box::new(
        AutocompleteProperty::new(&config.target.autocomplete_path)?
            .with_raw_query(config.target.raw_query),
    ));
    properties.push(Box::new(RawBytesProperty::new()?));
    Ok(properties)
}

/// A configured fuzzing session against one target.
pub struct Harness {
    config: RunConfig,
    seed: u64,
    transport: Box<dyn Transport>,
    properties: Vec<Box<dyn Property>>,
    findings: Option<FindingsStore>,
}

impl Harness {
    /// Validates `config` and connects the HTTP and raw-socket adapters to
    /// the configured target. No network I/O happens until `run`.
    pub fn new(config: RunConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let http = HttpTransport::new(
            &config.base_url(),
            config.request_timeout(),
            config.connect_timeout(),
            config.run.max_body_bytes,
        );
        let socket = SocketTransport::new(
            &config.target.host,
            config.target.port,
            config.connect_timeout(),
            config.socket_timeout(),
        );
        Self::with_transport(config, Box::new(Target::new(http, socket)))
    }

    pub fn with_transport(
        config: RunConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, HarnessError> {
        config.validate()?;
        let seed = config.run.seed.unwrap_or_else(rand::random);
        let properties = build_properties(&config)?;
        let findings = config
            .run
            .findings_dir
            .as_ref()
            .map(FindingsStore::open)
            .transpose()?;

        info!(
            target = %config.base_url(),
            seed,
            trials = config.run.trials,
            workers = config.run.workers,
            "Harness ready"
        );
        Ok(Self {
            config,
            seed,
            transport,
            properties,
            findings,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn properties(&self) -> &[Box<dyn Property>] {
        &self.properties
    }

    /// Restricts the session to the named properties. Run order stays fixed
    /// regardless of the order of `names`.
    pub fn select(&mut self, names: &[String]) -> Result<(), HarnessError> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.properties.iter().any(|p| p.name() == name.as_str()))
        {
            let known = self
                .properties
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(HarnessError::UnknownProperty {
                name: unknown.clone(),
                known,
            });
        }
        self.properties
            .retain(|p| names.iter().any(|name| name == p.name()));
        Ok(())
    }

    /// Runs every selected property in order against the target.
    ///
    /// The deadline is shared by all properties: once it passes, the
    /// remaining properties report zero trials. Distinct failures are written
    /// to the findings directory when one is configured.
    pub fn run(&self) -> Result<RunSummary, HarnessError> {
        let started_at = Utc::now();
        let deadline = self.config.deadline().map(|budget| Instant::now() + budget);
        let settings = RunnerSettings::from_config(&self.config, self.seed, deadline);
        let mut runner = FuzzRunner::new(self.transport.as_ref(), settings);

        let mut reports = Vec::with_capacity(self.properties.len());
        for property in &self.properties {
            let report = runner.run_property(property.as_ref())?;
            if let Some(store) = &self.findings {
                store.record_report(&report)?;
            }
            reports.push(report);
        }

        let summary = RunSummary {
            target: self.config.base_url(),
            seed: self.seed,
            started_at,
            finished_at: Utc::now(),
            reports,
        };
        info!(
            trials = summary.total_trials(),
            failed = summary.total_failed(),
            "Run finished"
        );
        Ok(summary)
    }

    /// Re-runs trial `index` of every selected property with the session seed.
    pub fn replay(&self, index: u64) -> Result<Vec<(&'static str, TrialRecord)>, HarnessError> {
        let settings = RunnerSettings::from_config(&self.config, self.seed, None);
        let runner = FuzzRunner::new(self.transport.as_ref(), settings);
        self.properties
            .iter()
            .map(|property| {
                let record = runner.run_trial(property.as_ref(), index)?;
                Ok((property.name(), record))
            })
            .collect()
    }
}
