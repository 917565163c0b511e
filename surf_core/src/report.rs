use crate::input::GeneratedInput;
use crate::property::PropertyVerdict;
use crate::runner::TrialRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::time::Duration;

/// The first input that produced a given failure reason, plus how often the
/// reason recurred in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureExample {
    pub reason: String,
    pub trial: u64,
    pub input: GeneratedInput,
    pub fingerprint: String,
    pub outcome: String,
    pub occurrences: u64,
}

/// Outcome of one property batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyReport {
    pub property: String,
    pub seed: u64,
    pub planned_trials: u64,
    pub trials: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Fewer trials ran than planned, because of the deadline or fail-fast.
    pub stopped_early: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One entry per distinct failure reason, in first-seen order.
    pub failures: Vec<FailureExample>,
    pub skip_reasons: BTreeMap<String, u64>,
}

impl PropertyReport {
    pub fn from_records(
        property: &str,
        seed: u64,
        planned_trials: u64,
        records: &[TrialRecord],
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut failures: Vec<FailureExample> = Vec::new();
        let mut known_reasons: HashMap<String, usize> = HashMap::new();
        let mut skip_reasons = BTreeMap::new();

        for record in records {
            match &record.verdict {
                PropertyVerdict::Pass => passed += 1,
                PropertyVerdict::Skipped { reason } => {
                    skipped += 1;
                    *skip_reasons.entry(reason.clone()).or_insert(0) += 1;
                }
                PropertyVerdict::Fail { reason, input } => {
                    failed += 1;
                    match known_reasons.get(reason) {
                        Some(&slot) => failures[slot].occurrences += 1,
                        None => {
                            known_reasons.insert(reason.clone(), failures.len());
                            failures.push(FailureExample {
                                reason: reason.clone(),
                                trial: record.index,
                                input: input.clone(),
                                fingerprint: input.fingerprint(),
                                outcome: record.outcome.to_string(),
                                occurrences: 1,
                            });
                        }
                    }
                }
            }
        }

        let trials = records.len() as u64;
        Self {
            property: property.to_string(),
            seed,
            planned_trials,
            trials,
            passed,
            failed,
            skipped,
            stopped_early: trials < planned_trials,
            started_at,
            duration_ms: duration.as_millis() as u64,
            failures,
            skip_reasons,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Everything one invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub target: String,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<PropertyReport>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(PropertyReport::has_failures)
    }

    pub fn total_trials(&self) -> u64 {
        self.reports.iter().map(|r| r.trials).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.reports.iter().map(|r| r.failed).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "surf run against {} (seed {})", self.target, self.seed);
        for report in &self.reports {
            let _ = writeln!(
                out,
                "\n{}: {} trials, {} passed, {} failed, {} skipped{} [{} ms]",
                report.property,
                report.trials,
                report.passed,
                report.failed,
                report.skipped,
                if report.stopped_early {
                    format!(" (stopped early, {} planned)", report.planned_trials)
                } else {
                    String::new()
                },
                report.duration_ms,
            );
            for failure in &report.failures {
                let _ = writeln!(
                    out,
                    "  FAIL {} (x{})\n       trial {}: {}\n       outcome: {}",
                    failure.reason, failure.occurrences, failure.trial, failure.input, failure.outcome
                );
            }
            for (reason, count) in &report.skip_reasons {
                let _ = writeln!(out, "  skip {reason} (x{count})");
            }
        }
        let _ = writeln!(
            out,
            "\nTOTAL: {} properties, {} trials, {} failed",
            self.reports.len(),
            self.total_trials(),
            self.total_failed()
        );
        if self.has_failures() {
            let _ = writeln!(
                out,
                "Replay a failure with: --seed {} --replay <trial>",
                self.seed
            );
        }
        out
    }
}
