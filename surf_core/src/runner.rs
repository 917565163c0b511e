use crate::config::RunConfig;
use crate::generator::{GeneratorError, trial_rng};
use crate::input::GeneratedInput;
use crate::property::{Property, PropertyVerdict};
use crate::report::PropertyReport;
use crate::transport::{Transport, TransportOutcome};
use chrono::Utc;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that stop a property batch. Target misbehaviour never ends up here.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Generator fault in property '{property}' at trial {trial}: {source}")]
    GeneratorFault {
        property: String,
        trial: u64,
        #[source]
        source: GeneratorError,
    },
    #[error("A worker thread for property '{property}' panicked")]
    WorkerPanicked { property: String },
}

/// Lifecycle of one property batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running { trial_index: u64 },
    Completed,
    Aborted,
}

/// One generate → deliver → check cycle.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub index: u64,
    pub input: GeneratedInput,
    pub outcome: TransportOutcome,
    pub verdict: PropertyVerdict,
    pub elapsed: Duration,
}

/// The subset of `RunConfig` the runner needs, with the seed and the global
/// deadline already resolved.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub trials: u64,
    pub delay: Duration,
    pub workers: usize,
    pub fail_fast: bool,
    pub seed: u64,
    pub deadline: Option<Instant>,
}

impl RunnerSettings {
    pub fn from_config(config: &RunConfig, seed: u64, deadline: Option<Instant>) -> Self {
        Self {
            trials: config.run.trials,
            delay: config.delay(),
            workers: config.run.workers.max(1),
            fail_fast: config.run.fail_fast,
            seed,
            deadline,
        }
    }
}

/// Everything a trial loop reads. Shared by reference between workers.
struct TrialContext<'a> {
    transport: &'a dyn Transport,
    settings: RunnerSettings,
}

impl TrialContext<'_> {
    fn deadline_passed(&self) -> bool {
        self.settings
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleeps for the inter-trial delay, cut short by the global deadline.
    fn pace(&self) {
        let mut pause = self.settings.delay;
        if let Some(deadline) = self.settings.deadline {
            pause = pause.min(deadline.saturating_duration_since(Instant::now()));
        }
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    fn run_trial(&self, property: &dyn Property, index: u64) -> Result<TrialRecord, RunnerError> {
        let fault = |source| RunnerError::GeneratorFault {
            property: property.name().to_string(),
            trial: index,
            source,
        };

        let mut rng = trial_rng(self.settings.seed, index);
        let input = property.generator().generate(&mut rng).map_err(fault)?;
        let request = property.request(&input).map_err(fault)?;

        debug!(property = property.name(), trial = index, %request, "Sending");
        let started = Instant::now();
        let outcome = self.transport.deliver(&request);
        let elapsed = started.elapsed();
        let verdict = property.check(&input, &outcome);

        match &verdict {
            PropertyVerdict::Fail { reason, input } => warn!(
                property = property.name(),
                trial = index,
                %reason,
                %input,
                %outcome,
                "Property violated"
            ),
            verdict => debug!(
                property = property.name(),
                trial = index,
                %outcome,
                verdict = verdict.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Trial finished"
            ),
        }

        Ok(TrialRecord {
            index,
            input,
            outcome,
            verdict,
            elapsed,
        })
    }

    /// Runs the trials in `range` in order, pacing between them.
    ///
    /// Stops without error when the deadline passes or `stop` is raised.
    fn drive(
        &self,
        property: &dyn Property,
        range: Range<u64>,
        stop: &AtomicBool,
        mut on_trial_start: impl FnMut(u64),
    ) -> Result<Vec<TrialRecord>, RunnerError> {
        let mut records = Vec::new();
        for index in range.clone() {
            if index != range.start {
                self.pace();
            }
            if stop.load(Ordering::Relaxed) || self.deadline_passed() {
                break;
            }

            on_trial_start(index);
            let record = match self.run_trial(property, index) {
                Ok(record) => record,
                Err(e) => {
                    stop.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let failed = record.verdict.is_fail();
            records.push(record);
            if failed && self.settings.fail_fast {
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }
        Ok(records)
    }
}

/// Splits `0..trials` into at most `workers` contiguous, non-empty ranges.
fn partition(trials: u64, workers: usize) -> Vec<Range<u64>> {
    let workers = (workers.max(1) as u64).min(trials.max(1));
    let chunk = trials.div_ceil(workers);
    (0..workers)
        .map(|w| {
            let start = w.saturating_mul(chunk).min(trials);
            let end = (w + 1).saturating_mul(chunk).min(trials);
            start..end
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// Drives property batches against one transport.
pub struct FuzzRunner<'a> {
    context: TrialContext<'a>,
    state: RunnerState,
}

impl<'a> FuzzRunner<'a> {
    pub fn new(transport: &'a dyn Transport, settings: RunnerSettings) -> Self {
        Self {
            context: TrialContext {
                transport,
                settings,
            },
            state: RunnerState::Idle,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.context.settings
    }

    /// Runs a single trial in isolation, without pacing. Used to replay a
    /// reported failure from its seed and index.
    pub fn run_trial(&self, property: &dyn Property, index: u64) -> Result<TrialRecord, RunnerError> {
        self.context.run_trial(property, index)
    }

    /// Runs the configured number of trials for `property` and summarizes them.
    ///
    /// Fail verdicts never stop the batch unless `fail_fast` is set. A
    /// generator fault aborts the batch and is returned as an error.
    pub fn run_property(&mut self, property: &dyn Property) -> Result<PropertyReport, RunnerError> {
        let settings = self.context.settings;
        info!(
            property = property.name(),
            trials = settings.trials,
            workers = settings.workers,
            seed = settings.seed,
            "Starting property"
        );

        self.state = RunnerState::Running { trial_index: 0 };
        let started_at = Utc::now();
        let started = Instant::now();
        let stop = AtomicBool::new(false);

        let result = if settings.workers <= 1 {
            let state = &mut self.state;
            self.context.drive(property, 0..settings.trials, &stop, |index| {
                *state = RunnerState::Running { trial_index: index };
            })
        } else {
            self.drive_parallel(property, &stop)
        };

        match result {
            Ok(records) => {
                self.state = RunnerState::Completed;
                let report = PropertyReport::from_records(
                    property.name(),
                    settings.seed,
                    settings.trials,
                    &records,
                    started_at,
                    started.elapsed(),
                );
                info!(
                    property = property.name(),
                    trials = report.trials,
                    passed = report.passed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Property finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.state = RunnerState::Aborted;
                error!(property = property.name(), error = %e, "Property aborted");
                Err(e)
            }
        }
    }

    fn drive_parallel(
        &self,
        property: &dyn Property,
        stop: &AtomicBool,
    ) -> Result<Vec<TrialRecord>, RunnerError> {
        let settings = self.context.settings;
        let ranges = partition(settings.trials, settings.workers);
        let context = &self.context;

        let results: Vec<Result<Vec<TrialRecord>, RunnerError>> = thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .into_iter()
                .map(|range| scope.spawn(move || context.drive(property, range, stop, |_| {})))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(RunnerError::WorkerPanicked {
                            property: property.name().to_string(),
                        })
                    })
                })
                .collect()
        });

        let mut records = Vec::new();
        for result in results {
            records.extend(result?);
        }
        records.sort_by_key(|record| record.index);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{Generator, IntegerGenerator};
    use crate::transport::Request;
    use rand_core::RngCore;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    /// Answers with a status derived from the request path.
    struct ScriptedTransport {
        calls: AtomicU64,
        status_for: fn(&str) -> u16,
    }

    impl ScriptedTransport {
        fn new(status_for: fn(&str) -> u16) -> Self {
            Self {
                calls: AtomicU64::new(0),
                status_for,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn deliver(&self, request: &Request) -> TransportOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request {
                Request::Http { path, .. } => TransportOutcome::Responded {
                    status: (self.status_for)(path),
                    headers: BTreeMap::new(),
                    body: Vec::new(),
                    truncated: false,
                },
                Request::Raw(_) => TransportOutcome::ConnectionRefused,
            }
        }
    }

    /// Fails for odd numbers, passes for even ones.
    #[derive(Debug)]
    struct ParityProperty {
        generator: IntegerGenerator,
    }

    impl ParityProperty {
        fn new() -> Self {
            Self {
                generator: IntegerGenerator::new(0, 1_000_000).unwrap(),
            }
        }
    }

    impl Property for ParityProperty {
        fn name(&self) -> &'static str {
            "parity"
        }
        fn description(&self) -> &'static str {
            "even paths answer 200"
        }
        fn generator(&self) -> &dyn Generator {
            &self.generator
        }
        fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError> {
            Ok(Request::Http {
                method: crate::transport::HttpMethod::Get,
                path: format!("/{}", input.as_integer().unwrap_or_default()),
                query: Vec::new(),
            })
        }
        fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict {
            match outcome.status() {
                Some(200) => PropertyVerdict::Pass,
                Some(status) => PropertyVerdict::Fail {
                    reason: format!("status {status}"),
                    input: input.clone(),
                },
                None => PropertyVerdict::Skipped {
                    reason: "no response".to_string(),
                },
            }
        }
    }

    fn odd_is_500(path: &str) -> u16 {
        let n: u64 = path.trim_start_matches('/').parse().unwrap_or(0);
        if n % 2 == 1 { 500 } else { 200 }
    }

    #[derive(Debug)]
    struct BrokenGenerator;

    impl Generator for BrokenGenerator {
        fn generate(&self, _rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
            Err(GeneratorError::InvalidDomain("broken on purpose".to_string()))
        }
    }

    #[derive(Debug)]
    struct BrokenProperty;

    impl Property for BrokenProperty {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn description(&self) -> &'static str {
            "always faults"
        }
        fn generator(&self) -> &dyn Generator {
            &BrokenGenerator
        }
        fn request(&self, _input: &GeneratedInput) -> Result<Request, GeneratorError> {
            unreachable!("generator never succeeds")
        }
        fn check(&self, _input: &GeneratedInput, _outcome: &TransportOutcome) -> PropertyVerdict {
            PropertyVerdict::Pass
        }
    }

    /// Parity property whose first request build faults.
    #[derive(Debug)]
    struct FaultOnceProperty {
        inner: ParityProperty,
        faulted: AtomicBool,
    }

    impl Property for FaultOnceProperty {
        fn name(&self) -> &'static str {
            "fault-once"
        }
        fn description(&self) -> &'static str {
            "faults on its first request"
        }
        fn generator(&self) -> &dyn Generator {
            self.inner.generator()
        }
        fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError> {
            if !self.faulted.swap(true, Ordering::SeqCst) {
                return Err(GeneratorError::InvalidDomain("first call".to_string()));
            }
            self.inner.request(input)
        }
        fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict {
            self.inner.check(input, outcome)
        }
    }

    fn settings(trials: u64) -> RunnerSettings {
        RunnerSettings {
            trials,
            delay: Duration::ZERO,
            workers: 1,
            fail_fast: false,
            seed: 11,
            deadline: None,
        }
    }

    #[test]
    fn every_trial_produces_exactly_one_record() {
        let transport = ScriptedTransport::new(odd_is_500);
        let mut runner = FuzzRunner::new(&transport, settings(40));
        assert_eq!(runner.state(), RunnerState::Idle);

        let report = runner.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(runner.state(), RunnerState::Completed);
        assert_eq!(report.trials, 40);
        assert_eq!(report.passed + report.failed + report.skipped, 40);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 40);
        assert!(report.failed > 0, "seed 11 should produce odd values");
        assert!(!report.stopped_early);
    }

    #[test]
    fn failures_do_not_stop_the_batch_and_keep_an_example() {
        let transport = ScriptedTransport::new(|_| 500);
        let mut runner = FuzzRunner::new(&transport, settings(10));
        let report = runner.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(report.failed, 10);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, "status 500");
        assert_eq!(report.failures[0].occurrences, 10);
        assert_eq!(report.failures[0].trial, 0);
    }

    #[test]
    fn fail_fast_stops_after_first_failure() {
        let transport = ScriptedTransport::new(|_| 500);
        let mut run_settings = settings(10);
        run_settings.fail_fast = true;
        let mut runner = FuzzRunner::new(&transport, run_settings);
        let report = runner.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(report.trials, 1);
        assert!(report.stopped_early);
        assert_eq!(runner.state(), RunnerState::Completed);
    }

    #[test]
    fn generator_fault_aborts_the_batch() {
        let transport = ScriptedTransport::new(|_| 200);
        let mut runner = FuzzRunner::new(&transport, settings(5));
        let err = runner.run_property(&BrokenProperty).unwrap_err();
        assert!(matches!(err, RunnerError::GeneratorFault { trial: 0, .. }));
        assert_eq!(runner.state(), RunnerState::Aborted);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expired_deadline_starts_no_trials() {
        let transport = ScriptedTransport::new(|_| 200);
        let mut run_settings = settings(5);
        run_settings.deadline = Some(Instant::now());
        let mut runner = FuzzRunner::new(&transport, run_settings);
        let report = runner.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(report.trials, 0);
        assert!(report.stopped_early);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pacing_spaces_trials_out() {
        let transport = ScriptedTransport::new(|_| 200);
        let mut run_settings = settings(3);
        run_settings.delay = Duration::from_millis(30);
        let mut runner = FuzzRunner::new(&transport, run_settings);
        let started = Instant::now();
        runner.run_property(&ParityProperty::new()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn parallel_workers_match_sequential_inputs() {
        let transport = ScriptedTransport::new(odd_is_500);
        let mut sequential = FuzzRunner::new(&transport, settings(25));
        let seq_report = sequential.run_property(&ParityProperty::new()).unwrap();

        let mut parallel_settings = settings(25);
        parallel_settings.workers = 4;
        let mut parallel = FuzzRunner::new(&transport, parallel_settings);
        let par_report = parallel.run_property(&ParityProperty::new()).unwrap();

        assert_eq!(par_report.trials, 25);
        assert_eq!(par_report.passed, seq_report.passed);
        assert_eq!(par_report.failed, seq_report.failed);
        assert_eq!(par_report.failures, seq_report.failures);
    }

    #[test]
    fn replayed_trial_regenerates_the_same_input() {
        let transport = ScriptedTransport::new(odd_is_500);
        let runner = FuzzRunner::new(&transport, settings(1));
        let first = runner.run_trial(&ParityProperty::new(), 17).unwrap();
        let again = runner.run_trial(&ParityProperty::new(), 17).unwrap();
        assert_eq!(first.input, again.input);
        assert_eq!(first.verdict, again.verdict);
        assert_eq!(first.index, 17);
    }

    #[test]
    fn partition_covers_all_trials_without_overlap() {
        for (trials, workers) in [(10, 3), (3, 8), (100, 1), (7, 7), (0, 4)] {
            let ranges = partition(trials, workers);
            let covered: Vec<u64> = ranges.iter().flat_map(|r| r.clone()).collect();
            assert_eq!(covered, (0..trials).collect::<Vec<_>>(), "{trials}/{workers}");
            assert!(ranges.len() <= workers.max(1));
        }
    }

    #[test]
    fn records_are_collected_from_every_worker() {
        let seen = Mutex::new(Vec::new());
        let transport = ScriptedTransport::new(|_| 200);
        let context = TrialContext {
            transport: &transport,
            settings: settings(6),
        };
        let stop = AtomicBool::new(false);
        let records = context
            .drive(&ParityProperty::new(), 2..6, &stop, |i| seen.lock().unwrap().push(i))
            .unwrap();
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), [2, 3, 4, 5]);
        assert_eq!(*seen.lock().unwrap(), [2, 3, 4, 5]);
    }

    #[test]
    fn huge_trial_count_with_expired_deadline_is_not_preallocated() {
        let transport = ScriptedTransport::new(|_| 200);
        let mut run_settings = settings(u64::MAX);
        run_settings.deadline = Some(Instant::now());
        let mut runner = FuzzRunner::new(&transport, run_settings);
        let report = runner.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(report.trials, 0);
        assert!(report.stopped_early);

        run_settings.workers = 3;
        let mut parallel = FuzzRunner::new(&transport, run_settings);
        let report = parallel.run_property(&ParityProperty::new()).unwrap();
        assert_eq!(report.trials, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn partition_saturates_near_u64_max() {
        let ranges = partition(u64::MAX, 3);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[2].end, u64::MAX);
        assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn generator_fault_in_one_worker_stops_the_others() {
        let transport = ScriptedTransport::new(|_| 200);
        let mut run_settings = settings(40);
        run_settings.workers = 2;
        run_settings.delay = Duration::from_millis(20);
        let property = FaultOnceProperty {
            inner: ParityProperty::new(),
            faulted: AtomicBool::new(false),
        };
        let mut runner = FuzzRunner::new(&transport, run_settings);
        let err = runner.run_property(&property).unwrap_err();
        assert!(matches!(err, RunnerError::GeneratorFault { .. }));
        assert_eq!(runner.state(), RunnerState::Aborted);
        // The surviving worker sees the stop flag within a trial or two.
        assert!(
            transport.calls.load(Ordering::SeqCst) < 5,
            "calls after fault: {}",
            transport.calls.load(Ordering::SeqCst)
        );
    }
}
