//! Convergence driver: the sequential control loop around the canopy passes.
//!
//! ```text
//! SEEDING → ITERATING(1) → … → ITERATING(k) → CONVERGED | EXHAUSTED → ASSIGNING → DONE
//! ```
//!
//! Pass `k + 1` only starts once pass `k` is committed: its output is encoded
//! into a snapshot, and the next pass decodes that snapshot as its input. A pass
//! that fails at the substrate level is resubmitted from the same snapshot.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::canopy::Canopy;
use crate::codec::{decode_canopy, encode_canopy};
use crate::config::CanopyConfig;
use crate::distance::DistanceMeasure;
use crate::pass::{decode_canopies, decode_points, CanopyPass, ClusterAssignment, PassInput, Point};
use crate::substrate::{LocalSubstrate, PassError, Substrate};
use crate::{CanopyError, Result};

/// Driver states, in the order a run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Seeding,
    Iterating(usize),
    Converged,
    Exhausted,
    Assigning,
    Done,
}

/// Why iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A pass reported no change.
    Converged,
    /// `max_iterations` passes ran without convergence.
    Exhausted,
}

/// Output of a complete run.
#[derive(Debug, Clone)]
pub struct ClusteringRun {
    /// Final canopy set, ascending by id.
    pub canopies: Vec<Canopy>,
    /// Nearest-canopy label per point; `None` when clustering is disabled.
    pub assignment: Option<ClusterAssignment>,
    /// Refinement passes executed.
    pub iterations: usize,
    pub termination: Termination,
    /// Every state the driver entered, in order.
    pub transitions: Vec<DriverState>,
    /// Final canopy set as encoded canopy records.
    pub snapshot: Vec<Bytes>,
}

/// Committed canopy set of one iteration in wire form.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    iteration: usize,
    records: Vec<Bytes>,
}

impl Snapshot {
    fn commit(iteration: usize, canopies: &[Canopy]) -> Self {
        Self {
            iteration,
            records: canopies.iter().map(encode_canopy).collect(),
        }
    }

    fn restore(&self) -> Result<Vec<Canopy>> {
        self.records.iter().map(|record| decode_canopy(record)).collect()
    }
}

enum Start {
    Points(Vec<Point>),
    Canopies(Vec<Canopy>),
}

/// Runs the seeding, refinement and assignment passes on a substrate.
pub struct ClusteringDriver<S = LocalSubstrate> {
    config: CanopyConfig,
    measure: Arc<dyn DistanceMeasure>,
    substrate: S,
}

impl ClusteringDriver<LocalSubstrate> {
    /// Validate `config` and build a driver on the in-process rayon substrate.
    pub fn new(config: CanopyConfig) -> Result<Self> {
        let substrate = LocalSubstrate::new(config.task_failure_threshold);
        Self::with_substrate(config, substrate)
    }
}

impl<S: Substrate> ClusteringDriver<S> {
    /// Validate `config` and build a driver on a custom substrate.
    pub fn with_substrate(config: CanopyConfig, substrate: S) -> Result<Self> {
        config.validate()?;
        let measure = config.measure.build();
        Ok(Self {
            config,
            measure,
            substrate,
        })
    }

    /// Replace the configured measure with a custom one.
    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }

    pub fn config(&self) -> &CanopyConfig {
        &self.config
    }

    /// Run over an encoded input stream: vector records, or canopy records when
    /// `input_already_canopies` is set.
    pub fn run_records(&self, records: &[Bytes]) -> Result<ClusteringRun> {
        if self.config.input_already_canopies {
            let canopies =
                self.attempt(0, "decode-canopies", || decode_canopies(&self.substrate, records))?;
            self.run_canopies(canopies)
        } else {
            let points =
                self.attempt(0, "decode-points", || decode_points(&self.substrate, records))?;
            self.run_points(points)
        }
    }

    /// Run starting from raw points.
    pub fn run_points(&self, points: Vec<Point>) -> Result<ClusteringRun> {
        if points.is_empty() {
            return Err(CanopyError::InvalidData("input contains no points".into()));
        }
        if let Some(point) = points.iter().find(|point| !point.vector.is_finite()) {
            return Err(CanopyError::InvalidData(format!(
                "point {} has non-finite components",
                point.id
            )));
        }
        self.drive(Start::Points(points))
    }

    /// Run starting from an existing canopy set. The configured radii replace
    /// whatever the canopies carried.
    pub fn run_canopies(&self, canopies: Vec<Canopy>) -> Result<ClusteringRun> {
        if canopies.is_empty() {
            return Err(CanopyError::InvalidData("input contains no canopies".into()));
        }
        let canopies = canopies
            .into_iter()
            .map(|canopy| {
                Canopy::restore(
                    canopy.id(),
                    canopy.centroid().clone(),
                    self.config.t1,
                    self.config.t2,
                    canopy.point_count(),
                    canopy.members().clone(),
                )
            })
            .collect();
        self.drive(Start::Canopies(canopies))
    }

    fn drive(&self, start: Start) -> Result<ClusteringRun> {
        let pass = CanopyPass::new(&self.substrate, self.measure.as_ref(), &self.config);
        let max_iterations = self.config.max_iterations;

        let mut transitions = Vec::new();
        let mut state = DriverState::Seeding;
        let mut current: Vec<Canopy> = Vec::new();
        let mut snapshot = Snapshot::default();
        let mut iterations = 0usize;
        let mut termination = Termination::Exhausted;
        let mut assignment = None;

        info!(
            t1 = self.config.t1,
            t2 = self.config.t2,
            delta = self.config.convergence_delta,
            max_iterations,
            measure = self.measure.name(),
            "starting canopy mean-shift run"
        );

        loop {
            transitions.push(state);
            debug!(?state, "driver state");
            state = match state {
                DriverState::Seeding => {
                    current = match &start {
                        Start::Points(points) => {
                            self.attempt(0, "seed", || pass.run(PassInput::Points(points)))?
                                .canopies
                        }
                        Start::Canopies(canopies) => canopies.clone(),
                    };
                    snapshot = Snapshot::commit(0, &current);
                    info!(canopies = current.len(), "seeding pass committed");
                    DriverState::Iterating(1)
                }
                DriverState::Iterating(k) => {
                    let input = snapshot.restore().map_err(|source| CanopyError::Aborted {
                        iteration: k,
                        source: Box::new(source),
                    })?;
                    debug!(iteration = k, from = snapshot.iteration, "restored snapshot");
                    let output =
                        self.attempt(k, "refine", || pass.run(PassInput::Canopies(&input)))?;
                    iterations = k;
                    info!(
                        iteration = k,
                        canopies = output.canopies.len(),
                        merged = output.merged,
                        dropped = output.dropped,
                        changed = output.any_changed,
                        "refinement pass committed"
                    );
                    current = output.canopies;
                    snapshot = Snapshot::commit(k, &current);
                    if !output.any_changed {
                        DriverState::Converged
                    } else if k >= max_iterations {
                        DriverState::Exhausted
                    } else {
                        DriverState::Iterating(k + 1)
                    }
                }
                DriverState::Converged | DriverState::Exhausted => {
                    termination = if state == DriverState::Converged {
                        Termination::Converged
                    } else {
                        Termination::Exhausted
                    };
                    info!(iterations, ?termination, canopies = current.len(), "iteration stopped");
                    if self.config.run_clustering {
                        DriverState::Assigning
                    } else {
                        DriverState::Done
                    }
                }
                DriverState::Assigning => {
                    let representatives = match &start {
                        Start::Points(points) => points.clone(),
                        Start::Canopies(canopies) => canopies
                            .iter()
                            .map(|canopy| Point::new(canopy.id(), canopy.centroid().clone()))
                            .collect(),
                    };
                    let labels = self.attempt(iterations, "assign", || {
                        pass.assign(&representatives, &current)
                    })?;
                    info!(points = labels.len(), "assignment pass committed");
                    assignment = Some(labels);
                    DriverState::Done
                }
                DriverState::Done => break,
            };
        }

        Ok(ClusteringRun {
            canopies: current,
            assignment,
            iterations,
            termination,
            transitions,
            snapshot: snapshot.records,
        })
    }

    // Resubmits substrate-level failures; fatal task errors abort immediately.
    fn attempt<T>(
        &self,
        iteration: usize,
        phase: &str,
        run: impl Fn() -> std::result::Result<T, PassError>,
    ) -> Result<T> {
        let attempts = self.config.max_pass_attempts;
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match run() {
                Ok(value) => return Ok(value),
                Err(PassError::Substrate(message)) => {
                    warn!(
                        iteration,
                        phase,
                        attempt,
                        reason = %message,
                        "pass failed; resubmitting from unchanged input"
                    );
                    reason = message;
                }
                Err(PassError::Task(source)) => {
                    return Err(CanopyError::Aborted {
                        iteration,
                        source: Box::new(source),
                    })
                }
            }
        }
        Err(CanopyError::PassFailure {
            iteration,
            attempts,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Record};
    use crate::vector::SparseVector;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn points(coords: &[f64]) -> Vec<Point> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &x)| Point::new(i as u64, SparseVector::from_dense(&[x, 1.0])))
            .collect()
    }

    fn line_config(max_iterations: usize) -> CanopyConfig {
        CanopyConfig {
            t1: 1.5,
            t2: 0.5,
            convergence_delta: 1e-3,
            max_iterations,
            ..CanopyConfig::default()
        }
    }

    fn line() -> Vec<Point> {
        points(&(0..10).map(f64::from).collect::<Vec<_>>())
    }

    #[test]
    fn two_canopy_scenario_converges_and_assigns() {
        let config = CanopyConfig {
            t1: 6.0,
            t2: 3.0,
            convergence_delta: 1e-3,
            ..CanopyConfig::default()
        };
        let driver = ClusteringDriver::new(config).unwrap();
        let run = driver.run_points(points(&[0.0, 10.0, 3.0])).unwrap();

        assert_eq!(run.termination, Termination::Converged);
        assert_eq!(run.iterations, 1);
        assert_eq!(run.canopies.len(), 2);
        assert_eq!(
            run.transitions,
            vec![
                DriverState::Seeding,
                DriverState::Iterating(1),
                DriverState::Converged,
                DriverState::Assigning,
                DriverState::Done,
            ]
        );
        let assignment = run.assignment.unwrap();
        assert_eq!(assignment.canopy_of(2), assignment.canopy_of(0));
        assert_ne!(assignment.canopy_of(2), assignment.canopy_of(1));
        assert_eq!(run.snapshot.len(), 2);
    }

    #[test]
    fn single_iteration_cap_exhausts_without_error() {
        let driver = ClusteringDriver::new(line_config(1)).unwrap();
        let run = driver.run_points(line()).unwrap();
        assert_eq!(run.termination, Termination::Exhausted);
        assert_eq!(run.iterations, 1);
        assert!(run.transitions.contains(&DriverState::Exhausted));
        assert!(!run.canopies.is_empty());
        assert_eq!(run.assignment.unwrap().len(), 10);
    }

    #[test]
    fn line_converges_within_cap() {
        let driver = ClusteringDriver::new(line_config(50)).unwrap();
        let run = driver.run_points(line()).unwrap();
        assert_eq!(run.termination, Termination::Converged);
        assert!(run.iterations > 1 && run.iterations <= 50);
        assert!(run.canopies.len() < 10);
        let sizes = run.assignment.unwrap().sizes();
        assert_eq!(sizes.values().sum::<usize>(), 10);
    }

    #[test]
    fn clustering_can_be_disabled() {
        let config = CanopyConfig {
            run_clustering: false,
            ..line_config(3)
        };
        let run = ClusteringDriver::new(config)
            .unwrap()
            .run_points(line())
            .unwrap();
        assert!(run.assignment.is_none());
        assert!(!run.transitions.contains(&DriverState::Assigning));
        assert_eq!(run.transitions.last(), Some(&DriverState::Done));
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let config = CanopyConfig {
            t1: 1.0,
            t2: 2.0,
            ..CanopyConfig::default()
        };
        assert!(matches!(
            ClusteringDriver::new(config),
            Err(CanopyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        let driver = ClusteringDriver::new(CanopyConfig::default()).unwrap();
        assert!(matches!(
            driver.run_points(Vec::new()),
            Err(CanopyError::InvalidData(_))
        ));
    }

    struct FlakySubstrate {
        inner: LocalSubstrate,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakySubstrate {
        fn failing(times: usize) -> Self {
            Self {
                inner: LocalSubstrate::default(),
                failures_left: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Substrate for FlakySubstrate {
        fn run_pass<T, K, V, M, R>(
            &self,
            name: &str,
            input: &[T],
            map: M,
            reduce: R,
        ) -> std::result::Result<BTreeMap<K, V>, PassError>
        where
            T: Sync,
            K: Ord + Send,
            V: Send,
            M: Fn(&T) -> crate::Result<Vec<(K, V)>> + Sync,
            R: Fn(V, V) -> V + Sync,
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(PassError::Substrate(format!("worker lost during {name}")));
            }
            self.inner.run_pass(name, input, map, reduce)
        }
    }

    #[test]
    fn substrate_failures_are_retried_from_the_same_snapshot() {
        let config = CanopyConfig {
            max_pass_attempts: 3,
            ..line_config(50)
        };
        let flaky = ClusteringDriver::with_substrate(config.clone(), FlakySubstrate::failing(2))
            .unwrap()
            .run_points(line())
            .unwrap();
        let clean = ClusteringDriver::new(config).unwrap().run_points(line()).unwrap();
        assert_eq!(flaky.iterations, clean.iterations);
        assert_eq!(flaky.canopies.len(), clean.canopies.len());
    }

    #[test]
    fn repeated_substrate_failure_aborts_with_iteration() {
        let config = CanopyConfig {
            max_pass_attempts: 2,
            ..line_config(5)
        };
        let substrate = FlakySubstrate::failing(usize::MAX);
        let driver = ClusteringDriver::with_substrate(config, substrate).unwrap();
        let err = driver.run_points(line()).unwrap_err();
        assert!(matches!(
            err,
            CanopyError::PassFailure {
                iteration: 0,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(driver.substrate.calls.load(Ordering::SeqCst), 2);
    }

    struct NanMeasure;

    impl DistanceMeasure for NanMeasure {
        fn distance(&self, _: &SparseVector, _: &SparseVector) -> f64 {
            f64::NAN
        }

        fn name(&self) -> &str {
            "nan"
        }
    }

    #[test]
    fn measure_fault_aborts_without_retry() {
        let driver = ClusteringDriver::with_substrate(line_config(5), FlakySubstrate::failing(0))
            .unwrap()
            .with_measure(Arc::new(NanMeasure));
        let err = driver.run_points(line()).unwrap_err();
        match err {
            CanopyError::Aborted { source, .. } => {
                assert!(matches!(*source, CanopyError::DistanceMeasureFault { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.substrate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_finite_records_are_skipped_not_fatal() {
        let mut records: Vec<Bytes> = line()
            .iter()
            .take(5)
            .map(|p| encode(&Record::Vector(p.vector.clone().into())))
            .collect();
        records.push(encode(&Record::Vector(vec![(0, f64::NAN)].into())));
        let config = CanopyConfig {
            task_failure_threshold: 5,
            ..line_config(10)
        };
        let run = ClusteringDriver::new(config)
            .unwrap()
            .run_records(&records)
            .unwrap();
        let assignment = run.assignment.unwrap();
        assert_eq!(assignment.len(), 5);
        assert!(assignment.canopy_of(5).is_none());

        let strict = ClusteringDriver::new(line_config(10)).unwrap();
        assert!(matches!(
            strict.run_records(&records),
            Err(CanopyError::PassFailure { iteration: 0, .. })
        ));
    }

    #[test]
    fn non_finite_points_are_rejected_up_front() {
        let mut points = line();
        points.push(Point::new(10, SparseVector::from_dense(&[f64::INFINITY])));
        let driver = ClusteringDriver::new(line_config(10)).unwrap();
        assert!(matches!(
            driver.run_points(points),
            Err(CanopyError::InvalidData(_))
        ));
    }

    #[test]
    fn encoded_points_and_canopy_input_paths_agree() {
        let records: Vec<Bytes> = line()
            .iter()
            .map(|p| encode(&Record::Vector(p.vector.clone().into())))
            .collect();
        let first = ClusteringDriver::new(line_config(2))
            .unwrap()
            .run_records(&records)
            .unwrap();
        assert_eq!(first.assignment.as_ref().unwrap().len(), 10);

        let resumed_config = CanopyConfig {
            input_already_canopies: true,
            ..line_config(50)
        };
        let resumed = ClusteringDriver::new(resumed_config)
            .unwrap()
            .run_records(&first.snapshot)
            .unwrap();
        assert_eq!(resumed.termination, Termination::Converged);
        assert!(resumed.canopies.len() <= first.canopies.len());
        // Canopy input is labelled by canopy id.
        let assignment = resumed.assignment.unwrap();
        for canopy in &first.canopies {
            assert!(assignment.canopy_of(canopy.id()).is_some());
        }
    }
}
