//! Execution substrate: runs one map → shuffle-by-key → reduce pass.
//!
//! The core schedules every canopy pass through [`Substrate::run_pass`]. Map
//! tasks see only their own input item plus whatever immutable state the map
//! closure captures; the reduce function must be associative and commutative
//! because partial results are combined in no particular order.

use rayon::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::CanopyError;

/// Why a pass did not produce output.
#[derive(Debug, Error)]
pub enum PassError {
    /// The pass failed as a whole and may be resubmitted from the same input.
    #[error("substrate failure: {0}")]
    Substrate(String),
    /// A task raised a fatal error; resubmitting would fail the same way.
    #[error(transparent)]
    Task(#[from] CanopyError),
}

/// Map/reduce capability the driver schedules passes onto.
pub trait Substrate: Sync {
    /// Run `map` over every input item, group the emitted pairs by key, and fold
    /// each group with `reduce`. The returned table is ordered by key.
    fn run_pass<T, K, V, M, R>(
        &self,
        name: &str,
        input: &[T],
        map: M,
        reduce: R,
    ) -> Result<BTreeMap<K, V>, PassError>
    where
        T: Sync,
        K: Ord + Send,
        V: Send,
        M: Fn(&T) -> crate::Result<Vec<(K, V)>> + Sync,
        R: Fn(V, V) -> V + Sync;
}

/// In-process substrate backed by the rayon thread pool.
///
/// Non-fatal task errors skip the offending item; once more than
/// `failure_threshold` tasks have failed the pass fails as a whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSubstrate {
    failure_threshold: usize,
}

impl LocalSubstrate {
    pub fn new(failure_threshold: usize) -> Self {
        Self { failure_threshold }
    }
}

struct Partial<K, V> {
    table: BTreeMap<K, V>,
    failed: usize,
    fatal: Option<CanopyError>,
}

impl<K: Ord, V> Partial<K, V> {
    fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
            failed: 0,
            fatal: None,
        }
    }

    fn merge(mut self, other: Partial<K, V>, reduce: &impl Fn(V, V) -> V) -> Self {
        for (key, value) in other.table {
            insert_reduced(&mut self.table, key, value, reduce);
        }
        self.failed += other.failed;
        self.fatal = self.fatal.or(other.fatal);
        self
    }
}

fn insert_reduced<K: Ord, V>(
    table: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    reduce: &impl Fn(V, V) -> V,
) {
    let merged = match table.remove(&key) {
        Some(existing) => reduce(existing, value),
        None => value,
    };
    table.insert(key, merged);
}

impl Substrate for LocalSubstrate {
    fn run_pass<T, K, V, M, R>(
        &self,
        name: &str,
        input: &[T],
        map: M,
        reduce: R,
    ) -> Result<BTreeMap<K, V>, PassError>
    where
        T: Sync,
        K: Ord + Send,
        V: Send,
        M: Fn(&T) -> crate::Result<Vec<(K, V)>> + Sync,
        R: Fn(V, V) -> V + Sync,
    {
        let partial = input
            .par_iter()
            .fold(Partial::empty, |mut acc, item| {
                if acc.fatal.is_some() {
                    return acc;
                }
                match map(item) {
                    Ok(pairs) => {
                        for (key, value) in pairs {
                            insert_reduced(&mut acc.table, key, value, &reduce);
                        }
                    }
                    Err(err) if err.is_fatal() => acc.fatal = Some(err),
                    Err(err) => {
                        tracing::warn!(pass = name, error = %err, "task failed; item skipped");
                        acc.failed += 1;
                    }
                }
                acc
            })
            .reduce(Partial::empty, |left, right| left.merge(right, &reduce));

        if let Some(fatal) = partial.fatal {
            return Err(PassError::Task(fatal));
        }
        if partial.failed > self.failure_threshold {
            return Err(PassError::Substrate(format!(
                "{} of {} tasks failed in pass '{name}' (threshold {})",
                partial.failed,
                input.len(),
                self.failure_threshold
            )));
        }
        tracing::debug!(
            pass = name,
            tasks = input.len(),
            keys = partial.table.len(),
            skipped = partial.failed,
            "pass complete"
        );
        Ok(partial.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_key_and_reduces() {
        let input: Vec<u32> = (1..=100).collect();
        let table = LocalSubstrate::default()
            .run_pass(
                "parity",
                &input,
                |&x| Ok(vec![(x % 2, x as u64)]),
                |a, b| a + b,
            )
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&0], 2550);
        assert_eq!(table[&1], 2500);
    }

    #[test]
    fn task_failures_within_threshold_are_skipped() {
        let input: Vec<u32> = (0..10).collect();
        let map = |&x: &u32| {
            if x == 3 {
                Err(CanopyError::MalformedRecord("bad".into()))
            } else {
                Ok(vec![(0u8, 1usize)])
            }
        };
        let table = LocalSubstrate::new(1)
            .run_pass("count", &input, map, |a, b| a + b)
            .unwrap();
        assert_eq!(table[&0], 9);

        let err = LocalSubstrate::new(0)
            .run_pass("count", &input, map, |a, b| a + b)
            .unwrap_err();
        assert!(matches!(err, PassError::Substrate(_)));
    }

    #[test]
    fn fatal_task_error_fails_the_pass() {
        let input: Vec<u32> = (0..10).collect();
        let err = LocalSubstrate::new(100)
            .run_pass(
                "fault",
                &input,
                |_| -> crate::Result<Vec<(u8, u8)>> {
                    Err(CanopyError::DistanceMeasureFault {
                        measure: "broken".into(),
                        detail: "returned NaN".into(),
                    })
                },
                |a, _| a,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PassError::Task(CanopyError::DistanceMeasureFault { .. })
        ));
    }
}
