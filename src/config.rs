//! Run configuration for the clustering driver.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::distance::MeasureKind;
use crate::{CanopyError, Result};

/// Configurable knobs for a canopy mean-shift run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CanopyConfig {
    /// Outer radius: points within `t1` of a centroid are folded into it.
    pub t1: f64,
    /// Inner radius: points within `t2` are covered; canopies within `t2` merge.
    pub t2: f64,
    /// A canopy has converged once its centroid moves at most this far.
    pub convergence_delta: f64,
    /// Refinement passes allowed before the run stops as exhausted.
    pub max_iterations: usize,
    /// The input stream holds canopy records rather than raw points.
    pub input_already_canopies: bool,
    /// Distance measure used for folding, coverage and convergence.
    pub measure: MeasureKind,
    /// Label every input point with its nearest canopy once iteration stops.
    pub run_clustering: bool,
    /// Points handled by one seeding task.
    pub seed_chunk_size: usize,
    /// Submissions of a single pass before it is reported as failed.
    pub max_pass_attempts: usize,
    /// Non-fatal task failures a pass tolerates before it fails as a whole.
    pub task_failure_threshold: usize,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            t1: 47.6,
            t2: 1.0,
            convergence_delta: 0.5,
            max_iterations: 10,
            input_already_canopies: false,
            measure: MeasureKind::default(),
            run_clustering: true,
            seed_chunk_size: 1024,
            max_pass_attempts: 3,
            task_failure_threshold: 0,
        }
    }
}

impl CanopyConfig {
    /// Reject configurations that would make canopy semantics ill-formed.
    pub fn validate(&self) -> Result<()> {
        if !self.t1.is_finite() || self.t1 <= 0.0 {
            return Err(CanopyError::InvalidConfiguration(format!(
                "t1 must be a positive finite number (got {})",
                self.t1
            )));
        }
        if !self.t2.is_finite() || self.t2 < 0.0 {
            return Err(CanopyError::InvalidConfiguration(format!(
                "t2 must be a non-negative finite number (got {})",
                self.t2
            )));
        }
        if self.t2 > self.t1 {
            return Err(CanopyError::InvalidConfiguration(format!(
                "t2 ({}) must not exceed t1 ({})",
                self.t2, self.t1
            )));
        }
        if !self.convergence_delta.is_finite() || self.convergence_delta < 0.0 {
            return Err(CanopyError::InvalidConfiguration(format!(
                "convergence_delta must be non-negative (got {})",
                self.convergence_delta
            )));
        }
        if self.convergence_delta == 0.0 {
            tracing::warn!("convergence_delta is 0; convergence requires identical centroids");
        }
        if self.max_iterations == 0 {
            return Err(CanopyError::InvalidConfiguration(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.seed_chunk_size == 0 {
            return Err(CanopyError::InvalidConfiguration(
                "seed_chunk_size must be at least 1".into(),
            ));
        }
        if self.max_pass_attempts == 0 {
            return Err(CanopyError::InvalidConfiguration(
                "max_pass_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load a JSON configuration; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: CanopyConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }
}
