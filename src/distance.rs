//! Pluggable distance measures over sparse vectors.
//!
//! Every measure treats absent indices as zero. The core only relies on the
//! result being finite and non-negative; [`checked_distance`] enforces that and
//! reports anything else as a [`CanopyError::DistanceMeasureFault`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::vector::SparseVector;
use crate::{CanopyError, Result};

/// Scalar distance between two vectors.
///
/// Implementations should be symmetric and non-negative, and return zero for
/// identical inputs.
pub trait DistanceMeasure: Send + Sync {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64;

    /// Name used in logs and fault reports.
    fn name(&self) -> &str;
}

/// Compute `measure(a, b)` and reject negative or non-finite results.
pub fn checked_distance(
    measure: &dyn DistanceMeasure,
    a: &SparseVector,
    b: &SparseVector,
) -> Result<f64> {
    let d = measure.distance(a, b);
    if d.is_finite() && d >= 0.0 {
        Ok(d)
    } else {
        Err(CanopyError::DistanceMeasureFault {
            measure: measure.name().to_string(),
            detail: format!("returned {d}"),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl DistanceMeasure for Euclidean {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        SquaredEuclidean.distance(a, b).sqrt()
    }

    fn name(&self) -> &str {
        "euclidean"
    }
}

/// Squared Euclidean distance. Cheaper, but radii must be given squared.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredEuclidean;

impl DistanceMeasure for SquaredEuclidean {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        let mut total = 0.0;
        a.for_each_pair(b, |x, y| {
            let diff = x - y;
            total += diff * diff;
        });
        total
    }

    fn name(&self) -> &str {
        "squared-euclidean"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Manhattan;

impl DistanceMeasure for Manhattan {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        let mut total = 0.0;
        a.for_each_pair(b, |x, y| total += (x - y).abs());
        total
    }

    fn name(&self) -> &str {
        "manhattan"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Chebyshev;

impl DistanceMeasure for Chebyshev {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        let mut max = 0.0f64;
        a.for_each_pair(b, |x, y| max = max.max((x - y).abs()));
        max
    }

    fn name(&self) -> &str {
        "chebyshev"
    }
}

/// `1 - cos(a, b)`. Zero vectors are at distance 0 from each other and 1 from
/// anything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl DistanceMeasure for Cosine {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        let (dot, norm_a, norm_b) = dot_and_norms(a, b);
        if norm_a == 0.0 || norm_b == 0.0 {
            return if norm_a == norm_b { 0.0 } else { 1.0 };
        }
        (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).max(0.0)
    }

    fn name(&self) -> &str {
        "cosine"
    }
}

/// `1 - a·b / (|a|² + |b|² - a·b)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanimoto;

impl DistanceMeasure for Tanimoto {
    fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        let (dot, norm_a, norm_b) = dot_and_norms(a, b);
        let denominator = norm_a + norm_b - dot;
        if denominator == 0.0 {
            return 0.0;
        }
        (1.0 - dot / denominator).max(0.0)
    }

    fn name(&self) -> &str {
        "tanimoto"
    }
}

// (a·b, |a|², |b|²)
fn dot_and_norms(a: &SparseVector, b: &SparseVector) -> (f64, f64, f64) {
    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    a.for_each_pair(b, |x, y| {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    });
    (dot, norm_a, norm_b)
}

/// Built-in measures selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MeasureKind {
    #[default]
    Euclidean,
    SquaredEuclidean,
    Manhattan,
    Chebyshev,
    Cosine,
    Tanimoto,
}

impl MeasureKind {
    /// Instantiate the measure as a shareable capability.
    pub fn build(self) -> Arc<dyn DistanceMeasure> {
        match self {
            MeasureKind::Euclidean => Arc::new(Euclidean),
            MeasureKind::SquaredEuclidean => Arc::new(SquaredEuclidean),
            MeasureKind::Manhattan => Arc::new(Manhattan),
            MeasureKind::Chebyshev => Arc::new(Chebyshev),
            MeasureKind::Cosine => Arc::new(Cosine),
            MeasureKind::Tanimoto => Arc::new(Tanimoto),
        }
    }
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasureKind::Euclidean => "euclidean",
            MeasureKind::SquaredEuclidean => "squared-euclidean",
            MeasureKind::Manhattan => "manhattan",
            MeasureKind::Chebyshev => "chebyshev",
            MeasureKind::Cosine => "cosine",
            MeasureKind::Tanimoto => "tanimoto",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MeasureKind {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "euclidean" => Ok(Self::Euclidean),
            "squared-euclidean" | "squaredeuclidean" => Ok(Self::SquaredEuclidean),
            "manhattan" => Ok(Self::Manhattan),
            "chebyshev" => Ok(Self::Chebyshev),
            "cosine" => Ok(Self::Cosine),
            "tanimoto" => Ok(Self::Tanimoto),
            other => Err(CanopyError::InvalidConfiguration(format!(
                "unsupported distance measure '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn v(values: &[f64]) -> SparseVector {
        SparseVector::from_dense(values)
    }

    #[test]
    fn euclidean_over_sparse_union() {
        let a: SparseVector = vec![(0, 3.0)].into();
        let b: SparseVector = vec![(5, 4.0)].into();
        assert_relative_eq!(Euclidean.distance(&a, &b), 5.0);
        assert_relative_eq!(Euclidean.distance(&b, &a), 5.0);
        assert_eq!(Euclidean.distance(&a, &a), 0.0);
    }

    #[test]
    fn builtin_measures_on_simple_pair() {
        let a = v(&[1.0, 0.0]);
        let b = v(&[0.0, 2.0]);
        assert_relative_eq!(SquaredEuclidean.distance(&a, &b), 5.0);
        assert_relative_eq!(Manhattan.distance(&a, &b), 3.0);
        assert_relative_eq!(Chebyshev.distance(&a, &b), 2.0);
        assert_relative_eq!(Cosine.distance(&a, &b), 1.0);
        assert_relative_eq!(Tanimoto.distance(&a, &b), 1.0);
        assert_relative_eq!(Cosine.distance(&a, &v(&[2.0, 0.0])), 0.0);
        assert_eq!(Cosine.distance(&v(&[]), &v(&[])), 0.0);
    }

    struct Broken;

    impl DistanceMeasure for Broken {
        fn distance(&self, _: &SparseVector, _: &SparseVector) -> f64 {
            -1.0
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn negative_distance_is_a_fault() {
        let err = checked_distance(&Broken, &v(&[1.0]), &v(&[2.0])).unwrap_err();
        assert!(matches!(
            err,
            CanopyError::DistanceMeasureFault { ref measure, .. } if measure == "broken"
        ));
    }

    #[test]
    fn measure_kind_parses_and_displays() {
        for kind in [
            MeasureKind::Euclidean,
            MeasureKind::SquaredEuclidean,
            MeasureKind::Manhattan,
            MeasureKind::Chebyshev,
            MeasureKind::Cosine,
            MeasureKind::Tanimoto,
        ] {
            let parsed: MeasureKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(kind.build().name(), kind.to_string());
        }
        assert!("mahalanobis".parse::<MeasureKind>().is_err());
    }
}
