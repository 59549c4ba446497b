//! Canopy passes: seeding, refinement and final assignment.
//!
//! Every pass is scheduled on a [`Substrate`]. Map tasks read an immutable
//! canopy snapshot fixed at the start of the pass and emit contributions keyed
//! by canopy id; centroids are only committed once the reduction completes.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::canopy::{merge_covered, Canopy, CanopyId, CentroidAccumulator, PointId};
use crate::codec;
use crate::config::CanopyConfig;
use crate::distance::{checked_distance, DistanceMeasure};
use crate::substrate::{PassError, Substrate};
use crate::vector::SparseVector;
use crate::CanopyError;

/// An input point with its stream position as identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: PointId,
    pub vector: SparseVector,
}

impl Point {
    pub fn new(id: PointId, vector: SparseVector) -> Self {
        Self { id, vector }
    }
}

/// What a canopy pass consumes.
#[derive(Debug, Clone, Copy)]
pub enum PassInput<'a> {
    /// Raw points: the seeding pass.
    Points(&'a [Point]),
    /// The previous iteration's canopies, used as both input and reference.
    Canopies(&'a [Canopy]),
}

/// Committed result of one pass.
#[derive(Debug, Clone)]
pub struct PassOutput {
    /// Next-iteration canopies in ascending id order.
    pub canopies: Vec<Canopy>,
    /// Some canopy moved beyond the convergence delta, or the canopy count changed.
    pub any_changed: bool,
    /// Canopies merged away because they fell within `t2` of a lower id.
    pub merged: usize,
    /// Canopies dropped for lack of folded points. Only non-zero for measures
    /// where a vector is not at distance 0 from itself.
    pub dropped: usize,
}

/// Final single-valued labelling of points with canopy ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterAssignment {
    labels: BTreeMap<PointId, CanopyId>,
}

impl ClusterAssignment {
    pub fn canopy_of(&self, point: PointId) -> Option<CanopyId> {
        self.labels.get(&point).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(point, canopy)` pairs in point order.
    pub fn iter(&self) -> impl Iterator<Item = (PointId, CanopyId)> + '_ {
        self.labels.iter().map(|(&point, &canopy)| (point, canopy))
    }

    /// Points labelled with `canopy`, ascending.
    pub fn members_of(&self, canopy: CanopyId) -> Vec<PointId> {
        self.iter()
            .filter(|&(_, c)| c == canopy)
            .map(|(point, _)| point)
            .collect()
    }

    /// Number of points per canopy.
    pub fn sizes(&self) -> BTreeMap<CanopyId, usize> {
        let mut sizes = BTreeMap::new();
        for &canopy in self.labels.values() {
            *sizes.entry(canopy).or_insert(0) += 1;
        }
        sizes
    }
}

/// One canopy pass bound to a substrate, a measure, and the configured radii.
pub struct CanopyPass<'a, S> {
    substrate: &'a S,
    measure: &'a dyn DistanceMeasure,
    t1: f64,
    t2: f64,
    convergence_delta: f64,
    chunk_size: usize,
}

impl<'a, S: Substrate> CanopyPass<'a, S> {
    pub fn new(substrate: &'a S, measure: &'a dyn DistanceMeasure, config: &CanopyConfig) -> Self {
        Self {
            substrate,
            measure,
            t1: config.t1,
            t2: config.t2,
            convergence_delta: config.convergence_delta,
            chunk_size: config.seed_chunk_size.max(1),
        }
    }

    /// Run a seeding pass over points or a refinement pass over canopies.
    pub fn run(&self, input: PassInput<'_>) -> Result<PassOutput, PassError> {
        match input {
            PassInput::Points(points) => self.seed(points),
            PassInput::Canopies(canopies) => self.refine(canopies),
        }
    }

    /// Seed canopies from raw points.
    ///
    /// Points are split into chunks that seed independently; local canopies get
    /// ids `chunk * chunk_size + k`, which preserves chunk order. Canopies from
    /// different chunks that ended up within `t2` are then merged, lowest id first.
    fn seed(&self, points: &[Point]) -> Result<PassOutput, PassError> {
        let chunks: Vec<(usize, &[Point])> = points.chunks(self.chunk_size).enumerate().collect();
        let local = self.substrate.run_pass(
            "seed",
            &chunks,
            |(chunk, points)| {
                let base = (*chunk * self.chunk_size) as CanopyId;
                Ok(vec![(*chunk, self.seed_chunk(base, points)?)])
            },
            |mut left: Vec<Canopy>, right| {
                left.extend(right);
                left
            },
        )?;
        let seeded: Vec<Canopy> = local.into_values().flatten().collect();
        let seeded_count = seeded.len();
        let (canopies, merged) = merge_covered(seeded, self.measure)?;
        tracing::debug!(
            points = points.len(),
            chunks = chunks.len(),
            seeded = seeded_count,
            merged,
            "seeding pass reduced"
        );
        let any_changed = self.any_changed(&canopies, 0)?;
        Ok(PassOutput {
            canopies,
            any_changed,
            merged,
            dropped: 0,
        })
    }

    // Coverage is checked against the canopies as they stand before this point
    // folds in; only an uncovered point spawns a canopy.
    fn seed_chunk(&self, base: CanopyId, points: &[Point]) -> crate::Result<Vec<Canopy>> {
        let mut canopies: Vec<Canopy> = Vec::new();
        for point in points {
            let mut covered = false;
            for canopy in &canopies {
                if canopy.covers(&point.vector, self.measure)? {
                    covered = true;
                    break;
                }
            }
            for canopy in canopies.iter_mut() {
                canopy.try_fold(point.id, &point.vector, self.measure)?;
            }
            if !covered {
                let id = base + canopies.len() as CanopyId;
                canopies.push(Canopy::seed(id, point.id, &point.vector, self.t1, self.t2));
            }
        }
        Ok(canopies)
    }

    /// Shift every canopy to the mass-weighted mean of the snapshot canopies
    /// within its `t1`, then merge canopies that meet within `t2`.
    fn refine(&self, snapshot: &[Canopy]) -> Result<PassOutput, PassError> {
        let contributions = self.substrate.run_pass(
            "refine",
            snapshot,
            |input: &Canopy| {
                let mut out = Vec::new();
                for reference in snapshot {
                    let distance =
                        checked_distance(self.measure, input.centroid(), reference.centroid())?;
                    if distance <= reference.t1() {
                        out.push((
                            reference.id(),
                            CentroidAccumulator::of(input.centroid(), input.mass()),
                        ));
                    }
                }
                Ok(out)
            },
            CentroidAccumulator::merge,
        )?;

        let previous: BTreeMap<CanopyId, &Canopy> =
            snapshot.iter().map(|canopy| (canopy.id(), canopy)).collect();
        let mut committed = Vec::with_capacity(contributions.len());
        for (id, accumulator) in contributions {
            let (Some(mean), Some(&prior)) = (accumulator.mean(), previous.get(&id)) else {
                continue;
            };
            let mut canopy = prior.clone();
            canopy.shift_to(mean, accumulator.weight());
            committed.push(canopy);
        }
        // Every representative is its own reference at distance 0, so a canopy
        // only goes without contributions under a measure with d(x, x) > t1.
        let dropped = snapshot.len().saturating_sub(committed.len());
        if dropped > 0 {
            tracing::debug!(dropped, "dropping canopies with no folded points");
        }

        let (canopies, merged) = merge_covered(committed, self.measure)?;
        let any_changed = self.any_changed(&canopies, snapshot.len())?;
        Ok(PassOutput {
            canopies,
            any_changed,
            merged,
            dropped,
        })
    }

    fn any_changed(&self, canopies: &[Canopy], previous_count: usize) -> crate::Result<bool> {
        if canopies.len() != previous_count {
            return Ok(true);
        }
        for canopy in canopies {
            if !canopy.has_converged(self.convergence_delta, self.measure)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Label every point with its nearest canopy; ties go to the lowest id.
    pub fn assign(
        &self,
        points: &[Point],
        canopies: &[Canopy],
    ) -> Result<ClusterAssignment, PassError> {
        let mut ordered: Vec<&Canopy> = canopies.iter().collect();
        ordered.sort_by_key(|canopy| canopy.id());
        let labels = self.substrate.run_pass(
            "assign",
            points,
            |point: &Point| {
                let mut best: Option<(CanopyId, f64)> = None;
                for canopy in &ordered {
                    let distance = checked_distance(self.measure, &point.vector, canopy.centroid())?;
                    if best.map_or(true, |(_, nearest)| distance < nearest) {
                        best = Some((canopy.id(), distance));
                    }
                }
                Ok(best.map(|(id, _)| vec![(point.id, id)]).unwrap_or_default())
            },
            |first, _| first,
        )?;
        Ok(ClusterAssignment { labels })
    }
}

/// Decode an input stream of vector records into points numbered by position.
///
/// Malformed records, preference pairs and vectors with non-finite components
/// fail their own task only.
pub fn decode_points<S: Substrate>(substrate: &S, records: &[Bytes]) -> Result<Vec<Point>, PassError> {
    let indexed: Vec<(PointId, &Bytes)> = records
        .iter()
        .enumerate()
        .map(|(position, record)| (position as PointId, record))
        .collect();
    let table = substrate.run_pass(
        "decode-points",
        &indexed,
        |(id, record)| {
            let vector = codec::decode(record)?.into_vector().ok_or_else(|| {
                CanopyError::InvalidData(format!(
                    "record {id} is a preference pair; input points must be vectors"
                ))
            })?;
            if !vector.is_finite() {
                return Err(CanopyError::InvalidData(format!(
                    "record {id} has non-finite components"
                )));
            }
            Ok(vec![(*id, vector)])
        },
        |first, _| first,
    )?;
    Ok(table
        .into_iter()
        .map(|(id, vector)| Point::new(id, vector))
        .collect())
}

/// Decode an input stream of canopy records. Duplicate ids keep the first record.
pub fn decode_canopies<S: Substrate>(
    substrate: &S,
    records: &[Bytes],
) -> Result<Vec<Canopy>, PassError> {
    let table = substrate.run_pass(
        "decode-canopies",
        records,
        |record: &Bytes| {
            let canopy = codec::decode_canopy(record)?;
            Ok(vec![(canopy.id(), canopy)])
        },
        |first, _| first,
    )?;
    Ok(table.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Record};
    use crate::distance::Euclidean;
    use crate::substrate::LocalSubstrate;
    use approx::assert_relative_eq;

    fn points(coords: &[(f64, f64)]) -> Vec<Point> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| Point::new(i as PointId, SparseVector::from_dense(&[x, y])))
            .collect()
    }

    fn config(t1: f64, t2: f64) -> CanopyConfig {
        CanopyConfig {
            t1,
            t2,
            convergence_delta: 1e-3,
            ..CanopyConfig::default()
        }
    }

    #[test]
    fn seeding_scenario_two_canopies() {
        let substrate = LocalSubstrate::default();
        let cfg = config(6.0, 3.0);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let input = points(&[(0.0, 0.0), (10.0, 0.0), (3.0, 0.0)]);
        let out = pass.run(PassInput::Points(&input)).unwrap();

        assert_eq!(out.canopies.len(), 2);
        assert!(out.any_changed);
        let first = &out.canopies[0];
        assert_eq!(first.id(), 0);
        assert_relative_eq!(first.centroid().get(0), 1.5);
        assert_eq!(first.point_count(), 2);
        assert!(first.members().contains(&2));
        let second = &out.canopies[1];
        assert_relative_eq!(second.centroid().get(0), 10.0);
        assert!(!second.members().contains(&2));

        let assignment = pass.assign(&input, &out.canopies).unwrap();
        assert_eq!(assignment.canopy_of(2), Some(0));
        assert_eq!(assignment.canopy_of(1), Some(1));
        assert_eq!(assignment.sizes()[&0], 2);
    }

    #[test]
    fn covered_points_fold_without_seeding() {
        let substrate = LocalSubstrate::default();
        let cfg = config(2.0, 2.0);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let input = points(&[(0.0, 0.0), (2.0, 0.0), (1.0, 0.0)]);
        let out = pass.run(PassInput::Points(&input)).unwrap();
        assert_eq!(out.canopies.len(), 1);
        assert_eq!(out.canopies[0].point_count(), 3);
    }

    #[test]
    fn chunked_seeding_merges_across_chunks_lowest_id_wins() {
        let substrate = LocalSubstrate::default();
        let cfg = CanopyConfig {
            seed_chunk_size: 1,
            ..config(4.0, 1.0)
        };
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let input = points(&[(0.0, 0.0), (0.5, 0.0), (9.0, 0.0)]);
        let out = pass.run(PassInput::Points(&input)).unwrap();
        // Chunks seed ids 0, 1, 2; canopy 1 lies within t2 of canopy 0.
        assert_eq!(out.merged, 1);
        let ids: Vec<_> = out.canopies.iter().map(Canopy::id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_relative_eq!(out.canopies[0].centroid().get(0), 0.25);
        assert_eq!(out.canopies[0].members().len(), 2);
    }

    #[test]
    fn refinement_of_stable_canopies_reports_no_change() {
        let substrate = LocalSubstrate::default();
        let cfg = config(6.0, 3.0);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let input = points(&[(0.0, 0.0), (10.0, 0.0), (3.0, 0.0)]);
        let seeded = pass.run(PassInput::Points(&input)).unwrap();
        let refined = pass.run(PassInput::Canopies(&seeded.canopies)).unwrap();
        assert_eq!(refined.canopies.len(), 2);
        assert!(!refined.any_changed);
        assert_eq!(refined.dropped, 0);
        assert_eq!(refined.canopies[0].prior(), Some(seeded.canopies[0].centroid()));
    }

    #[test]
    fn converged_refinement_stays_converged() {
        let substrate = LocalSubstrate::default();
        let cfg = config(6.0, 3.0);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let input = points(&[(0.0, 0.0), (10.0, 0.0), (3.0, 0.0), (11.0, 1.0)]);
        let mut current = pass.run(PassInput::Points(&input)).unwrap().canopies;
        let mut settled = None;
        for _ in 0..10 {
            let out = pass.run(PassInput::Canopies(&current)).unwrap();
            current = out.canopies;
            if !out.any_changed {
                settled = Some(current.clone());
                break;
            }
        }
        let settled = settled.expect("refinement settles");
        let ids: Vec<_> = settled.iter().map(Canopy::id).collect();

        for _ in 0..3 {
            let again = pass.run(PassInput::Canopies(&current)).unwrap();
            assert!(!again.any_changed);
            assert_eq!(again.canopies.iter().map(Canopy::id).collect::<Vec<_>>(), ids);
            current = again.canopies;
        }
    }

    struct OffsetEuclidean(f64);

    impl DistanceMeasure for OffsetEuclidean {
        fn distance(&self, a: &SparseVector, b: &SparseVector) -> f64 {
            Euclidean.distance(a, b) + self.0
        }

        fn name(&self) -> &str {
            "offset-euclidean"
        }
    }

    #[test]
    fn canopies_without_contributions_are_dropped() {
        let substrate = LocalSubstrate::default();
        let cfg = config(1.0, 0.5);
        let measure = OffsetEuclidean(2.0);
        let pass = CanopyPass::new(&substrate, &measure, &cfg);
        let canopies = vec![
            Canopy::restore(0, SparseVector::from_dense(&[0.0]), 1.0, 0.5, 1, [0].into()),
            Canopy::restore(1, SparseVector::from_dense(&[9.0]), 1.0, 0.5, 1, [1].into()),
        ];
        let out = pass.run(PassInput::Canopies(&canopies)).unwrap();
        assert_eq!(out.dropped, 2);
        assert!(out.canopies.is_empty());
        assert!(out.any_changed);
    }

    #[test]
    fn refinement_shifts_towards_mass_weighted_neighbours() {
        let substrate = LocalSubstrate::default();
        let cfg = config(3.0, 0.5);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let a = Canopy::restore(0, SparseVector::from_dense(&[0.0]), 3.0, 0.5, 3, [0, 1, 2].into());
        let b = Canopy::restore(1, SparseVector::from_dense(&[2.0]), 3.0, 0.5, 1, [3].into());
        let out = pass.run(PassInput::Canopies(&[a, b])).unwrap();
        // Both see each other: (0*3 + 2*1) / 4 = 0.5 for both, then they merge.
        assert_eq!(out.canopies.len(), 1);
        assert_eq!(out.merged, 1);
        assert_relative_eq!(out.canopies[0].centroid().get(0), 0.5);
        assert_eq!(out.canopies[0].members().len(), 4);
        assert!(out.any_changed);
    }

    #[test]
    fn assignment_ties_go_to_lowest_id() {
        let substrate = LocalSubstrate::default();
        let cfg = config(1.0, 0.5);
        let pass = CanopyPass::new(&substrate, &Euclidean, &cfg);
        let canopies = vec![
            Canopy::restore(5, SparseVector::from_dense(&[2.0]), 1.0, 0.5, 1, [0].into()),
            Canopy::restore(3, SparseVector::from_dense(&[0.0]), 1.0, 0.5, 1, [1].into()),
        ];
        let input = vec![Point::new(0, SparseVector::from_dense(&[1.0]))];
        let assignment = pass.assign(&input, &canopies).unwrap();
        assert_eq!(assignment.canopy_of(0), Some(3));
        assert_eq!(assignment.members_of(3), vec![0]);
    }

    #[test]
    fn decode_points_skips_malformed_within_threshold() {
        let good = encode(&Record::Vector(SparseVector::from_dense(&[1.0, 2.0]).into()));
        let preference = encode(&Record::Preference {
            user_id: 1,
            value: 1.0,
        });
        let not_finite = encode(&Record::Vector(vec![(0, f64::NAN), (1, 1.0)].into()));
        let truncated = good.slice(..good.len() - 2);
        let records = vec![good.clone(), truncated, preference, not_finite, good];

        let points = decode_points(&LocalSubstrate::new(3), &records).unwrap();
        let ids: Vec<_> = points.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 4]);

        let err = decode_points(&LocalSubstrate::new(2), &records).unwrap_err();
        assert!(matches!(err, PassError::Substrate(_)));
    }
}
