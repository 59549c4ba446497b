//! Canopies: approximate cluster representatives with two radii.
//!
//! A point within `t1` of a canopy's centroid is folded into it and moves the
//! centroid; a point within `t2` is already covered and never seeds a canopy
//! of its own. Overlap is intentional: a point may fold into many canopies.

use std::collections::BTreeSet;

use crate::distance::{checked_distance, DistanceMeasure};
use crate::vector::SparseVector;
use crate::Result;

/// Process-assigned canopy sequence id.
pub type CanopyId = u64;
/// Identifier of an input point (its position in the input stream).
pub type PointId = u64;

/// Outcome of [`Canopy::try_fold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Folded,
    NotFolded,
}

/// A candidate cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Canopy {
    id: CanopyId,
    centroid: SparseVector,
    prior: Option<SparseVector>,
    t1: f64,
    t2: f64,
    point_count: u64,
    members: BTreeSet<PointId>,
}

impl Canopy {
    /// New canopy centred on a single point, which is its first member.
    pub fn seed(id: CanopyId, point_id: PointId, point: &SparseVector, t1: f64, t2: f64) -> Self {
        Self {
            id,
            centroid: point.clone(),
            prior: None,
            t1,
            t2,
            point_count: 1,
            members: BTreeSet::from([point_id]),
        }
    }

    /// Rebuild a canopy from persisted state. It has no prior centroid.
    pub fn restore(
        id: CanopyId,
        centroid: SparseVector,
        t1: f64,
        t2: f64,
        point_count: u64,
        members: BTreeSet<PointId>,
    ) -> Self {
        Self {
            id,
            centroid,
            prior: None,
            t1,
            t2,
            point_count,
            members,
        }
    }

    pub fn id(&self) -> CanopyId {
        self.id
    }

    pub fn centroid(&self) -> &SparseVector {
        &self.centroid
    }

    /// Centroid committed by the previous pass, if any.
    pub fn prior(&self) -> Option<&SparseVector> {
        self.prior.as_ref()
    }

    pub fn t1(&self) -> f64 {
        self.t1
    }

    pub fn t2(&self) -> f64 {
        self.t2
    }

    /// Weight folded in during the pass that produced this canopy.
    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    pub fn members(&self) -> &BTreeSet<PointId> {
        &self.members
    }

    /// Weight this canopy carries when it is itself an input to a refinement pass.
    pub fn mass(&self) -> u64 {
        (self.members.len() as u64).max(1)
    }

    /// Fold `point` into the running mean if it lies within `t1`.
    ///
    /// `centroid' = centroid + (point - centroid) / (point_count + 1)`.
    /// The canopy is untouched when the point is out of range.
    pub fn try_fold(
        &mut self,
        point_id: PointId,
        point: &SparseVector,
        measure: &dyn DistanceMeasure,
    ) -> Result<Fold> {
        let distance = checked_distance(measure, point, &self.centroid)?;
        if distance > self.t1 {
            return Ok(Fold::NotFolded);
        }
        let step = 1.0 / (self.point_count + 1) as f64;
        let mut delta = point.clone();
        delta.add_scaled(&self.centroid, -1.0);
        self.centroid.add_scaled(&delta, step);
        self.point_count += 1;
        self.members.insert(point_id);
        Ok(Fold::Folded)
    }

    /// Whether `point` lies within `t2` of the centroid.
    pub fn covers(&self, point: &SparseVector, measure: &dyn DistanceMeasure) -> Result<bool> {
        Ok(checked_distance(measure, point, &self.centroid)? <= self.t2)
    }

    /// Whether the centroid moved at most `tolerance` since the previous pass.
    /// A canopy without a prior centroid has not converged.
    pub fn has_converged(&self, tolerance: f64, measure: &dyn DistanceMeasure) -> Result<bool> {
        match &self.prior {
            Some(prior) => Ok(checked_distance(measure, &self.centroid, prior)? <= tolerance),
            None => Ok(false),
        }
    }

    /// Commit a new centroid for the next iteration, remembering the current one as prior.
    pub(crate) fn shift_to(&mut self, centroid: SparseVector, point_count: u64) {
        self.prior = Some(std::mem::replace(&mut self.centroid, centroid));
        self.point_count = point_count;
    }

    /// Merge `other` into `self`: point-count weighted centroid, summed counts,
    /// united membership. `self` keeps its id and prior.
    pub fn absorb(&mut self, other: Canopy) {
        let total = self.point_count + other.point_count;
        if total > 0 {
            let mut centroid = self
                .centroid
                .scaled(self.point_count as f64 / total as f64);
            centroid.add_scaled(&other.centroid, other.point_count as f64 / total as f64);
            self.centroid = centroid;
        }
        self.point_count = total;
        self.members.extend(other.members);
    }
}

/// Merge canopies whose centroids lie within `t2` of an earlier survivor.
///
/// Canopies are visited in ascending id order and each joins the first
/// (lowest id) survivor that covers its centroid, so the lowest id wins.
/// Returns the survivors and the number of canopies merged away.
pub fn merge_covered(
    mut canopies: Vec<Canopy>,
    measure: &dyn DistanceMeasure,
) -> Result<(Vec<Canopy>, usize)> {
    canopies.sort_by_key(Canopy::id);
    let mut survivors: Vec<Canopy> = Vec::with_capacity(canopies.len());
    let mut merged = 0usize;
    'next: for canopy in canopies {
        for survivor in survivors.iter_mut() {
            if survivor.covers(canopy.centroid(), measure)? {
                tracing::debug!(
                    survivor = survivor.id(),
                    absorbed = canopy.id(),
                    "merging canopy within t2"
                );
                survivor.absorb(canopy);
                merged += 1;
                continue 'next;
            }
        }
        survivors.push(canopy);
    }
    Ok((survivors, merged))
}

/// Partial `(sum, weight)` contribution towards one canopy's next centroid.
///
/// Merging is associative and commutative, so contributions can be reduced in
/// any order.
#[derive(Debug, Clone, Default)]
pub struct CentroidAccumulator {
    sum: SparseVector,
    weight: u64,
}

impl CentroidAccumulator {
    /// Contribution of one point (or representative) with the given weight.
    pub fn of(point: &SparseVector, weight: u64) -> Self {
        Self {
            sum: point.scaled(weight as f64),
            weight,
        }
    }

    pub fn merge(mut self, other: CentroidAccumulator) -> Self {
        self.sum.add_scaled(&other.sum, 1.0);
        self.weight += other.weight;
        self
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// `sum / weight`, or `None` when nothing was folded in.
    pub fn mean(&self) -> Option<SparseVector> {
        (self.weight > 0).then(|| self.sum.scaled(1.0 / self.weight as f64))
    }
}
