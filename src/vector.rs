//! Sparse vectors keyed by non-negative dimension index.
//!
//! Entries keep their insertion order (the wire codec writes them in that
//! order) while a position table gives O(1) random access for the in-place
//! updates a fold performs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sparse vector: absent indices are implicitly zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(u32, f64)>", into = "Vec<(u32, f64)>")]
pub struct SparseVector {
    entries: Vec<(u32, f64)>,
    positions: HashMap<u32, usize>,
}

impl SparseVector {
    /// Empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty vector with room for `capacity` stored entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    /// Build from a dense slice, skipping zero components.
    pub fn from_dense(values: &[f64]) -> Self {
        let mut vector = Self::with_capacity(values.len());
        for (index, &value) in values.iter().enumerate() {
            if value != 0.0 {
                vector.set(index as u32, value);
            }
        }
        vector
    }

    /// Value at `index` (zero when absent).
    pub fn get(&self, index: u32) -> f64 {
        self.position(index)
            .map(|pos| self.entries[pos].1)
            .unwrap_or(0.0)
    }

    /// Whether `index` has a stored entry.
    pub fn contains(&self, index: u32) -> bool {
        self.positions.contains_key(&index)
    }

    /// Set `index` to `value`, appending a new entry if the index is unseen.
    pub fn set(&mut self, index: u32, value: f64) {
        match self.positions.get(&index) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.positions.insert(index, self.entries.len());
                self.entries.push((index, value));
            }
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.entries.iter().copied()
    }

    /// Whether every stored value is finite.
    pub fn is_finite(&self) -> bool {
        self.entries.iter().all(|&(_, value)| value.is_finite())
    }

    /// One past the largest stored index.
    pub fn dimension(&self) -> usize {
        self.entries
            .iter()
            .map(|&(index, _)| index as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Dense copy with `dim` components; entries beyond `dim` are dropped.
    pub fn to_dense(&self, dim: usize) -> Vec<f64> {
        let mut dense = vec![0.0; dim];
        for &(index, value) in &self.entries {
            if let Some(slot) = dense.get_mut(index as usize) {
                *slot = value;
            }
        }
        dense
    }

    /// `self += other * scale`.
    pub fn add_scaled(&mut self, other: &SparseVector, scale: f64) {
        for (index, value) in other.iter() {
            let current = self.get(index);
            self.set(index, current + value * scale);
        }
    }

    /// Copy of `self` multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> SparseVector {
        let mut out = self.clone();
        for entry in &mut out.entries {
            entry.1 *= factor;
        }
        out
    }

    /// Visit every index present in either vector with both values.
    pub fn for_each_pair(&self, other: &SparseVector, mut f: impl FnMut(f64, f64)) {
        for &(index, value) in &self.entries {
            f(value, other.get(index));
        }
        for &(index, value) in &other.entries {
            if !self.contains(index) {
                f(0.0, value);
            }
        }
    }

    fn position(&self, index: u32) -> Option<usize> {
        self.positions.get(&index).copied()
    }
}

impl PartialEq for SparseVector {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl From<Vec<(u32, f64)>> for SparseVector {
    fn from(entries: Vec<(u32, f64)>) -> Self {
        let mut vector = Self::with_capacity(entries.len());
        for (index, value) in entries {
            vector.set(index, value);
        }
        vector
    }
}

impl From<SparseVector> for Vec<(u32, f64)> {
    fn from(vector: SparseVector) -> Self {
        vector.entries
    }
}

impl FromIterator<(u32, f64)> for SparseVector {
    fn from_iter<I: IntoIterator<Item = (u32, f64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (index, value) in iter {
            vector.set(index, value);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_insertion_order_and_overwrites_in_place() {
        let mut v = SparseVector::new();
        v.set(7, 1.0);
        v.set(2, 2.0);
        v.set(7, 3.0);
        let entries: Vec<_> = v.iter().collect();
        assert_eq!(entries, vec![(7, 3.0), (2, 2.0)]);
        assert_eq!(v.get(5), 0.0);
        assert_eq!(v.dimension(), 8);
    }

    #[test]
    fn add_scaled_merges_disjoint_indices() {
        let mut a: SparseVector = vec![(0, 1.0), (3, 2.0)].into();
        let b: SparseVector = vec![(3, 1.0), (4, 4.0)].into();
        a.add_scaled(&b, 0.5);
        assert_eq!(a.to_dense(5), vec![1.0, 0.0, 0.0, 2.5, 2.0]);
    }

    #[test]
    fn for_each_pair_visits_union_once() {
        let a: SparseVector = vec![(0, 1.0), (1, 2.0)].into();
        let b: SparseVector = vec![(1, 5.0), (2, 3.0)].into();
        let mut seen = Vec::new();
        a.for_each_pair(&b, |x, y| seen.push((x, y)));
        assert_eq!(seen, vec![(1.0, 0.0), (2.0, 5.0), (0.0, 3.0)]);
    }

    #[test]
    fn from_dense_skips_zeros() {
        let v = SparseVector::from_dense(&[0.0, 1.5, 0.0, -2.0]);
        assert_eq!(v.len(), 2);
        assert_eq!(v.get(3), -2.0);
    }

    #[test]
    fn serde_uses_entry_list() {
        let v: SparseVector = vec![(4, 1.0), (1, 2.0)].into();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[[4,1.0],[1,2.0]]");
        let back: SparseVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
