use crate::error::{ModelError, Result};
use crate::grid::{GridShape, Voxel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A user-annotated voxel carrying a class label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker {
    pub voxel: Voxel,
    pub label: u32,
}

impl Marker {
    pub fn new(voxel: Voxel, label: u32) -> Self {
        Marker { voxel, label }
    }
}

/// The set of markers drawn on one image. Order is preserved as given;
/// label-wise iteration keeps that order within each label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new(markers: Vec<Marker>) -> Self {
        MarkerSet { markers }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// Distinct labels in ascending order.
    pub fn labels(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.markers.iter().map(|m| m.label).collect();
        set.into_iter().collect()
    }

    pub fn with_label(&self, label: u32) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(move |m| m.label == label)
    }

    /// Rejects empty sets and markers lying outside `shape`.
    pub fn check_within(&self, shape: GridShape) -> Result<()> {
        if self.markers.is_empty() {
            return Err(ModelError::Data("marker set is empty".into()));
        }
        for m in &self.markers {
            if !shape.contains(m.voxel) {
                return Err(ModelError::Data(format!(
                    "marker ({}, {}, {}) lies outside the {} grid",
                    m.voxel.x, m.voxel.y, m.voxel.z, shape
                )));
            }
        }
        Ok(())
    }

    /// Markers mapped onto the grid obtained by stride subsampling: each
    /// coordinate is divided by `stride` and exact duplicates are dropped,
    /// keeping first occurrences.
    pub fn rescaled(&self, stride: usize) -> MarkerSet {
        if stride <= 1 {
            return self.clone();
        }
        let mut seen = BTreeSet::new();
        let mut markers = Vec::with_capacity(self.markers.len());
        for m in &self.markers {
            let v = Voxel::new(m.voxel.x / stride, m.voxel.y / stride, m.voxel.z / stride);
            if seen.insert((v.x, v.y, v.z, m.label)) {
                markers.push(Marker::new(v, m.label));
            }
        }
        MarkerSet { markers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MarkerSet {
        MarkerSet::new(vec![
            Marker::new(Voxel::new(2, 3, 0), 2),
            Marker::new(Voxel::new(1, 1, 0), 1),
            Marker::new(Voxel::new(3, 3, 0), 2),
            Marker::new(Voxel::new(0, 0, 0), 1),
        ])
    }

    #[test]
    fn labels_are_sorted_and_unique() {
        assert_eq!(sample().labels(), vec![1, 2]);
        assert_eq!(sample().with_label(2).count(), 2);
    }

    #[test]
    fn check_within_flags_empty_and_out_of_grid() {
        let empty = MarkerSet::default();
        assert!(matches!(
            empty.check_within(GridShape::new_2d(4, 4)),
            Err(ModelError::Data(_))
        ));
        let set = sample();
        assert!(set.check_within(GridShape::new_2d(4, 4)).is_ok());
        assert!(set.check_within(GridShape::new_2d(3, 3)).is_err());
    }

    #[test]
    fn rescaling_divides_and_deduplicates() {
        let set = sample().rescaled(2);
        // (2,3) and (3,3) with label 2 both map to (1,1); the two label-1
        // markers both map to (0,0).
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![
                Marker::new(Voxel::new(1, 1, 0), 2),
                Marker::new(Voxel::new(0, 0, 0), 1),
            ]
        );
    }
}
