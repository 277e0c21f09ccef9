use markerconv_core::{AdjRel, MarkerSet, ModelError, MultibandImage, Result};
use std::collections::BTreeMap;

/// The patches gathered at one image's markers, with the per-channel
/// statistics of that image's marked neighborhoods.
///
/// Patch vectors are offset-major, band-minor: entry `a * nbands + b` holds
/// channel `b` at the `a`-th adjacency offset. Offsets falling outside the
/// grid contribute zeros and are excluded from the statistics.
pub struct MarkerPatches {
    patches: Vec<Vec<f32>>,
    labels: Vec<u32>,
    padded: Vec<Vec<bool>>,
    band_mean: Vec<f32>,
    band_stdev: Vec<f32>,
    nbands: usize,
    adj_len: usize,
}

impl MarkerPatches {
    /// Gather one raw patch per marker. Pure over its inputs; fails with a
    /// data error when the marker set is empty or leaves the grid.
    pub fn gather(image: &MultibandImage, markers: &MarkerSet, adj: &AdjRel) -> Result<Self> {
        markers.check_within(image.shape())?;
        let shape = image.shape();
        let nbands = image.nbands();

        let mut patches = Vec::with_capacity(markers.len());
        let mut labels = Vec::with_capacity(markers.len());
        let mut padded = Vec::with_capacity(markers.len());
        let mut sum = vec![0.0f32; nbands];
        let mut sumsq = vec![0.0f32; nbands];
        let mut nvalid = 0usize;

        for m in markers.iter() {
            let mut patch = Vec::with_capacity(adj.len() * nbands);
            let mut pad = Vec::with_capacity(adj.len());
            for o in adj.iter() {
                match shape.shifted(m.voxel, o.dx, o.dy, o.dz) {
                    Some(q) => {
                        let bands = image.bands_at(shape.index_of(q));
                        for (b, &v) in bands.iter().enumerate() {
                            patch.push(v);
                            sum[b] += v;
                            sumsq[b] += v * v;
                        }
                        pad.push(false);
                        nvalid += 1;
                    }
                    None => {
                        patch.resize(patch.len() + nbands, 0.0);
                        pad.push(true);
                    }
                }
            }
            patches.push(patch);
            labels.push(m.label);
            padded.push(pad);
        }

        if nvalid == 0 {
            return Err(ModelError::Data(
                "no marker neighborhood overlaps the grid".into(),
            ));
        }
        let n = nvalid as f32;
        let band_mean: Vec<f32> = sum.iter().map(|s| s / n).collect();
        let band_stdev: Vec<f32> = sumsq
            .iter()
            .zip(&band_mean)
            .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
            .collect();

        Ok(MarkerPatches {
            patches,
            labels,
            padded,
            band_mean,
            band_stdev,
            nbands,
            adj_len: adj.len(),
        })
    }

    pub fn n_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn patch_len(&self) -> usize {
        self.adj_len * self.nbands
    }

    pub fn nbands(&self) -> usize {
        self.nbands
    }

    pub fn raw_patches(&self) -> &[Vec<f32>] {
        &self.patches
    }

    pub fn patch_labels(&self) -> &[u32] {
        &self.labels
    }

    /// Distinct marker labels in ascending order.
    pub fn labels(&self) -> Vec<u32> {
        let set: std::collections::BTreeSet<u32> = self.labels.iter().copied().collect();
        set.into_iter().collect()
    }

    pub fn band_mean(&self) -> &[f32] {
        &self.band_mean
    }

    pub fn band_stdev(&self) -> &[f32] {
        &self.band_stdev
    }

    /// Fold this image's raw moments into cross-image accumulators.
    /// Returns how many valid offset samples were added.
    pub fn accumulate_band_moments(&self, sum: &mut [f32], sumsq: &mut [f32]) -> usize {
        let mut added = 0;
        for (patch, pad) in self.patches.iter().zip(&self.padded) {
            for (a, &is_pad) in pad.iter().enumerate() {
                if is_pad {
                    continue;
                }
                added += 1;
                for b in 0..self.nbands {
                    let v = patch[a * self.nbands + b];
                    sum[b] += v;
                    sumsq[b] += v * v;
                }
            }
        }
        added
    }

    /// Patches z-scored with the given per-channel statistics; the divisor
    /// is `stdev + stdev_factor`, so a positive factor keeps near-constant
    /// channels finite. Padded entries stay exactly zero.
    pub fn normalized_with(
        &self,
        mean: &[f32],
        stdev: &[f32],
        stdev_factor: f32,
    ) -> Result<Vec<Vec<f32>>> {
        if stdev_factor <= 0.0 {
            return Err(ModelError::Config(format!(
                "stdev_factor must be positive, got {stdev_factor}"
            )));
        }
        if mean.len() != self.nbands || stdev.len() != self.nbands {
            return Err(ModelError::Dimension {
                expected: vec![self.nbands],
                got: vec![mean.len(), stdev.len()],
                context: "channel statistics".into(),
            });
        }
        let out = self
            .patches
            .iter()
            .zip(&self.padded)
            .map(|(patch, pad)| {
                let mut q = vec![0.0f32; patch.len()];
                for (a, &is_pad) in pad.iter().enumerate() {
                    if is_pad {
                        continue;
                    }
                    for b in 0..self.nbands {
                        let i = a * self.nbands + b;
                        q[i] = (patch[i] - mean[b]) / (stdev[b] + stdev_factor);
                    }
                }
                q
            })
            .collect();
        Ok(out)
    }

    /// Patches z-scored with this image's own marker statistics.
    pub fn normalized(&self, stdev_factor: f32) -> Result<Vec<Vec<f32>>> {
        self.normalized_with(&self.band_mean, &self.band_stdev, stdev_factor)
    }

    /// Normalized patches keyed by marker label, ascending.
    pub fn normalized_by_label(&self, stdev_factor: f32) -> Result<BTreeMap<u32, Vec<Vec<f32>>>> {
        let all = self.normalized(stdev_factor)?;
        let mut by_label: BTreeMap<u32, Vec<Vec<f32>>> = BTreeMap::new();
        for (patch, &label) in all.into_iter().zip(&self.labels) {
            by_label.entry(label).or_default().push(patch);
        }
        Ok(by_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use markerconv_core::{Marker, Voxel};

    fn ramp_image() -> MultibandImage {
        MultibandImage::from_rows_2d(&[
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
            vec![7.0, 8.0, 9.0],
        ])
        .unwrap()
    }

    fn cross_markers() -> MarkerSet {
        MarkerSet::new(vec![
            Marker::new(Voxel::new(1, 1, 0), 1),
            Marker::new(Voxel::new(0, 0, 0), 2),
        ])
    }

    #[test]
    fn patches_follow_offset_order_with_zero_padding() {
        let adj = AdjRel::kernel([3, 3, 1], [1, 1, 1], 1, false).unwrap();
        let got = MarkerPatches::gather(&ramp_image(), &cross_markers(), &adj).unwrap();

        assert_eq!(got.n_patches(), 2);
        assert_eq!(got.patch_len(), 9);
        assert_eq!(
            got.raw_patches()[0],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );
        // The corner marker pads the five offsets that leave the grid.
        assert_eq!(
            got.raw_patches()[1],
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 4.0, 5.0]
        );
        assert_eq!(got.patch_labels(), &[1, 2]);
        assert_eq!(got.labels(), vec![1, 2]);
    }

    #[test]
    fn statistics_ignore_padded_entries() {
        let adj = AdjRel::kernel([3, 3, 1], [1, 1, 1], 1, false).unwrap();
        let got = MarkerPatches::gather(&ramp_image(), &cross_markers(), &adj).unwrap();

        // 9 valid samples at the center plus 4 at the corner.
        let mean = (45.0 + 1.0 + 2.0 + 4.0 + 5.0) / 13.0;
        assert_relative_eq!(got.band_mean()[0], mean, epsilon = 1e-5);
        assert!(got.band_stdev()[0] > 0.0);

        let mut sum = vec![0.0];
        let mut sumsq = vec![0.0];
        assert_eq!(got.accumulate_band_moments(&mut sum, &mut sumsq), 13);
        assert_relative_eq!(sum[0], 57.0, epsilon = 1e-4);
    }

    #[test]
    fn normalization_keeps_padding_at_zero() {
        let adj = AdjRel::kernel([3, 3, 1], [1, 1, 1], 1, false).unwrap();
        let got = MarkerPatches::gather(&ramp_image(), &cross_markers(), &adj).unwrap();
        let norm = got.normalized(0.01).unwrap();

        let mean = got.band_mean()[0];
        let div = got.band_stdev()[0] + 0.01;
        assert_relative_eq!(norm[0][0], (1.0 - mean) / div, epsilon = 1e-5);
        assert_relative_eq!(norm[1][0], 0.0);
        assert_relative_eq!(norm[1][4], (1.0 - mean) / div, epsilon = 1e-5);
    }

    #[test]
    fn by_label_grouping_preserves_patch_order() {
        let adj = AdjRel::kernel([1, 1, 1], [1, 1, 1], 1, false).unwrap();
        let markers = MarkerSet::new(vec![
            Marker::new(Voxel::new(0, 0, 0), 2),
            Marker::new(Voxel::new(1, 0, 0), 1),
            Marker::new(Voxel::new(2, 0, 0), 2),
        ]);
        let got = MarkerPatches::gather(&ramp_image(), &markers, &adj).unwrap();
        let by_label = got.normalized_by_label(0.5).unwrap();

        assert_eq!(by_label.len(), 2);
        assert_eq!(by_label[&1].len(), 1);
        assert_eq!(by_label[&2].len(), 2);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let adj = AdjRel::kernel([3, 3, 1], [1, 1, 1], 1, false).unwrap();
        let empty = MarkerSet::default();
        assert!(matches!(
            MarkerPatches::gather(&ramp_image(), &empty, &adj),
            Err(ModelError::Data(_))
        ));

        let got = MarkerPatches::gather(&ramp_image(), &cross_markers(), &adj).unwrap();
        assert!(matches!(
            got.normalized(0.0),
            Err(ModelError::Config(_))
        ));
        assert!(matches!(
            got.normalized(-1.0),
            Err(ModelError::Config(_))
        ));
    }
}
