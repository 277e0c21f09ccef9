use markerconv_arch::Layer;
use markerconv_bank::{BankStats, KernelBank};
use markerconv_cluster::{DensityGrouping, KMeansGrouping, PatchGrouping};
use markerconv_core::{ModelError, Result};
use rayon::prelude::*;

use crate::sampler::MarkerPatches;

// ─── Options ────────────────────────────────────────────────────────────────

/// How each image's marker patches are reduced to candidate kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GroupingMethod {
    /// K-Means centroids.
    Centroid,
    /// Density cluster means; clusters below `min_samples` count as noise.
    Density { eps: f32, min_samples: usize },
}

/// Whether candidates are drawn separately per marker label or from all
/// labels jointly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LabelGrouping {
    PerLabel,
    Joint,
}

#[derive(Debug, Clone)]
pub struct ClusteringOptions {
    pub grouping: GroupingMethod,
    pub label_grouping: LabelGrouping,
    pub seed: u64,
}

impl Default for ClusteringOptions {
    fn default() -> Self {
        ClusteringOptions {
            grouping: GroupingMethod::Centroid,
            label_grouping: LabelGrouping::PerLabel,
            seed: 0,
        }
    }
}

// ─── Estimator ──────────────────────────────────────────────────────────────

/// Estimates a layer's kernel bank by clustering normalized marker patches:
/// candidates per image, then a cross-image consensus reduction to exactly
/// the layer's output channel count.
pub struct ClusteringEstimator {
    options: ClusteringOptions,
}

impl ClusteringEstimator {
    pub fn new(options: ClusteringOptions) -> Self {
        ClusteringEstimator { options }
    }

    fn grouper(&self) -> Box<dyn PatchGrouping> {
        match self.options.grouping {
            GroupingMethod::Centroid => Box::new(KMeansGrouping::new(self.options.seed)),
            GroupingMethod::Density { eps, min_samples } => {
                Box::new(DensityGrouping::new(eps, min_samples))
            }
        }
    }

    /// Candidate kernels for one image: group its normalized patches, cap
    /// the result at `nkernels_per_image`, and unit-normalize.
    fn image_candidates(
        &self,
        patches: &MarkerPatches,
        layer: &Layer,
        stdev_factor: f32,
    ) -> Result<Vec<Vec<f32>>> {
        let grouper = self.grouper();
        let mut candidates: Vec<Vec<f32>> = Vec::new();
        match self.options.label_grouping {
            LabelGrouping::PerLabel => {
                for (_, group) in patches.normalized_by_label(stdev_factor)? {
                    let ngroups = layer.nkernels_per_marker.min(group.len());
                    candidates.extend(grouper.group(&group, ngroups)?);
                }
            }
            LabelGrouping::Joint => {
                let all = patches.normalized(stdev_factor)?;
                let ngroups = layer.nkernels_per_marker.min(all.len());
                candidates.extend(grouper.group(&all, ngroups)?);
            }
        }
        if candidates.len() > layer.nkernels_per_image {
            candidates = KMeansGrouping::new(self.options.seed)
                .group(&candidates, layer.nkernels_per_image)?;
        }
        Ok(candidates.into_iter().map(unit_normalized).collect())
    }

    /// Estimate the bank for one layer from every image's marker patches.
    ///
    /// Fewer pooled candidates than output channels is a data error; a
    /// surplus is reduced by K-Means consensus to exactly the requested
    /// count. Response statistics are measured over the raw patches of all
    /// images, so one image's contrast does not skew the bank.
    pub fn estimate_layer(
        &self,
        per_image: &[MarkerPatches],
        layer: &Layer,
        stdev_factor: f32,
    ) -> Result<KernelBank> {
        if per_image.is_empty() {
            return Err(ModelError::Data("no images to estimate kernels from".into()));
        }
        let candidates: Vec<Vec<Vec<f32>>> = per_image
            .par_iter()
            .map(|p| self.image_candidates(p, layer, stdev_factor))
            .collect::<Result<_>>()?;
        let mut pool: Vec<Vec<f32>> = candidates.into_iter().flatten().collect();
        tracing::debug!(
            candidates = pool.len(),
            noutput = layer.noutput_channels,
            "pooled candidate kernels"
        );

        let noutput = layer.noutput_channels;
        if pool.len() < noutput {
            return Err(ModelError::Data(format!(
                "{} candidate kernels cannot fill {noutput} output channels",
                pool.len()
            )));
        }
        if pool.len() > noutput {
            pool = KMeansGrouping::new(self.options.seed).group(&pool, noutput)?;
            if pool.len() < noutput {
                return Err(ModelError::Data(format!(
                    "consensus grouping kept {} of {noutput} kernels",
                    pool.len()
                )));
            }
        }
        let kernels: Vec<Vec<f32>> = pool.into_iter().map(unit_normalized).collect();
        bank_from_kernels(&kernels, per_image, stdev_factor)
    }
}

pub(crate) fn unit_normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Attach z-scoring statistics to a set of kernels: for each kernel, the
/// mean and spread of its raw dot-product response across every image's
/// raw patches, the spread floored by `stdev_factor`.
fn bank_from_kernels(
    kernels: &[Vec<f32>],
    per_image: &[MarkerPatches],
    stdev_factor: f32,
) -> Result<KernelBank> {
    let nkernels = kernels.len();
    let kernel_len = kernels
        .first()
        .map(|k| k.len())
        .ok_or_else(|| ModelError::Data("no kernels to finish into a bank".into()))?;

    let mut mean = vec![0.0f32; nkernels];
    let mut sumsq = vec![0.0f32; nkernels];
    let mut count = 0usize;
    for patches in per_image {
        for p in patches.raw_patches() {
            if p.len() != kernel_len {
                return Err(ModelError::Dimension {
                    expected: vec![kernel_len],
                    got: vec![p.len()],
                    context: "response statistics".into(),
                });
            }
            count += 1;
            for (k, w) in kernels.iter().enumerate() {
                let r: f32 = w.iter().zip(p.iter()).map(|(a, b)| a * b).sum();
                mean[k] += r;
                sumsq[k] += r * r;
            }
        }
    }
    if count == 0 {
        return Err(ModelError::Data("no patches for response statistics".into()));
    }
    let n = count as f32;
    let stdev: Vec<f32> = (0..nkernels)
        .map(|k| {
            mean[k] /= n;
            (sumsq[k] / n - mean[k] * mean[k]).max(0.0).sqrt() + stdev_factor
        })
        .collect();

    let weights: Vec<f32> = kernels.iter().flatten().copied().collect();
    KernelBank::new(
        weights,
        nkernels,
        kernel_len,
        BankStats::Normalization { mean, stdev },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use markerconv_arch::PoolType;
    use markerconv_core::{AdjRel, Marker, MarkerSet, MultibandImage, Voxel};

    fn point_layer(noutput: usize) -> Layer {
        Layer {
            kernel_size: [1, 1, 1],
            dilation_rate: [1, 1, 1],
            nkernels_per_image: 2,
            nkernels_per_marker: 1,
            noutput_channels: noutput,
            relu: false,
            pool_type: PoolType::NoPool,
            pool_size: [1, 1, 1],
            pool_stride: 1,
            skip_connections: Vec::new(),
        }
    }

    fn two_tone_patches() -> MarkerPatches {
        let image = MultibandImage::from_rows_2d(&[vec![-1.0, -1.0, 3.0, 3.0]]).unwrap();
        let markers = MarkerSet::new(vec![
            Marker::new(Voxel::new(0, 0, 0), 1),
            Marker::new(Voxel::new(1, 0, 0), 1),
            Marker::new(Voxel::new(2, 0, 0), 2),
            Marker::new(Voxel::new(3, 0, 0), 2),
        ]);
        let adj = AdjRel::kernel([1, 1, 1], [1, 1, 1], 1, false).unwrap();
        MarkerPatches::gather(&image, &markers, &adj).unwrap()
    }

    #[test]
    fn per_label_centroids_become_signed_unit_kernels() {
        let estimator = ClusteringEstimator::new(ClusteringOptions::default());
        let bank = estimator
            .estimate_layer(&[two_tone_patches()], &point_layer(2), 0.5)
            .unwrap();

        assert_eq!(bank.nkernels(), 2);
        assert_eq!(bank.kernel_len(), 1);
        // Labels are visited in ascending order, so the dark kernel is first.
        assert_relative_eq!(bank.kernel(0)[0], -1.0, epsilon = 1e-5);
        assert_relative_eq!(bank.kernel(1)[0], 1.0, epsilon = 1e-5);

        // Raw responses of kernel 1 over [-1, -1, 3, 3]: mean 1, stdev 2,
        // plus the 0.5 floor.
        match bank.stats() {
            BankStats::Normalization { mean, stdev } => {
                assert_relative_eq!(mean[1], 1.0, epsilon = 1e-5);
                assert_relative_eq!(stdev[1], 2.5, epsilon = 1e-5);
                assert_relative_eq!(mean[0], -1.0, epsilon = 1e-5);
                assert_relative_eq!(stdev[0], 2.5, epsilon = 1e-5);
            }
            other => panic!("expected normalization stats, got {other:?}"),
        }
    }

    #[test]
    fn joint_grouping_separates_the_same_tones() {
        let options = ClusteringOptions {
            label_grouping: LabelGrouping::Joint,
            ..ClusteringOptions::default()
        };
        let mut layer = point_layer(2);
        layer.nkernels_per_marker = 2;
        let bank = ClusteringEstimator::new(options)
            .estimate_layer(&[two_tone_patches()], &layer, 0.5)
            .unwrap();

        let mut values: Vec<f32> = (0..2).map(|k| bank.kernel(k)[0]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(values[0], -1.0, epsilon = 1e-5);
        assert_relative_eq!(values[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn consensus_reduces_candidates_from_many_images() {
        let estimator = ClusteringEstimator::new(ClusteringOptions::default());
        let per_image = vec![two_tone_patches(), two_tone_patches(), two_tone_patches()];
        let bank = estimator
            .estimate_layer(&per_image, &point_layer(2), 0.5)
            .unwrap();

        assert_eq!(bank.nkernels(), 2);
        let mut values: Vec<f32> = (0..2).map(|k| bank.kernel(k)[0]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(values[0], -1.0, epsilon = 1e-5);
        assert_relative_eq!(values[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn too_few_candidates_is_a_data_error() {
        let estimator = ClusteringEstimator::new(ClusteringOptions::default());
        let got = estimator.estimate_layer(&[two_tone_patches()], &point_layer(5), 0.5);
        assert!(matches!(got, Err(ModelError::Data(_))));

        let none: Vec<MarkerPatches> = Vec::new();
        assert!(matches!(
            estimator.estimate_layer(&none, &point_layer(1), 0.5),
            Err(ModelError::Data(_))
        ));
    }
}
