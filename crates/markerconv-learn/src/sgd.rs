use markerconv_arch::Layer;
use markerconv_bank::{BankStats, KernelBank};
use markerconv_cluster::{KMeansGrouping, PatchGrouping};
use markerconv_core::{ModelError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;

use crate::estimator::unit_normalized;
use crate::sampler::MarkerPatches;

// ─── Options ────────────────────────────────────────────────────────────────

/// Where the kernels start before the hinge updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SgdInit {
    /// Joint K-Means centroids of the normalized patches, unit-normalized.
    FromClustering,
    /// Xavier-uniform weights.
    Random,
}

#[derive(Debug, Clone)]
pub struct SgdOptions {
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub margin: f32,
    pub tol: f32,
    pub seed: u64,
    pub init: SgdInit,
}

impl Default for SgdOptions {
    fn default() -> Self {
        SgdOptions {
            epochs: 100,
            learning_rate: 0.01,
            momentum: 0.9,
            margin: 1.0,
            tol: 1e-4,
            seed: 0,
            init: SgdInit::FromClustering,
        }
    }
}

/// Per-epoch hinge loss observed during training.
#[derive(Debug, Clone, PartialEq)]
pub struct SgdReport {
    pub epoch_losses: Vec<f32>,
}

// ─── Estimator ──────────────────────────────────────────────────────────────

/// Refines a layer's kernels by margin-based updates: each kernel is tied
/// to one marker label and its response `w·p + b` is pushed above the
/// margin on its own label's patches and below it elsewhere.
///
/// Training runs on z-scored patches; the channel statistics are folded
/// into the weights and the per-kernel bias afterwards, so the stored bank
/// convolves raw inputs directly.
pub struct SgdEstimator {
    options: SgdOptions,
}

impl SgdEstimator {
    pub fn new(options: SgdOptions) -> Self {
        SgdEstimator { options }
    }

    fn check_options(&self) -> Result<()> {
        let o = &self.options;
        if o.epochs == 0 {
            return Err(ModelError::Config("epochs must be positive".into()));
        }
        if o.learning_rate <= 0.0 {
            return Err(ModelError::Config(format!(
                "learning rate must be positive, got {}",
                o.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&o.momentum) {
            return Err(ModelError::Config(format!(
                "momentum must lie in [0, 1), got {}",
                o.momentum
            )));
        }
        if o.margin <= 0.0 {
            return Err(ModelError::Config(format!(
                "margin must be positive, got {}",
                o.margin
            )));
        }
        if o.tol < 0.0 {
            return Err(ModelError::Config(format!(
                "tolerance must be non-negative, got {}",
                o.tol
            )));
        }
        Ok(())
    }

    pub fn estimate_layer(
        &self,
        per_image: &[MarkerPatches],
        layer: &Layer,
        stdev_factor: f32,
    ) -> Result<KernelBank> {
        self.estimate_layer_with_report(per_image, layer, stdev_factor)
            .map(|(bank, _)| bank)
    }

    pub fn estimate_layer_with_report(
        &self,
        per_image: &[MarkerPatches],
        layer: &Layer,
        stdev_factor: f32,
    ) -> Result<(KernelBank, SgdReport)> {
        self.check_options()?;
        let first = per_image
            .first()
            .ok_or_else(|| ModelError::Data("no images to estimate kernels from".into()))?;
        let nbands = first.nbands();
        let patch_len = first.patch_len();
        for p in per_image {
            if p.nbands() != nbands || p.patch_len() != patch_len {
                return Err(ModelError::Dimension {
                    expected: vec![nbands, patch_len],
                    got: vec![p.nbands(), p.patch_len()],
                    context: "marker patches across images".into(),
                });
            }
        }

        // Channel statistics over every image's valid marker samples, so
        // all patches are z-scored into one shared space.
        let mut sum = vec![0.0f32; nbands];
        let mut sumsq = vec![0.0f32; nbands];
        let mut count = 0usize;
        for p in per_image {
            count += p.accumulate_band_moments(&mut sum, &mut sumsq);
        }
        if count == 0 {
            return Err(ModelError::Data("no valid marker samples".into()));
        }
        let n = count as f32;
        let mean: Vec<f32> = sum.iter().map(|s| s / n).collect();
        let stdev: Vec<f32> = sumsq
            .iter()
            .zip(&mean)
            .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
            .collect();

        let mut samples: Vec<Vec<f32>> = Vec::new();
        let mut sample_labels: Vec<u32> = Vec::new();
        for p in per_image {
            samples.extend(p.normalized_with(&mean, &stdev, stdev_factor)?);
            sample_labels.extend_from_slice(p.patch_labels());
        }
        let distinct: Vec<u32> = sample_labels
            .iter()
            .copied()
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();

        let noutput = layer.noutput_channels;
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let mut kernels: Vec<Vec<f32>> = match self.options.init {
            SgdInit::FromClustering => {
                if samples.len() < noutput {
                    return Err(ModelError::Data(format!(
                        "{} patches cannot seed {noutput} kernels",
                        samples.len()
                    )));
                }
                KMeansGrouping::new(self.options.seed)
                    .group(&samples, noutput)?
                    .into_iter()
                    .map(unit_normalized)
                    .collect()
            }
            SgdInit::Random => {
                let scale = (6.0 / (patch_len + noutput) as f32).sqrt();
                (0..noutput)
                    .map(|_| {
                        (0..patch_len)
                            .map(|_| (rand::Rng::gen::<f32>(&mut rng) * 2.0 - 1.0) * scale)
                            .collect()
                    })
                    .collect()
            }
        };
        let kernel_labels = match self.options.init {
            SgdInit::FromClustering => {
                assign_by_response(&kernels, &samples, &sample_labels, &distinct)
            }
            SgdInit::Random => (0..noutput).map(|k| distinct[k % distinct.len()]).collect(),
        };

        let mut biases = vec![0.0f32; noutput];
        let mut velocity = vec![vec![0.0f32; patch_len]; noutput];
        let mut bias_velocity = vec![0.0f32; noutput];
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut epoch_losses = Vec::new();
        let mut prev_loss = f32::INFINITY;
        for _epoch in 0..self.options.epochs {
            order.shuffle(&mut rng);
            let mut loss = 0.0f32;
            for &i in &order {
                let sample = &samples[i];
                for k in 0..noutput {
                    let y = if sample_labels[i] == kernel_labels[k] {
                        1.0
                    } else {
                        -1.0
                    };
                    let r = dot(&kernels[k], sample) + biases[k];
                    if y * r < self.options.margin {
                        loss += self.options.margin - y * r;
                        let v = &mut velocity[k];
                        for j in 0..patch_len {
                            v[j] = self.options.momentum * v[j]
                                + self.options.learning_rate * y * sample[j];
                            kernels[k][j] += v[j];
                        }
                        bias_velocity[k] = self.options.momentum * bias_velocity[k]
                            + self.options.learning_rate * y;
                        biases[k] += bias_velocity[k];
                    }
                }
            }
            epoch_losses.push(loss);
            if loss == 0.0 {
                break;
            }
            if prev_loss.is_finite() && (prev_loss - loss).abs() <= self.options.tol * prev_loss {
                break;
            }
            prev_loss = loss;
        }
        tracing::info!(
            epochs = epoch_losses.len(),
            loss = epoch_losses.last().copied().unwrap_or(0.0),
            nkernels = noutput,
            "hinge training finished"
        );

        let bank = fold_channel_stats(&kernels, &biases, &mean, &stdev, stdev_factor, nbands)?;
        Ok((bank, SgdReport { epoch_losses }))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Tie each kernel to the label whose normalized patches it responds to
/// most strongly on average.
fn assign_by_response(
    kernels: &[Vec<f32>],
    samples: &[Vec<f32>],
    labels: &[u32],
    distinct: &[u32],
) -> Vec<u32> {
    kernels
        .iter()
        .map(|w| {
            let mut best = distinct[0];
            let mut best_mean = f32::NEG_INFINITY;
            for &l in distinct {
                let mut acc = 0.0f32;
                let mut c = 0usize;
                for (s, &sl) in samples.iter().zip(labels) {
                    if sl == l {
                        acc += dot(w, s);
                        c += 1;
                    }
                }
                let m = acc / c as f32;
                if m > best_mean {
                    best_mean = m;
                    best = l;
                }
            }
            best
        })
        .collect()
}

/// Rewrite kernels trained on z-scored patches so they act on raw inputs:
/// the per-channel divisor moves into the weights and the mean subtraction
/// joins the trained bias.
fn fold_channel_stats(
    kernels: &[Vec<f32>],
    trained_bias: &[f32],
    mean: &[f32],
    stdev: &[f32],
    stdev_factor: f32,
    nbands: usize,
) -> Result<KernelBank> {
    let patch_len = kernels.first().map(|k| k.len()).unwrap_or(0);
    let mut weights = Vec::with_capacity(kernels.len() * patch_len);
    let mut bias = vec![0.0f32; kernels.len()];
    for (k, w) in kernels.iter().enumerate() {
        let mut b = trained_bias[k];
        for (j, &wj) in w.iter().enumerate() {
            let band = j % nbands;
            let sigma = stdev[band] + stdev_factor;
            weights.push(wj / sigma);
            b -= wj * mean[band] / sigma;
        }
        bias[k] = b;
    }
    KernelBank::new(weights, kernels.len(), patch_len, BankStats::Bias { bias })
}
