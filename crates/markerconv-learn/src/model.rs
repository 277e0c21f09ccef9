use markerconv_arch::{Architecture, Layer};
use markerconv_bank::{KernelBank, ParamStore};
use markerconv_core::{AdjRel, MarkerSet, ModelError, MultibandImage, Result};
use markerconv_pipeline::{ExecutionBackend, ForwardPass, ResolutionPolicy};
use rayon::prelude::*;

use crate::estimator::{ClusteringEstimator, ClusteringOptions};
use crate::sampler::MarkerPatches;
use crate::sgd::{SgdEstimator, SgdOptions};

/// One annotated image of the training set.
#[derive(Debug, Clone)]
pub struct TrainingImage {
    pub id: String,
    pub image: MultibandImage,
    pub markers: MarkerSet,
}

impl TrainingImage {
    pub fn new<S: Into<String>>(id: S, image: MultibandImage, markers: MarkerSet) -> Self {
        TrainingImage {
            id: id.into(),
            image,
            markers,
        }
    }
}

/// Which estimator turns a layer's marker patches into its kernel bank.
#[derive(Debug, Clone)]
pub enum EstimationStrategy {
    Clustering(ClusteringOptions),
    GradientDescent(SgdOptions),
}

fn estimate(
    strategy: &EstimationStrategy,
    patches: &[MarkerPatches],
    layer: &Layer,
    stdev_factor: f32,
) -> Result<KernelBank> {
    match strategy {
        EstimationStrategy::Clustering(o) => {
            ClusteringEstimator::new(o.clone()).estimate_layer(patches, layer, stdev_factor)
        }
        EstimationStrategy::GradientDescent(o) => {
            SgdEstimator::new(o.clone()).estimate_layer(patches, layer, stdev_factor)
        }
    }
}

fn check_inputs(inputs: &[TrainingImage]) -> Result<bool> {
    let first = inputs
        .first()
        .ok_or_else(|| ModelError::Data("no training images".into()))?;
    let dim3d = first.image.shape().is_3d();
    for t in inputs {
        if t.image.shape().is_3d() != dim3d {
            return Err(ModelError::Data(format!(
                "image '{}' mixes 2d and 3d grids in one training set",
                t.id
            )));
        }
        t.markers.check_within(t.image.shape())?;
    }
    Ok(dim3d)
}

fn gather_all(
    images: &[MultibandImage],
    markers: &[MarkerSet],
    adj: &AdjRel,
) -> Result<Vec<MarkerPatches>> {
    images
        .par_iter()
        .zip(markers.par_iter())
        .map(|(image, m)| MarkerPatches::gather(image, m, adj))
        .collect()
}

/// Learn every layer of the model in index order and persist each bank to
/// the store as it is finished.
///
/// After a layer's bank is estimated, all training images advance through
/// it so the next layer sees its true input features. When pooling reduces
/// the grid, the markers follow by integer coordinate division; under the
/// intrinsic-dilation regime the grid never shrinks and the markers stay
/// where the user drew them.
pub fn learn_model(
    arch: &Architecture,
    inputs: &[TrainingImage],
    strategy: &EstimationStrategy,
    store: &ParamStore,
    backend: &dyn ExecutionBackend,
) -> Result<()> {
    let dim3d = check_inputs(inputs)?;
    let policy = if arch.apply_intrinsic_atrous {
        ResolutionPolicy::Preserve
    } else {
        ResolutionPolicy::Reduce
    };
    let pass = ForwardPass::new(arch, backend, policy, dim3d);

    let mut current: Vec<MultibandImage> = inputs.iter().map(|t| t.image.clone()).collect();
    let mut history: Vec<Vec<MultibandImage>> = vec![Vec::new(); inputs.len()];
    let mut markers: Vec<MarkerSet> = inputs.iter().map(|t| t.markers.clone()).collect();

    for l in 0..arch.n_layers() {
        let layer = arch.layer(l)?;
        let adj = AdjRel::kernel(
            layer.kernel_size,
            layer.dilation_rate,
            arch.atrous_factor(l),
            dim3d,
        )?;

        tracing::info!(
            layer = l,
            nimages = inputs.len(),
            adj_len = adj.len(),
            "estimating kernel bank"
        );
        let patches = gather_all(&current, &markers, &adj)?;
        let bank = estimate(strategy, &patches, layer, arch.stdev_factor)?;
        store.save_layer(l, &bank)?;

        if l + 1 == arch.n_layers() {
            break;
        }
        let advanced: Vec<MultibandImage> = current
            .par_iter()
            .zip(history.par_iter())
            .map(|(image, earlier)| pass.apply_layer(l, image, earlier, &bank, None))
            .collect::<Result<_>>()?;
        for (h, out) in history.iter_mut().zip(&advanced) {
            h.push(out.clone());
        }
        current = advanced;

        if policy == ResolutionPolicy::Reduce && layer.pool_type.pools() && layer.pool_stride > 1 {
            markers = markers
                .iter()
                .map(|m| m.rescaled(layer.pool_stride))
                .collect();
        }
    }
    Ok(())
}

/// Learn a single layer's bank from images already advanced to that
/// layer's input, with the caller supplying the dilation accumulated on
/// the way there (1 when the grid was physically reduced). Layers with
/// skip connections are rejected: their output cannot be reproduced
/// without the earlier layers, so learning them in isolation would
/// desynchronize the model.
pub fn learn_layer(
    arch: &Architecture,
    layer_index: usize,
    inputs: &[TrainingImage],
    atrous_factor: usize,
    strategy: &EstimationStrategy,
) -> Result<KernelBank> {
    let layer = arch.layer(layer_index)?;
    if !layer.skip_connections.is_empty() {
        return Err(ModelError::Config(format!(
            "layer {layer_index} has skip connections and cannot be learned in isolation"
        )));
    }
    let dim3d = check_inputs(inputs)?;
    let adj = AdjRel::kernel(
        layer.kernel_size,
        layer.dilation_rate,
        atrous_factor,
        dim3d,
    )?;
    let images: Vec<MultibandImage> = inputs.iter().map(|t| t.image.clone()).collect();
    let markers: Vec<MarkerSet> = inputs.iter().map(|t| t.markers.clone()).collect();
    let patches = gather_all(&images, &markers, &adj)?;
    estimate(strategy, &patches, layer, arch.stdev_factor)
}
