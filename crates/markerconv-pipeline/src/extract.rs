use crate::backend::{Device, DeviceRegistry, ExecutionBackend};
use crate::batch::batch_size_for_device;
use crate::forward::{ForwardPass, ResolutionPolicy};
use markerconv_arch::Architecture;
use markerconv_bank::{KernelBank, ParamStore};
use markerconv_core::{ModelError, MultibandImage, ObjectMask, Result};
use rayon::prelude::*;

/// One image queued for feature extraction.
pub struct ExtractionInput {
    pub id: String,
    pub image: MultibandImage,
    pub mask: Option<ObjectMask>,
}

impl ExtractionInput {
    pub fn new<S: Into<String>>(id: S, image: MultibandImage) -> Self {
        ExtractionInput {
            id: id.into(),
            image,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: ObjectMask) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// Extraction result for one image. A failed image carries its error here
/// instead of aborting the run; images already extracted stay valid.
pub struct ExtractionOutcome {
    pub id: String,
    pub features: Result<MultibandImage>,
}

/// Run the full network over every input, in memory-bounded batches.
///
/// Kernel banks are loaded once and shared; a bad bank or an unavailable
/// device fails the whole run before any image is touched. Within a batch
/// the images run in parallel; batches run one after another so the peak
/// footprint respects the device budget.
pub fn extract_features(
    arch: &Architecture,
    store: &ParamStore,
    inputs: &[ExtractionInput],
    registry: &DeviceRegistry,
    device: Device,
) -> Result<Vec<ExtractionOutcome>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let backend = registry.resolve(device)?;
    let banks: Vec<KernelBank> = (0..arch.n_layers())
        .map(|l| store.load_layer(l))
        .collect::<Result<_>>()?;

    let nvoxels = inputs
        .iter()
        .map(|i| i.image.n_voxels())
        .max()
        .unwrap_or(0);
    let nchannels = inputs[0].image.nbands();
    let dim3d = inputs.iter().any(|i| i.image.shape().is_3d());
    let batch = batch_size_for_device(arch, nvoxels, nchannels, dim3d, backend.as_ref())?;
    tracing::info!(
        images = inputs.len(),
        batch,
        device = %device,
        "extracting features"
    );

    let mut outcomes = Vec::with_capacity(inputs.len());
    for chunk in inputs.chunks(batch) {
        let mut done: Vec<ExtractionOutcome> = chunk
            .par_iter()
            .map(|input| {
                let features = extract_one(arch, &banks, input, backend.as_ref());
                if let Err(e) = &features {
                    tracing::warn!(image = %input.id, error = %e, "feature extraction failed");
                }
                ExtractionOutcome {
                    id: input.id.clone(),
                    features,
                }
            })
            .collect();
        outcomes.append(&mut done);
    }
    Ok(outcomes)
}

fn extract_one(
    arch: &Architecture,
    banks: &[KernelBank],
    input: &ExtractionInput,
    backend: &dyn ExecutionBackend,
) -> Result<MultibandImage> {
    let pass = ForwardPass::new(
        arch,
        backend,
        ResolutionPolicy::Reduce,
        input.image.shape().is_3d(),
    );
    pass.run(&input.image, banks, input.mask.as_ref())
}

/// Apply a single stored layer to inputs that are already at that layer's
/// input resolution (typically saved activations of the previous layer).
/// Masks, when given, must be aligned to that same grid. Layers with skip
/// connections cannot run in isolation.
pub fn extract_from_layer(
    arch: &Architecture,
    store: &ParamStore,
    layer_index: usize,
    inputs: &[ExtractionInput],
    registry: &DeviceRegistry,
    device: Device,
) -> Result<Vec<ExtractionOutcome>> {
    let layer = arch.layer(layer_index)?;
    if !layer.skip_connections.is_empty() {
        return Err(ModelError::Config(format!(
            "layer {layer_index} has skip connections and cannot run in isolation"
        )));
    }
    let backend = registry.resolve(device)?;
    let bank = store.load_layer(layer_index)?;
    tracing::info!(images = inputs.len(), layer = layer_index, "extracting from one layer");

    let outcomes = inputs
        .par_iter()
        .map(|input| {
            let pass = ForwardPass::new(
                arch,
                backend.as_ref(),
                ResolutionPolicy::Reduce,
                input.image.shape().is_3d(),
            );
            let features =
                pass.apply_layer(layer_index, &input.image, &[], &bank, input.mask.as_ref());
            if let Err(e) = &features {
                tracing::warn!(image = %input.id, error = %e, "layer extraction failed");
            }
            ExtractionOutcome {
                id: input.id.clone(),
                features,
            }
        })
        .collect();
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use markerconv_arch::{Layer, PoolType};
    use markerconv_bank::BankStats;
    use markerconv_core::GridShape;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("markerconv_{tag}_{nanos}"));
        dir
    }

    fn one_layer_arch() -> Architecture {
        Architecture {
            stdev_factor: 0.01,
            apply_intrinsic_atrous: false,
            layers: vec![Layer {
                kernel_size: [1, 1, 1],
                dilation_rate: [1, 1, 1],
                nkernels_per_image: 2,
                nkernels_per_marker: 2,
                noutput_channels: 2,
                relu: false,
                pool_type: PoolType::NoPool,
                pool_size: [2, 2, 1],
                pool_stride: 2,
                skip_connections: vec![],
            }],
        }
    }

    fn doubling_bank() -> KernelBank {
        // Two kernels over one channel: identity and doubling.
        KernelBank::new(
            vec![1.0, 2.0],
            2,
            1,
            BankStats::Bias {
                bias: vec![0.0, 0.0],
            },
        )
        .unwrap()
    }

    fn ramp(shape: GridShape) -> MultibandImage {
        let data: Vec<f32> = (0..shape.n_voxels()).map(|v| v as f32).collect();
        MultibandImage::new(data, shape, 1).unwrap()
    }

    #[test]
    fn batched_run_keeps_input_order_and_channels() {
        let arch = one_layer_arch();
        let store = ParamStore::new(unique_temp_dir("extract"));
        store.save_layer(0, &doubling_bank()).unwrap();

        let inputs: Vec<ExtractionInput> = (0..5)
            .map(|i| ExtractionInput::new(format!("img{i}"), ramp(GridShape::new_2d(4, 4))))
            .collect();
        let registry = DeviceRegistry::with_cpu_budget(1 << 16);
        let outcomes =
            extract_features(&arch, &store, &inputs, &registry, Device::Cpu).unwrap();

        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.id, format!("img{i}"));
            let features = outcome.features.as_ref().unwrap();
            assert_eq!(features.nbands(), 2);
            assert_eq!(features.shape(), GridShape::new_2d(4, 4));
            assert_eq!(features.value(3, 1), 6.0);
        }
        std::fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn one_bad_image_does_not_poison_the_batch() {
        let arch = one_layer_arch();
        let store = ParamStore::new(unique_temp_dir("poison"));
        store.save_layer(0, &doubling_bank()).unwrap();

        let good = ExtractionInput::new("good", ramp(GridShape::new_2d(4, 4)));
        let misaligned_mask =
            markerconv_core::ObjectMask::full(GridShape::new_2d(3, 3));
        let bad = ExtractionInput::new("bad", ramp(GridShape::new_2d(4, 4)))
            .with_mask(misaligned_mask);

        let registry = DeviceRegistry::with_cpu_budget(1 << 16);
        let outcomes =
            extract_features(&arch, &store, &[good, bad], &registry, Device::Cpu).unwrap();
        assert!(outcomes[0].features.is_ok());
        assert!(matches!(
            outcomes[1].features,
            Err(ModelError::Dimension { .. })
        ));
        std::fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn missing_device_fails_before_any_image() {
        let arch = one_layer_arch();
        let store = ParamStore::new(unique_temp_dir("nodev"));
        let inputs = vec![ExtractionInput::new("a", ramp(GridShape::new_2d(2, 2)))];
        let registry = DeviceRegistry::with_cpu_budget(1 << 16);
        let err = extract_features(&arch, &store, &inputs, &registry, Device::Accelerator(1));
        assert!(matches!(err, Err(ModelError::Resource(_))));
    }

    #[test]
    fn single_layer_extraction_applies_just_that_layer() {
        let arch = one_layer_arch();
        let store = ParamStore::new(unique_temp_dir("layer"));
        store.save_layer(0, &doubling_bank()).unwrap();

        let inputs = vec![ExtractionInput::new("a", ramp(GridShape::new_2d(2, 2)))];
        let registry = DeviceRegistry::with_cpu_budget(1 << 16);
        let outcomes =
            extract_from_layer(&arch, &store, 0, &inputs, &registry, Device::Cpu).unwrap();
        let features = outcomes[0].features.as_ref().unwrap();
        assert_eq!(features.value(2, 0), 2.0);
        assert_eq!(features.value(2, 1), 4.0);
        std::fs::remove_dir_all(store.dir()).unwrap();
    }
}
