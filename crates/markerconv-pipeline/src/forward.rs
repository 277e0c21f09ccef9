use crate::backend::ExecutionBackend;
use markerconv_arch::Architecture;
use markerconv_bank::{BankStats, KernelBank};
use markerconv_core::{AdjRel, ModelError, MultibandImage, ObjectMask, Result};

/// How the pass treats pooling strides.
///
/// `Preserve` keeps every layer at the input resolution: pooling runs with
/// stride 1 and kernels are dilated by the accumulated stride product
/// instead, so markers placed on the original grid stay valid at any depth.
/// `Reduce` applies the true strides and shrinks the grid. At the voxels
/// that survive reduction both regimes compute the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    Preserve,
    Reduce,
}

/// Layer-by-layer application of learned kernel banks to one image.
pub struct ForwardPass<'a> {
    arch: &'a Architecture,
    backend: &'a dyn ExecutionBackend,
    policy: ResolutionPolicy,
    dim3d: bool,
}

impl<'a> ForwardPass<'a> {
    pub fn new(
        arch: &'a Architecture,
        backend: &'a dyn ExecutionBackend,
        policy: ResolutionPolicy,
        dim3d: bool,
    ) -> Self {
        ForwardPass {
            arch,
            backend,
            policy,
            dim3d,
        }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Kernel and pooling-window dilation for a layer under this policy.
    pub fn atrous(&self, layer_index: usize) -> usize {
        match self.policy {
            ResolutionPolicy::Preserve => self.arch.cumulative_stride(layer_index),
            ResolutionPolicy::Reduce => 1,
        }
    }

    fn pool_stride(&self, layer_index: usize) -> usize {
        match self.policy {
            ResolutionPolicy::Preserve => 1,
            ResolutionPolicy::Reduce => self.arch.layers[layer_index].pool_stride,
        }
    }

    /// One layer: convolve, finish with the bank statistics, activate,
    /// concatenate skip connections, pool. `earlier` holds the outputs of
    /// layers `0..layer_index` for skip connections.
    pub fn apply_layer(
        &self,
        layer_index: usize,
        input: &MultibandImage,
        earlier: &[MultibandImage],
        bank: &KernelBank,
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage> {
        let layer = self.arch.layer(layer_index)?;
        let atrous = self.atrous(layer_index);
        let adj = AdjRel::kernel(layer.kernel_size, layer.dilation_rate, atrous, self.dim3d)?;
        if bank.kernel_len() != adj.len() * input.nbands() {
            return Err(ModelError::Dimension {
                expected: vec![adj.len() * input.nbands()],
                got: vec![bank.kernel_len()],
                context: format!("layer {layer_index} kernel bank"),
            });
        }

        let mut current = self.backend.convolve(input, &adj, bank, mask)?;
        finish_responses(&mut current, bank.stats(), layer.relu, mask);

        if !layer.skip_connections.is_empty() {
            let resampled: Vec<MultibandImage> = layer
                .skip_connections
                .iter()
                .map(|&s| {
                    let src = earlier.get(s).ok_or_else(|| {
                        ModelError::Config(format!(
                            "layer {layer_index}: no stored output for skip connection to layer {s}"
                        ))
                    })?;
                    src.resample_nearest(current.shape())
                })
                .collect::<Result<_>>()?;
            let mut parts: Vec<&MultibandImage> = vec![&current];
            parts.extend(resampled.iter());
            current = MultibandImage::concat_bands(&parts)?;
        }

        if layer.pool_type.pools() {
            let window = AdjRel::pool_window(layer.pool_size, atrous, self.dim3d)?;
            current = self.backend.pool(
                &current,
                &window,
                self.pool_stride(layer_index),
                layer.pool_type,
                mask,
            )?;
        }
        Ok(current)
    }

    /// Apply every layer in index order, returning each layer's output.
    /// The object mask, when given, follows the grid through pooling.
    pub fn run_all(
        &self,
        image: &MultibandImage,
        banks: &[KernelBank],
        mask: Option<&ObjectMask>,
    ) -> Result<Vec<MultibandImage>> {
        if banks.len() != self.arch.n_layers() {
            return Err(ModelError::Config(format!(
                "expected {} kernel banks, got {}",
                self.arch.n_layers(),
                banks.len()
            )));
        }
        let mut outputs: Vec<MultibandImage> = Vec::with_capacity(banks.len());
        let mut current_mask = mask.cloned();

        for l in 0..self.arch.n_layers() {
            let input = outputs.last().unwrap_or(image);
            let out = self.apply_layer(l, input, &outputs, &banks[l], current_mask.as_ref())?;

            let layer = self.arch.layer(l)?;
            if layer.pool_type.pools() {
                let stride = self.pool_stride(l);
                if stride > 1 {
                    current_mask = current_mask.map(|m| m.pooled(stride));
                }
            }
            outputs.push(out);
        }
        Ok(outputs)
    }

    /// Apply every layer and return only the final feature map.
    pub fn run(
        &self,
        image: &MultibandImage,
        banks: &[KernelBank],
        mask: Option<&ObjectMask>,
    ) -> Result<MultibandImage> {
        let mut outputs = self.run_all(image, banks, mask)?;
        outputs
            .pop()
            .ok_or_else(|| ModelError::Config("architecture has no layers".into()))
    }
}

/// Turn raw convolution responses into activations: z-score or bias per
/// kernel, then the optional rectifier. Voxels outside the mask keep their
/// zero vectors.
fn finish_responses(
    conv: &mut MultibandImage,
    stats: &BankStats,
    relu: bool,
    mask: Option<&ObjectMask>,
) {
    let nbands = conv.nbands();
    for v in 0..conv.n_voxels() {
        if let Some(m) = mask {
            if !m.is_inside(v) {
                continue;
            }
        }
        let bands = conv.bands_at_mut(v);
        for k in 0..nbands {
            let mut val = bands[k];
            match stats {
                BankStats::Normalization { mean, stdev } => {
                    val = (val - mean[k]) / stdev[k];
                }
                BankStats::Bias { bias } => val += bias[k],
            }
            if relu && val < 0.0 {
                val = 0.0;
            }
            bands[k] = val;
        }
    }
}
