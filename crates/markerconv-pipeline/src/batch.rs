use crate::backend::ExecutionBackend;
use markerconv_arch::Architecture;
use markerconv_core::{ModelError, Result};

const BYTES_PER_VALUE: u64 = 4;

/// Largest number of images of the given size that can move through the
/// network together without the peak per-layer footprint exceeding
/// `budget_bytes`.
///
/// The walk models extraction: grids shrink at pooling layers, channel
/// counts follow the banks and skip connections, and each layer must hold
/// its input, its output and its kernel bank at once. Never returns zero;
/// an image that does not fit alone is a resource error.
pub fn batch_size(
    arch: &Architecture,
    input_nvoxels: usize,
    input_nchannels: usize,
    dim3d: bool,
    budget_bytes: u64,
) -> Result<usize> {
    if input_nvoxels == 0 || input_nchannels == 0 {
        return Err(ModelError::Data(
            "batch sizing needs a non-empty input image".into(),
        ));
    }
    let spatial_dims: u32 = if dim3d { 3 } else { 2 };
    let mut nvoxels = input_nvoxels as u64;
    let mut in_ch = input_nchannels as u64;
    let mut ch_after: Vec<u64> = Vec::with_capacity(arch.n_layers());
    let mut peak: u64 = 0;

    for layer in &arch.layers {
        let adj_len = (layer.kernel_size[0]
            * layer.kernel_size[1]
            * if dim3d { layer.kernel_size[2] } else { 1 }) as u64;
        let nkernels = layer.noutput_channels as u64;
        let skip_ch: u64 = layer.skip_connections.iter().map(|&s| ch_after[s]).sum();
        let out_ch = nkernels + skip_ch;

        let bank_bytes = nkernels * adj_len * in_ch * BYTES_PER_VALUE;
        let input_bytes = nvoxels * in_ch * BYTES_PER_VALUE;
        let output_bytes = nvoxels * out_ch * BYTES_PER_VALUE;
        peak = peak.max(input_bytes + output_bytes + bank_bytes);

        ch_after.push(out_ch);
        in_ch = out_ch;
        if layer.pool_type.pools() && layer.pool_stride > 1 {
            let shrink = (layer.pool_stride as u64).pow(spatial_dims);
            nvoxels = nvoxels.div_ceil(shrink);
        }
    }

    if peak > budget_bytes {
        return Err(ModelError::Resource(format!(
            "a single image needs {peak} bytes but only {budget_bytes} are available"
        )));
    }
    Ok((budget_bytes / peak) as usize)
}

/// Batch size against the memory the execution backend reports.
pub fn batch_size_for_device(
    arch: &Architecture,
    input_nvoxels: usize,
    input_nchannels: usize,
    dim3d: bool,
    backend: &dyn ExecutionBackend,
) -> Result<usize> {
    let budget = backend.available_memory().ok_or_else(|| {
        ModelError::Resource(format!(
            "backend {} reports no memory budget",
            backend.name()
        ))
    })?;
    batch_size(arch, input_nvoxels, input_nchannels, dim3d, budget)
}
