use markerconv_arch::PoolType;
use markerconv_core::{AdjRel, ModelError, MultibandImage, ObjectMask, Result, Voxel};

/// Reduce `img` with a pooling window anchored at every `stride`-th voxel.
///
/// Output extents are `ceil(size / stride)` per axis. Window positions that
/// reach past the border aggregate over the voxels that exist; average
/// pooling divides by that count, not the window size. Windows anchored
/// outside `mask` write zero vectors, and the rest aggregate in-mask
/// voxels only, so masked-out responses never bleed back in.
pub(crate) fn pool_with_window(
    img: &MultibandImage,
    window: &AdjRel,
    stride: usize,
    kind: PoolType,
    mask: Option<&ObjectMask>,
) -> Result<MultibandImage> {
    if kind == PoolType::NoPool {
        return Ok(img.clone());
    }
    if stride == 0 {
        return Err(ModelError::Config("pooling stride must be positive".into()));
    }
    let shape = img.shape();
    if let Some(m) = mask {
        if m.shape() != shape {
            return Err(ModelError::Dimension {
                expected: vec![shape.xsize, shape.ysize, shape.zsize],
                got: vec![m.shape().xsize, m.shape().ysize, m.shape().zsize],
                context: "object mask grid".into(),
            });
        }
    }
    let nbands = img.nbands();
    let out_shape = shape.pooled(stride);
    let mut out = MultibandImage::zeros(out_shape, nbands);

    let mut sources: Vec<usize> = Vec::with_capacity(window.len());
    for t in 0..out_shape.n_voxels() {
        let tv = out_shape.voxel_at(t);
        let anchor = Voxel::new(tv.x * stride, tv.y * stride, tv.z * stride);
        if let Some(m) = mask {
            if !m.is_inside(shape.index_of(anchor)) {
                continue;
            }
        }

        // The window contains its anchor, so an in-mask anchor always
        // leaves at least one source.
        sources.clear();
        for o in window.iter() {
            if let Some(q) = shape.shifted(anchor, o.dx, o.dy, o.dz) {
                let s = shape.index_of(q);
                if mask.map_or(true, |m| m.is_inside(s)) {
                    sources.push(s);
                }
            }
        }

        let bands = out.bands_at_mut(t);
        for b in 0..nbands {
            bands[b] = match kind {
                PoolType::MaxPool => sources
                    .iter()
                    .map(|&s| img.value(s, b))
                    .fold(f32::NEG_INFINITY, f32::max),
                PoolType::AvgPool => {
                    let sum: f32 = sources.iter().map(|&s| img.value(s, b)).sum();
                    sum / sources.len() as f32
                }
                PoolType::NoPool => unreachable!(),
            };
        }
    }
    Ok(out)
}

/// Max pooling with a window dilated by `atrous`, matching the kernel
/// geometry of dilation-compensated layers.
pub fn atrous_max_pool(
    img: &MultibandImage,
    sizes: [usize; 3],
    atrous: usize,
    stride: usize,
    dim3d: bool,
) -> Result<MultibandImage> {
    let window = AdjRel::pool_window(sizes, atrous, dim3d)?;
    pool_with_window(img, &window, stride, PoolType::MaxPool, None)
}

/// Average pooling with a window dilated by `atrous`.
pub fn atrous_avg_pool(
    img: &MultibandImage,
    sizes: [usize; 3],
    atrous: usize,
    stride: usize,
    dim3d: bool,
) -> Result<MultibandImage> {
    let window = AdjRel::pool_window(sizes, atrous, dim3d)?;
    pool_with_window(img, &window, stride, PoolType::AvgPool, None)
}
