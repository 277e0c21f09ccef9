use crate::error::{ModelError, Result};
use crate::grid::{GridShape, Voxel};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 2D or 3D grid of voxels, each holding a fixed-length vector of channel
/// values (bands).
///
/// Storage is a flat `Vec<f32>` in voxel-major, band-minor order: the value
/// of band `b` at linear voxel index `v` lives at `data[v * nbands + b]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultibandImage {
    data: Vec<f32>,
    shape: GridShape,
    nbands: usize,
}

impl MultibandImage {
    pub fn new(data: Vec<f32>, shape: GridShape, nbands: usize) -> Result<Self> {
        if data.len() != shape.n_voxels() * nbands {
            return Err(ModelError::Dimension {
                expected: vec![shape.n_voxels() * nbands],
                got: vec![data.len()],
                context: "multiband image buffer".into(),
            });
        }
        Ok(MultibandImage { data, shape, nbands })
    }

    pub fn zeros(shape: GridShape, nbands: usize) -> Self {
        MultibandImage {
            data: vec![0.0; shape.n_voxels() * nbands],
            shape,
            nbands,
        }
    }

    /// Single-band 2D image from row-major values; rows are y, columns x.
    pub fn from_rows_2d(rows: &[Vec<f32>]) -> Result<Self> {
        let ysize = rows.len();
        let xsize = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != xsize) {
            return Err(ModelError::Data("rows of unequal length".into()));
        }
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        MultibandImage::new(data, GridShape::new_2d(xsize, ysize), 1)
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn nbands(&self) -> usize {
        self.nbands
    }

    pub fn n_voxels(&self) -> usize {
        self.shape.n_voxels()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Channel vector of the voxel at linear index `v`.
    pub fn bands_at(&self, v: usize) -> &[f32] {
        &self.data[v * self.nbands..(v + 1) * self.nbands]
    }

    pub fn bands_at_mut(&mut self, v: usize) -> &mut [f32] {
        &mut self.data[v * self.nbands..(v + 1) * self.nbands]
    }

    pub fn value(&self, v: usize, band: usize) -> f32 {
        self.data[v * self.nbands + band]
    }

    pub fn set_value(&mut self, v: usize, band: usize, value: f32) {
        self.data[v * self.nbands + band] = value;
    }

    /// Channel value at a voxel coordinate, zero outside the grid.
    pub fn value_at_or_zero(&self, v: Option<Voxel>, band: usize) -> f32 {
        match v {
            Some(v) => self.value(self.shape.index_of(v), band),
            None => 0.0,
        }
    }

    // ─── Combination & resampling ───────────────────────────────────────────

    /// Channel-wise concatenation of images on the same grid. The result
    /// holds the bands of `images[0]` first, then `images[1]`, and so on.
    pub fn concat_bands(images: &[&MultibandImage]) -> Result<Self> {
        let first = images
            .first()
            .ok_or_else(|| ModelError::Data("no images to concatenate".into()))?;
        let shape = first.shape;
        for img in images {
            if img.shape != shape {
                return Err(ModelError::Dimension {
                    expected: vec![shape.xsize, shape.ysize, shape.zsize],
                    got: vec![img.shape.xsize, img.shape.ysize, img.shape.zsize],
                    context: "channel concatenation".into(),
                });
            }
        }
        let nbands: usize = images.iter().map(|i| i.nbands).sum();
        let mut data = Vec::with_capacity(shape.n_voxels() * nbands);
        for v in 0..shape.n_voxels() {
            for img in images {
                data.extend_from_slice(img.bands_at(v));
            }
        }
        Ok(MultibandImage { data, shape, nbands })
    }

    /// Nearest-neighbor resampling to `target`. Each axis must relate by an
    /// integral factor (either direction); anything else cannot be aligned.
    pub fn resample_nearest(&self, target: GridShape) -> Result<Self> {
        if self.shape == target {
            return Ok(self.clone());
        }
        let map_axis = |src: usize, dst: usize| -> Result<Box<dyn Fn(usize) -> usize>> {
            if src >= dst && src % dst == 0 {
                let f = src / dst;
                Ok(Box::new(move |i| i * f))
            } else if dst % src == 0 {
                let f = dst / src;
                Ok(Box::new(move |i| i / f))
            } else {
                Err(ModelError::Dimension {
                    expected: vec![dst],
                    got: vec![src],
                    context: "non-integral resampling ratio".into(),
                })
            }
        };
        let fx = map_axis(self.shape.xsize, target.xsize)?;
        let fy = map_axis(self.shape.ysize, target.ysize)?;
        let fz = map_axis(self.shape.zsize, target.zsize)?;

        let mut out = MultibandImage::zeros(target, self.nbands);
        for t in 0..target.n_voxels() {
            let tv = target.voxel_at(t);
            let sv = Voxel::new(fx(tv.x), fy(tv.y), fz(tv.z));
            let s = self.shape.index_of(sv);
            out.bands_at_mut(t).copy_from_slice(self.bands_at(s));
        }
        Ok(out)
    }
}

impl fmt::Display for MultibandImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mimage({}, {} bands)", self.shape, self.nbands)
    }
}

/// A binary mask aligned to a grid: extraction only computes and stores
/// values for voxels inside it, emitting zero vectors elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMask {
    inside: Vec<bool>,
    shape: GridShape,
}

impl ObjectMask {
    pub fn new(inside: Vec<bool>, shape: GridShape) -> Result<Self> {
        if inside.len() != shape.n_voxels() {
            return Err(ModelError::Dimension {
                expected: vec![shape.n_voxels()],
                got: vec![inside.len()],
                context: "object mask buffer".into(),
            });
        }
        Ok(ObjectMask { inside, shape })
    }

    /// Mask covering the whole grid.
    pub fn full(shape: GridShape) -> Self {
        ObjectMask {
            inside: vec![true; shape.n_voxels()],
            shape,
        }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn is_inside(&self, v: usize) -> bool {
        self.inside[v]
    }

    pub fn count_inside(&self) -> usize {
        self.inside.iter().filter(|&&b| b).count()
    }

    /// Mask for the grid obtained by stride subsampling, keeping the value at
    /// each surviving voxel.
    pub fn pooled(&self, stride: usize) -> ObjectMask {
        if stride <= 1 {
            return self.clone();
        }
        let target = self.shape.pooled(stride);
        let mut inside = Vec::with_capacity(target.n_voxels());
        for t in 0..target.n_voxels() {
            let tv = target.voxel_at(t);
            let sv = Voxel::new(tv.x * stride, tv.y * stride, tv.z * stride);
            inside.push(self.inside[self.shape.index_of(sv)]);
        }
        ObjectMask { inside, shape: target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_length_is_checked() {
        let err = MultibandImage::new(vec![0.0; 5], GridShape::new_2d(2, 2), 2);
        assert!(matches!(err, Err(ModelError::Dimension { .. })));
        assert!(MultibandImage::new(vec![0.0; 8], GridShape::new_2d(2, 2), 2).is_ok());
    }

    #[test]
    fn band_layout_is_voxel_major() {
        let img = MultibandImage::new(
            vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0],
            GridShape::new_2d(2, 2),
            2,
        )
        .unwrap();
        assert_eq!(img.bands_at(0), &[1.0, 10.0]);
        assert_eq!(img.bands_at(3), &[4.0, 40.0]);
        assert_eq!(img.value(2, 1), 30.0);
    }

    #[test]
    fn concat_stacks_channels() {
        let a = MultibandImage::from_rows_2d(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = MultibandImage::from_rows_2d(&[vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();
        let c = MultibandImage::concat_bands(&[&a, &b]).unwrap();
        assert_eq!(c.nbands(), 2);
        assert_eq!(c.bands_at(0), &[1.0, 5.0]);
        assert_eq!(c.bands_at(3), &[4.0, 8.0]);
    }

    #[test]
    fn concat_rejects_mismatched_grids() {
        let a = MultibandImage::zeros(GridShape::new_2d(2, 2), 1);
        let b = MultibandImage::zeros(GridShape::new_2d(3, 2), 1);
        assert!(MultibandImage::concat_bands(&[&a, &b]).is_err());
    }

    #[test]
    fn resample_downsamples_by_integral_factor() {
        let img = MultibandImage::from_rows_2d(&[
            vec![1.0, 2.0, 3.0, 4.0],
            vec![5.0, 6.0, 7.0, 8.0],
            vec![9.0, 10.0, 11.0, 12.0],
            vec![13.0, 14.0, 15.0, 16.0],
        ])
        .unwrap();
        let half = img.resample_nearest(GridShape::new_2d(2, 2)).unwrap();
        assert_eq!(half.data(), &[1.0, 3.0, 9.0, 11.0]);

        let back = half.resample_nearest(GridShape::new_2d(4, 4)).unwrap();
        assert_eq!(back.value(back.shape().index_of(Voxel::new(1, 1, 0)), 0), 1.0);
    }

    #[test]
    fn resample_rejects_non_integral_ratio() {
        let img = MultibandImage::zeros(GridShape::new_2d(4, 4), 1);
        assert!(img.resample_nearest(GridShape::new_2d(3, 4)).is_err());
    }

    #[test]
    fn mask_pooling_subsamples() {
        let mut inside = vec![false; 16];
        inside[0] = true; // (0,0)
        inside[10] = true; // (2,2)
        let mask = ObjectMask::new(inside, GridShape::new_2d(4, 4)).unwrap();
        let pooled = mask.pooled(2);
        assert_eq!(pooled.shape(), GridShape::new_2d(2, 2));
        assert!(pooled.is_inside(0));
        assert!(pooled.is_inside(3));
        assert!(!pooled.is_inside(1));
        assert_eq!(mask.count_inside(), 2);
    }
}
