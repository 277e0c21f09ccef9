use serde::{Deserialize, Serialize};
use std::fmt;

/// Spatial extent of a voxel grid. 2D images use `zsize == 1`.
///
/// Voxels are addressed in x-fastest order: the linear index of `(x, y, z)`
/// is `x + y * xsize + z * xsize * ysize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub xsize: usize,
    pub ysize: usize,
    pub zsize: usize,
}

/// A voxel coordinate inside a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Voxel {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Voxel {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Voxel { x, y, z }
    }
}

impl GridShape {
    pub fn new(xsize: usize, ysize: usize, zsize: usize) -> Self {
        GridShape { xsize, ysize, zsize }
    }

    /// Shape of a 2D grid (`zsize == 1`).
    pub fn new_2d(xsize: usize, ysize: usize) -> Self {
        GridShape { xsize, ysize, zsize: 1 }
    }

    pub fn n_voxels(&self) -> usize {
        self.xsize * self.ysize * self.zsize
    }

    pub fn is_3d(&self) -> bool {
        self.zsize > 1
    }

    pub fn contains(&self, v: Voxel) -> bool {
        v.x < self.xsize && v.y < self.ysize && v.z < self.zsize
    }

    /// Linear index of a voxel. The caller guarantees `contains(v)`.
    pub fn index_of(&self, v: Voxel) -> usize {
        v.x + v.y * self.xsize + v.z * self.xsize * self.ysize
    }

    /// Voxel at a linear index. The caller guarantees `idx < n_voxels()`.
    pub fn voxel_at(&self, idx: usize) -> Voxel {
        let plane = self.xsize * self.ysize;
        let z = idx / plane;
        let rem = idx % plane;
        Voxel {
            x: rem % self.xsize,
            y: rem / self.xsize,
            z,
        }
    }

    /// Displace a voxel by `(dx, dy, dz)`; `None` when the result leaves the
    /// grid. Used for zero-padded neighborhood gathering.
    pub fn shifted(&self, v: Voxel, dx: i32, dy: i32, dz: i32) -> Option<Voxel> {
        let x = v.x as i64 + dx as i64;
        let y = v.y as i64 + dy as i64;
        let z = v.z as i64 + dz as i64;
        if x < 0 || y < 0 || z < 0 {
            return None;
        }
        let q = Voxel {
            x: x as usize,
            y: y as usize,
            z: z as usize,
        };
        if self.contains(q) {
            Some(q)
        } else {
            None
        }
    }

    /// Grid extent after subsampling every `stride`-th voxel per axis,
    /// starting at the origin. Each axis shrinks to `ceil(size / stride)`.
    pub fn pooled(&self, stride: usize) -> GridShape {
        let div = |n: usize| n.div_ceil(stride);
        GridShape {
            xsize: div(self.xsize),
            ysize: div(self.ysize),
            zsize: div(self.zsize),
        }
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_3d() {
            write!(f, "{}x{}x{}", self.xsize, self.ysize, self.zsize)
        } else {
            write!(f, "{}x{}", self.xsize, self.ysize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trip() {
        let s = GridShape::new(5, 4, 3);
        for idx in 0..s.n_voxels() {
            let v = s.voxel_at(idx);
            assert!(s.contains(v));
            assert_eq!(s.index_of(v), idx);
        }
    }

    #[test]
    fn shifted_respects_bounds() {
        let s = GridShape::new_2d(4, 4);
        let v = Voxel::new(0, 2, 0);
        assert_eq!(s.shifted(v, -1, 0, 0), None);
        assert_eq!(s.shifted(v, 1, 1, 0), Some(Voxel::new(1, 3, 0)));
        assert_eq!(s.shifted(v, 0, 2, 0), None);
        assert_eq!(s.shifted(v, 0, 0, 1), None);
    }

    #[test]
    fn pooled_uses_ceiling() {
        let s = GridShape::new_2d(8, 7);
        let p = s.pooled(2);
        assert_eq!((p.xsize, p.ysize, p.zsize), (4, 4, 1));
        let q = GridShape::new(9, 9, 5).pooled(3);
        assert_eq!((q.xsize, q.ysize, q.zsize), (3, 3, 2));
    }
}
