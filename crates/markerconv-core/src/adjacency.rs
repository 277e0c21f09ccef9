use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A relative voxel displacement, one entry of an adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

impl Offset {
    pub fn new(dx: i32, dy: i32, dz: i32) -> Self {
        Offset { dx, dy, dz }
    }

    pub fn negated(&self) -> Offset {
        Offset {
            dx: -self.dx,
            dy: -self.dy,
            dz: -self.dz,
        }
    }
}

/// An ordered set of displacements describing which neighbors a kernel or a
/// pooling window visits around (or from) a voxel.
///
/// The offset order is part of the contract: patch vectors and kernel weight
/// rows are laid out offset-major in exactly this order, so two adjacencies
/// built from the same geometry always index weights identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjRel {
    offsets: Vec<Offset>,
}

impl AdjRel {
    /// Centered kernel adjacency from per-axis extents `[kx, ky, kz]`.
    ///
    /// Axis `a` contributes displacements `{-r, .., r} * dilation[a] * atrous`
    /// where `r = extent / 2`; extents must therefore be odd. Offsets are
    /// enumerated z-outermost, x-innermost, ascending on every axis. With
    /// `dim3d == false` the z extent is ignored and the z displacement is
    /// always zero.
    pub fn kernel(
        extents: [usize; 3],
        dilation: [usize; 3],
        atrous: usize,
        dim3d: bool,
    ) -> Result<Self> {
        if atrous == 0 {
            return Err(ModelError::Config("atrous factor must be positive".into()));
        }
        let naxes = if dim3d { 3 } else { 2 };
        for axis in 0..naxes {
            let e = extents[axis];
            if e == 0 || e % 2 == 0 {
                return Err(ModelError::Config(format!(
                    "kernel extent on axis {axis} must be odd and positive, got {e}"
                )));
            }
            if dilation[axis] == 0 {
                return Err(ModelError::Config(format!(
                    "dilation rate on axis {axis} must be positive"
                )));
            }
        }
        let spacing = |axis: usize| (dilation[axis] * atrous) as i32;
        let radius = |e: usize| (e / 2) as i32;
        let (rx, ry) = (radius(extents[0]), radius(extents[1]));
        let rz = if dim3d { radius(extents[2]) } else { 0 };

        let mut offsets = Vec::with_capacity(
            (2 * rx as usize + 1) * (2 * ry as usize + 1) * (2 * rz as usize + 1),
        );
        for z in -rz..=rz {
            for y in -ry..=ry {
                for x in -rx..=rx {
                    offsets.push(Offset::new(
                        x * spacing(0),
                        y * spacing(1),
                        z * spacing(2),
                    ));
                }
            }
        }
        Ok(AdjRel { offsets })
    }

    /// Pooling window anchored at a voxel: displacements `{0, .., p-1} *
    /// atrous` per axis, enumerated in the same z-outermost order.
    pub fn pool_window(sizes: [usize; 3], atrous: usize, dim3d: bool) -> Result<Self> {
        if atrous == 0 {
            return Err(ModelError::Config("pooling atrous factor must be positive".into()));
        }
        let active: &[usize] = if dim3d { &sizes } else { &sizes[..2] };
        if active.iter().any(|&s| s == 0) {
            return Err(ModelError::Config(format!(
                "pooling window sizes must be positive, got {sizes:?}"
            )));
        }
        let spacing = atrous as i32;
        let (px, py) = (sizes[0] as i32, sizes[1] as i32);
        let pz = if dim3d { sizes[2] as i32 } else { 1 };

        let mut offsets = Vec::with_capacity((px * py * pz) as usize);
        for z in 0..pz {
            for y in 0..py {
                for x in 0..px {
                    offsets.push(Offset::new(x * spacing, y * spacing, z * spacing));
                }
            }
        }
        Ok(AdjRel { offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[Offset] {
        &self.offsets
    }

    pub fn iter(&self) -> impl Iterator<Item = &Offset> {
        self.offsets.iter()
    }
}

impl fmt::Display for AdjRel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adjacency({} offsets)", self.offsets.len())
    }
}
