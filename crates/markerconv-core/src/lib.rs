pub mod adjacency;
pub mod error;
pub mod grid;
pub mod image;
pub mod marker;

pub use adjacency::{AdjRel, Offset};
pub use error::{ModelError, Result};
pub use grid::{GridShape, Voxel};
pub use image::{MultibandImage, ObjectMask};
pub use marker::{Marker, MarkerSet};
