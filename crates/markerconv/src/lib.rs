//! # markerconv
//!
//! Marker-driven convolutional feature learning: kernel banks are estimated
//! from patches at user-drawn markers instead of by backpropagation, one
//! layer at a time.
//!
//! ## Modules
//!
//! - **core** — Voxel grids, multiband images, adjacency relations, markers
//! - **arch** — The JSON architecture descriptor and derived stride/dilation
//! - **cluster** — Patch grouping: K-Means (k-means++) and density clustering
//! - **bank** — Kernel banks with response statistics, on-disk parameter store
//! - **learn** — Marker patch sampling, clustering and SGD bank estimation
//! - **pipeline** — Forward pass, pooling, batched extraction, devices
//! - **io** — Seed (marker) text files and CSV image lists

/// Grids, images, adjacencies, markers.
pub use markerconv_core as core;

/// Architecture descriptors.
pub use markerconv_arch as arch;

/// Patch grouping algorithms.
pub use markerconv_cluster as cluster;

/// Kernel banks and the parameter store.
pub use markerconv_bank as bank;

/// Kernel estimation from markers.
pub use markerconv_learn as learn;

/// Forward execution and feature extraction.
pub use markerconv_pipeline as pipeline;

/// Seed files and image lists.
pub use markerconv_io as io;
