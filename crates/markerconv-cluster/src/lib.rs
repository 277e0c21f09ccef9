pub mod density;
pub mod grouping;
pub mod kmeans;

pub use density::DensityGrouping;
pub use grouping::PatchGrouping;
pub use kmeans::KMeansGrouping;
