pub mod estimator;
pub mod model;
pub mod sampler;
pub mod sgd;

pub use estimator::{ClusteringEstimator, ClusteringOptions, GroupingMethod, LabelGrouping};
pub use model::{learn_layer, learn_model, EstimationStrategy, TrainingImage};
pub use sampler::MarkerPatches;
pub use sgd::{SgdEstimator, SgdInit, SgdOptions, SgdReport};
