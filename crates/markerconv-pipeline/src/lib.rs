pub mod backend;
pub mod batch;
pub mod extract;
pub mod forward;
pub mod pool;

pub use backend::{CpuBackend, Device, DeviceRegistry, ExecutionBackend};
pub use batch::{batch_size, batch_size_for_device};
pub use extract::{extract_features, extract_from_layer, ExtractionInput, ExtractionOutcome};
pub use forward::{ForwardPass, ResolutionPolicy};
pub use pool::{atrous_avg_pool, atrous_max_pool};
