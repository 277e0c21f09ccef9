pub mod arch;

pub use arch::{Architecture, Layer, PoolType};
