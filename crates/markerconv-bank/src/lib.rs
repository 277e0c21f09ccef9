pub mod bank;
pub mod store;

pub use bank::{BankStats, KernelBank};
pub use store::{KernelManifest, ParamStore};
