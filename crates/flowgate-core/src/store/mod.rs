pub mod run_store;

pub use run_store::{RunLease, RunStore};
