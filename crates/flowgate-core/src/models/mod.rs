pub mod run;
pub mod step_result;

pub use run::*;
pub use step_result::*;
