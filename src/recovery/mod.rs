pub mod engine;
pub mod model;

pub use engine::RecoveryEngine;
pub use model::{RecoveryComponent, RecoveryExecution, RecoveryStatus};
