pub mod engine;
pub mod model;

pub use engine::FailoverEngine;
pub use model::{Action, ActionKind, Condition, ConditionKind, Decision, Execution, FailoverRule};
