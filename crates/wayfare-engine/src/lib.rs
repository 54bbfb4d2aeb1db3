//! Run orchestration engine: drives routine and project graphs to a
//! terminal status through pluggable navigators, executors, and decision
//! strategies.

pub mod navigator;
pub mod sequence;
pub mod state_machine;
pub mod step;
pub mod testing;

pub use navigator::NavigatorFactory;
pub use sequence::SequenceNavigator;
pub use state_machine::{RunControl, RunStateMachine, MAX_PARALLEL_BRANCHES, MAX_RUN_LOOPS};
pub use step::{choose_concurrency_mode, ConcurrencyMode, StepAction, StepInput, StepOutcome};
