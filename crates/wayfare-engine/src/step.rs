use std::collections::HashMap;
use std::sync::Arc;

use wayfare_core::config::RunConfig;
use wayfare_core::context::{SubroutineContext, SubroutineContextManager};
use wayfare_core::contracts::{DecisionStrategy, StartOutcome, SubroutineExecutor};
use wayfare_core::error::{Result, WayfareError};
use wayfare_core::graph::GraphObject;
use wayfare_core::progress::RunProgress;
use wayfare_core::types::{
    BranchId, BranchStatus, Credits, DecisionKey, DecisionMap, DeferredDecision, Location,
    SubroutineInstanceId,
};

use crate::navigator::NavigatorFactory;

/// Everything one step execution needs, snapshotted before the step runs.
///
/// Steps receive copies of the parent context and the decision set, never
/// references into the aggregate. That is what allows a batch of steps to
/// run concurrently while the orchestrator stays the single writer: all
/// mutation happens when outcomes are applied, serially.
pub struct StepInput {
    pub branch_id: BranchId,
    pub instance_id: SubroutineInstanceId,
    pub location: Location,
    pub graph: Arc<GraphObject>,
    pub parent_context: SubroutineContext,
    pub decisions: DecisionMap,
    pub config: RunConfig,
    pub decision_key: DecisionKey,
}

/// What a step produced; applied to the aggregate by the orchestrator.
pub enum StepAction {
    /// The node carries no subroutine (pure navigation).
    NoOp,
    /// A single-step unit ran to completion.
    Completed {
        node_id: String,
        inputs: HashMap<String, serde_json::Value>,
        outputs: HashMap<String, serde_json::Value>,
        cost: Credits,
        complexity: u64,
    },
    /// A multi-step unit opened a nested graph; the branch descends into it.
    Spawn {
        node_id: String,
        instance: SubroutineInstanceId,
        context: SubroutineContext,
        start_locations: Vec<Location>,
        supports_parallel: bool,
    },
    /// The nested graph's entry is ambiguous and needs external input.
    Deferred { decisions: Vec<DeferredDecision> },
    /// The step failed; only this branch is affected.
    Failed { reason: String },
}

pub struct StepOutcome {
    pub branch_id: BranchId,
    pub action: StepAction,
}

/// Run one step for one branch. Never returns an error: anything that goes
/// wrong inside a step becomes `StepAction::Failed` so a bad branch cannot
/// take down its batch.
pub async fn execute_step(
    input: StepInput,
    executor: &dyn SubroutineExecutor,
    navigators: &NavigatorFactory,
    strategy: &dyn DecisionStrategy,
) -> StepOutcome {
    let branch_id = input.branch_id.clone();
    let action = match run_step(input, executor, navigators, strategy).await {
        Ok(action) => action,
        Err(e) => StepAction::Failed {
            reason: e.to_string(),
        },
    };
    StepOutcome { branch_id, action }
}

async fn run_step(
    input: StepInput,
    executor: &dyn SubroutineExecutor,
    navigators: &NavigatorFactory,
    strategy: &dyn DecisionStrategy,
) -> Result<StepAction> {
    let node = input.graph.node(&input.location.location_id)?;

    let Some(subroutine) = &node.subroutine else {
        return Ok(StepAction::NoOp);
    };

    if executor.is_single_step(subroutine) {
        let context =
            SubroutineContextManager::single_step_context(&input.parent_context, node, subroutine);
        return match executor.run(subroutine, context, &input.config).await {
            Ok(result) => Ok(StepAction::Completed {
                node_id: node.id.clone(),
                inputs: result.inputs,
                outputs: result.outputs,
                cost: result.cost,
                complexity: subroutine.complexity,
            }),
            Err(e) => Ok(StepAction::Failed {
                reason: format!("subroutine {}: {e}", subroutine.id),
            }),
        };
    }

    if executor.is_multi_step(subroutine) {
        let nested = subroutine.nested_graph()?;
        let navigator = navigators.get(&nested.kind)?;
        let context = SubroutineContextManager::multi_step_context(
            &input.parent_context,
            node,
            subroutine,
            &nested,
        );
        return match navigator.available_start_locations(
            &nested,
            &context,
            strategy,
            &input.decision_key,
            &input.decisions,
        )? {
            StartOutcome::Start { next_locations } => Ok(StepAction::Spawn {
                node_id: node.id.clone(),
                instance: SubroutineInstanceId::new(),
                context,
                start_locations: next_locations,
                supports_parallel: navigator.supports_parallel_execution(),
            }),
            StartOutcome::Deferred { decisions } => Ok(StepAction::Deferred { decisions }),
            StartOutcome::BranchFailure { reason } => Ok(StepAction::Failed { reason }),
        };
    }

    Err(WayfareError::UnsupportedUnitType(
        subroutine.unit_type.clone(),
    ))
}

/// How the next batch of steps will be executed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConcurrencyMode {
    Sequential,
    Parallel,
}

/// Pick the execution mode for the coming iteration.
///
/// Sequential when any active branch sits in a dialect that disallows
/// concurrency, or when the prospective spend could cross the credit budget.
/// Sequential mode re-checks the budget before every unit, so a limit breach
/// stops the run before the breaching unit executes rather than after the
/// whole batch lands.
pub fn choose_concurrency_mode(run: &RunProgress, prospective_cost: &Credits) -> ConcurrencyMode {
    let dialect_forbids = run
        .branches_with_status(BranchStatus::Active)
        .any(|b| !b.supports_parallel_execution);
    if dialect_forbids {
        return ConcurrencyMode::Sequential;
    }

    let projected = run.metrics.credits_spent.clone() + prospective_cost;
    if projected > run.config.limits.max_credits {
        return ConcurrencyMode::Sequential;
    }

    ConcurrencyMode::Parallel
}
