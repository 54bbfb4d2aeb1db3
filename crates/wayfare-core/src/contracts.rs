use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::config::RunConfig;
use crate::context::SubroutineContext;
use crate::error::Result;
use crate::graph::{GraphObject, Subroutine};
use crate::progress::{BranchProgress, RunProgress};
use crate::types::{
    Credits, DecisionKey, DecisionMap, DeferredDecision, GraphObjectType, Location, RunId,
    RunStatusChangeReason, UserContext,
};

/// Graph storage: fetches a routine/project graph by id.
pub trait GraphLoader: Send + Sync + 'static {
    fn load_object<'a>(
        &'a self,
        object_type: GraphObjectType,
        object_id: &'a str,
        user: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<GraphObject>>>;
}

/// Result of asking a navigator where a graph begins.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Start { next_locations: Vec<Location> },
    Deferred { decisions: Vec<DeferredDecision> },
    BranchFailure { reason: String },
}

/// Result of asking a navigator where to go from a position.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    Advance {
        next_locations: Vec<Location>,
        /// Positions that must not be re-entered by this branch.
        closed_locations: Vec<Location>,
        /// When true the current node still has pending work (e.g. a join
        /// waiting on siblings) and the branch should stay put.
        node_still_active: bool,
    },
    Deferred {
        decisions: Vec<DeferredDecision>,
    },
    BranchFailure {
        reason: String,
    },
}

/// Traversal rules for one graph dialect: a pure function set over graph
/// data. Registered in a `NavigatorFactory` under the dialect's `GraphKind`;
/// adding a dialect never touches the orchestrator.
pub trait Navigator: Send + Sync + 'static {
    /// Static capability flag: whether branches in this dialect may execute
    /// steps concurrently.
    fn supports_parallel_execution(&self) -> bool;

    fn available_start_locations(
        &self,
        graph: &GraphObject,
        context: &SubroutineContext,
        strategy: &dyn DecisionStrategy,
        decision_key: &DecisionKey,
        decisions: &DecisionMap,
    ) -> Result<StartOutcome>;

    #[allow(clippy::too_many_arguments)]
    fn available_next_locations(
        &self,
        graph: &GraphObject,
        current: &Location,
        context: &SubroutineContext,
        strategy: &dyn DecisionStrategy,
        decision_key: &DecisionKey,
        decisions: &DecisionMap,
        config: &RunConfig,
    ) -> Result<AdvanceOutcome>;

    /// Node input name → parent-context composite key.
    fn io_names_passed_into_node(
        &self,
        graph: &GraphObject,
        node_id: &str,
    ) -> Result<HashMap<String, String>> {
        Ok(graph.node(node_id)?.input_map.clone())
    }

    /// Node input name → subroutine input name.
    fn io_names_to_subroutine_inputs(
        &self,
        graph: &GraphObject,
        node_id: &str,
    ) -> Result<HashMap<String, String>> {
        Ok(graph.node(node_id)?.subroutine_input_map.clone())
    }

    /// Subroutine output name → node output name.
    fn io_names_to_subroutine_outputs(
        &self,
        graph: &GraphObject,
        node_id: &str,
    ) -> Result<HashMap<String, String>> {
        Ok(graph.node(node_id)?.subroutine_output_map.clone())
    }

    /// Child-root io name → subroutine input name.
    fn root_io_to_routine_inputs(&self, graph: &GraphObject) -> Result<HashMap<String, String>> {
        Ok(graph.root_input_map.clone())
    }

    /// Child composite key → subroutine output name.
    fn root_io_to_routine_outputs(&self, graph: &GraphObject) -> Result<HashMap<String, String>> {
        Ok(graph.root_output_map.clone())
    }
}

/// How a strategy answered a choice between reachable positions.
#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    Chosen(Location),
    Defer,
}

/// Resolves ambiguous branching choices (human choice, policy, or default)
/// and maintains the run's outstanding decision set.
pub trait DecisionStrategy: Send + Sync + 'static {
    /// Deterministic and stable across resumptions, so a re-poll cannot
    /// duplicate a pending decision.
    fn decision_key(&self, branch: &BranchProgress, purpose: &str) -> DecisionKey {
        default_decision_key(branch, purpose)
    }

    /// Pick one of the reachable positions, or defer for external input.
    fn resolve(
        &self,
        key: &DecisionKey,
        options: &[Location],
        outstanding: &DecisionMap,
    ) -> DecisionOutcome;

    /// Merge newly deferred decisions into the run's outstanding set and/or
    /// re-derive options after a strategy swap.
    fn update_decision_options(
        &self,
        run: &RunProgress,
        new_decisions: &[DeferredDecision],
    ) -> DecisionMap {
        let mut merged = run.decisions.clone();
        for d in new_decisions {
            merged.entry(d.key.clone()).or_insert_with(|| d.clone());
        }
        merged
    }
}

/// `{subroutine_instance_id}:{location_id}:{purpose}`.
pub fn default_decision_key(branch: &BranchProgress, purpose: &str) -> DecisionKey {
    let location = branch
        .current_location()
        .map(|l| l.location_id.as_str())
        .unwrap_or("root");
    DecisionKey(format!(
        "{}:{}:{}",
        branch.subroutine_instance_id, location, purpose
    ))
}

/// What a single-step execution produced.
#[derive(Debug, Clone, Default)]
pub struct SubroutineRunResult {
    /// Inputs as actually consumed (some are resolved at run time), keyed by
    /// subroutine input name.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Outputs keyed by subroutine output name.
    pub outputs: HashMap<String, serde_json::Value>,
    pub cost: Credits,
}

/// Atomic work execution: API calls, code runs, model prompts. The engine
/// depends only on this contract and fails the branch on error.
pub trait SubroutineExecutor: Send + Sync + 'static {
    fn is_single_step(&self, subroutine: &Subroutine) -> bool;

    fn is_multi_step(&self, subroutine: &Subroutine) -> bool;

    /// Prospective cost of running a unit. Implementations that cannot
    /// estimate should return `Credits::unknown_estimate()` to force caution.
    fn estimate_cost(&self, unit_type: &str, context: &SubroutineContext) -> Credits;

    fn run<'a>(
        &'a self,
        subroutine: &'a Subroutine,
        context: SubroutineContext,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<SubroutineRunResult>>;
}

/// Durable run state. Failures here are fatal to the loop; the authoritative
/// state would otherwise diverge from storage.
pub trait RunPersistence: Send + Sync + 'static {
    fn load_progress<'a>(
        &'a self,
        run_id: &'a RunId,
        user: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<RunProgress>>>;

    /// Buffer the latest aggregate state (mark dirty).
    fn save_progress<'a>(&'a self, run: &'a RunProgress) -> BoxFuture<'a, Result<()>>;

    /// Flush buffered writes; optionally drop the buffer afterwards.
    fn finalize_save(&self, clear_cache: bool) -> BoxFuture<'_, Result<()>>;
}

/// Progress/decision event sink. Best-effort: the loop logs and ignores
/// failures from these methods.
pub trait RunNotifier: Send + Sync + 'static {
    fn send_progress_update<'a>(
        &'a self,
        run: &'a RunProgress,
        reason: Option<RunStatusChangeReason>,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_decision_request<'a>(
        &'a self,
        run_id: &'a RunId,
        decision: &'a DeferredDecision,
    ) -> BoxFuture<'a, Result<()>>;

    /// Flush any throttled notifications immediately.
    fn finalize_send(&self) -> BoxFuture<'_, Result<()>>;
}
