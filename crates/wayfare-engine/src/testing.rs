//! In-memory doubles for the engine's contracts, used across the test suite
//! and handy for downstream integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use futures::future::BoxFuture;

use wayfare_core::config::RunConfig;
use wayfare_core::context::SubroutineContext;
use wayfare_core::contracts::{
    GraphLoader, RunNotifier, SubroutineExecutor, SubroutineRunResult,
};
use wayfare_core::error::{Result, WayfareError};
use wayfare_core::graph::{GraphObject, Subroutine};
use wayfare_core::types::{
    Credits, DeferredDecision, GraphObjectType, RunId, RunStatus, RunStatusChangeReason,
    UserContext,
};

/// Serves graph objects from a map.
#[derive(Default)]
pub struct InMemoryLoader {
    objects: HashMap<(GraphObjectType, String), GraphObject>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, graph: GraphObject) -> Self {
        self.objects
            .insert((graph.object_type, graph.object_id.clone()), graph);
        self
    }
}

impl GraphLoader for InMemoryLoader {
    fn load_object<'a>(
        &'a self,
        object_type: GraphObjectType,
        object_id: &'a str,
        _user: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<GraphObject>>> {
        Box::pin(async move {
            Ok(self
                .objects
                .get(&(object_type, object_id.to_string()))
                .cloned())
        })
    }
}

/// Executor with scripted costs, outputs, and failures.
///
/// Classification: a unit type listed via `with_unclassified` is neither
/// single- nor multi-step, `"multi_step"` is multi-step, everything else is
/// single-step. Execution order is recorded for assertions.
pub struct ScriptedExecutor {
    costs: HashMap<String, Credits>,
    outputs: HashMap<String, HashMap<String, serde_json::Value>>,
    failures: HashSet<String>,
    unclassified: HashSet<String>,
    executed: Mutex<Vec<String>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            costs: HashMap::new(),
            outputs: HashMap::new(),
            failures: HashSet::new(),
            unclassified: HashSet::new(),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Fixed cost (and estimate) for every unit of `unit_type`.
    pub fn with_cost(mut self, unit_type: &str, cost: Credits) -> Self {
        self.costs.insert(unit_type.to_string(), cost);
        self
    }

    /// Scripted outputs for the subroutine with this id.
    pub fn with_outputs(
        mut self,
        subroutine_id: &str,
        outputs: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.outputs.insert(subroutine_id.to_string(), outputs);
        self
    }

    /// Make the subroutine with this id fail when run.
    pub fn with_failure(mut self, subroutine_id: &str) -> Self {
        self.failures.insert(subroutine_id.to_string());
        self
    }

    /// Make this unit type classify as neither single- nor multi-step.
    pub fn with_unclassified(mut self, unit_type: &str) -> Self {
        self.unclassified.insert(unit_type.to_string());
        self
    }

    /// Subroutine ids in the order they were run.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SubroutineExecutor for ScriptedExecutor {
    fn is_single_step(&self, subroutine: &Subroutine) -> bool {
        subroutine.unit_type != "multi_step" && !self.unclassified.contains(&subroutine.unit_type)
    }

    fn is_multi_step(&self, subroutine: &Subroutine) -> bool {
        subroutine.unit_type == "multi_step"
    }

    fn estimate_cost(&self, unit_type: &str, _context: &SubroutineContext) -> Credits {
        self.costs.get(unit_type).cloned().unwrap_or_else(Credits::zero)
    }

    fn run<'a>(
        &'a self,
        subroutine: &'a Subroutine,
        context: SubroutineContext,
        _config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<SubroutineRunResult>> {
        Box::pin(async move {
            self.executed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(subroutine.id.clone());

            if self.failures.contains(&subroutine.id) {
                return Err(WayfareError::Execution {
                    subroutine: subroutine.id.clone(),
                    message: "scripted failure".to_string(),
                });
            }

            let outputs = self.outputs.get(&subroutine.id).cloned().unwrap_or_else(|| {
                let mut m = HashMap::new();
                m.insert(
                    "result".to_string(),
                    serde_json::Value::String(format!("done:{}", subroutine.id)),
                );
                m
            });

            Ok(SubroutineRunResult {
                inputs: context.all_inputs.clone(),
                outputs,
                cost: self
                    .costs
                    .get(&subroutine.unit_type)
                    .cloned()
                    .unwrap_or_else(Credits::zero),
            })
        })
    }
}

/// Records every notification instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    progress: Mutex<Vec<(RunStatus, Option<RunStatusChangeReason>)>>,
    decisions: Mutex<Vec<DeferredDecision>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_updates(&self) -> Vec<(RunStatus, Option<RunStatusChangeReason>)> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn decision_requests(&self) -> Vec<DeferredDecision> {
        self.decisions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RunNotifier for RecordingNotifier {
    fn send_progress_update<'a>(
        &'a self,
        run: &'a wayfare_core::progress::RunProgress,
        reason: Option<RunStatusChangeReason>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.progress
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((run.status, reason));
            Ok(())
        })
    }

    fn send_decision_request<'a>(
        &'a self,
        _run_id: &'a RunId,
        decision: &'a DeferredDecision,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.decisions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(decision.clone());
            Ok(())
        })
    }

    fn finalize_send(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
