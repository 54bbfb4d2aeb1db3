use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::{GraphNode, GraphObject, Subroutine};

/// Name/description/instructions of a unit of work, carried on a context so
/// executors can frame what they are doing and why.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl TaskInfo {
    pub fn from_subroutine(subroutine: &Subroutine) -> Self {
        Self {
            name: subroutine.name.clone(),
            description: subroutine
                .outputs
                .first()
                .and_then(|io| io.description.clone()),
            instructions: subroutine.instructions.clone(),
        }
    }
}

/// The I/O memory visible to one subroutine instance.
///
/// Maps are keyed by composite keys `{node_id}.{io_name}`. A context is
/// exclusively owned by its `subroutine_instance_id` entry in the run's
/// subcontext table and is deleted once merged into its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubroutineContext {
    #[serde(default)]
    pub all_inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub all_outputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub current_task: Option<TaskInfo>,
    /// Inherited from the root ancestor, unchanged through nesting.
    #[serde(default)]
    pub overall_task: Option<TaskInfo>,
}

impl SubroutineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by composite key. Outputs shadow inputs.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.all_outputs.get(key).or_else(|| self.all_inputs.get(key))
    }

    pub fn set_input(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.all_inputs.insert(key.into(), value);
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.all_outputs.insert(key.into(), value);
    }
}

/// Builds and merges the contexts carried through a run.
///
/// Parent and child units name their inputs/outputs independently, so
/// crossing a subroutine boundary is a key-space translation through the
/// graph-declared mapping tables. Values are always copied, never moved:
/// the parent context stays valid if the child fails.
pub struct SubroutineContextManager;

impl SubroutineContextManager {
    /// Composite key `{node_id}.{io_name}`.
    pub fn composite_key(node_id: &str, io_name: &str) -> String {
        format!("{node_id}.{io_name}")
    }

    /// Resolve a node's declared inputs against the parent context.
    ///
    /// Translation (a) then (b): node input name → parent composite key for
    /// the value, node input name → subroutine input name for the key it is
    /// delivered under.
    fn resolve_subroutine_inputs(
        parent: &SubroutineContext,
        node: &GraphNode,
    ) -> HashMap<String, serde_json::Value> {
        let mut inputs = HashMap::new();
        for (io_name, composite_key) in &node.input_map {
            let Some(value) = parent.get(composite_key) else {
                continue; // undeclared upstream value; the unit decides if it can cope
            };
            let sub_name = node
                .subroutine_input_map
                .get(io_name)
                .cloned()
                .unwrap_or_else(|| io_name.clone());
            inputs.insert(sub_name, value.clone());
        }
        inputs
    }

    /// Build the child context for a single-step execution at `node`.
    pub fn single_step_context(
        parent: &SubroutineContext,
        node: &GraphNode,
        subroutine: &Subroutine,
    ) -> SubroutineContext {
        SubroutineContext {
            all_inputs: Self::resolve_subroutine_inputs(parent, node),
            all_outputs: HashMap::new(),
            current_task: Some(TaskInfo::from_subroutine(subroutine)),
            overall_task: parent.overall_task.clone(),
        }
    }

    /// Build the context owned by a new multi-step subroutine instance.
    ///
    /// Translation (c): each child-root io name draws from a subroutine
    /// input, which was itself resolved from the parent via (a)+(b).
    pub fn multi_step_context(
        parent: &SubroutineContext,
        node: &GraphNode,
        subroutine: &Subroutine,
        nested: &GraphObject,
    ) -> SubroutineContext {
        let sub_inputs = Self::resolve_subroutine_inputs(parent, node);
        let mut ctx = SubroutineContext {
            all_inputs: HashMap::new(),
            all_outputs: HashMap::new(),
            current_task: Some(TaskInfo::from_subroutine(subroutine)),
            overall_task: parent.overall_task.clone(),
        };
        for (root_io, sub_input) in &nested.root_input_map {
            if let Some(value) = sub_inputs.get(sub_input) {
                ctx.all_inputs.insert(root_io.clone(), value.clone());
            }
        }
        ctx
    }

    /// Translate a single-step result back into the parent's composite-key
    /// space and record it.
    pub fn apply_result_to_parent(
        parent: &mut SubroutineContext,
        node: &GraphNode,
        result_inputs: &HashMap<String, serde_json::Value>,
        result_outputs: &HashMap<String, serde_json::Value>,
    ) {
        // Inputs come back keyed by subroutine input name; reverse (b).
        for (sub_name, value) in result_inputs {
            let io_name = node
                .subroutine_input_map
                .iter()
                .find(|(_, mapped)| *mapped == sub_name)
                .map(|(io, _)| io.clone())
                .unwrap_or_else(|| sub_name.clone());
            parent.set_input(Self::composite_key(&node.id, &io_name), value.clone());
        }

        // Outputs translate through the declared output map.
        for (sub_name, value) in result_outputs {
            let io_name = node
                .subroutine_output_map
                .get(sub_name)
                .cloned()
                .unwrap_or_else(|| sub_name.clone());
            parent.set_output(Self::composite_key(&node.id, &io_name), value.clone());
        }
    }

    /// Merge a finished multi-step subroutine's outputs into its parent.
    ///
    /// Must happen only once every branch of the instance has completed; the
    /// orchestrator enforces that timing.
    pub fn merge_multi_step_outputs(
        parent: &mut SubroutineContext,
        node: &GraphNode,
        nested: &GraphObject,
        child: &SubroutineContext,
    ) {
        let mut surfaced: HashMap<String, serde_json::Value> = HashMap::new();
        for (child_key, sub_output) in &nested.root_output_map {
            if let Some(value) = child.get(child_key) {
                surfaced.insert(sub_output.clone(), value.clone());
            }
        }
        Self::apply_result_to_parent(parent, node, &HashMap::new(), &surfaced);
    }
}
