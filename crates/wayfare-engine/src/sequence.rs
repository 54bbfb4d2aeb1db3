use wayfare_core::config::RunConfig;
use wayfare_core::context::SubroutineContext;
use wayfare_core::contracts::{
    AdvanceOutcome, DecisionOutcome, DecisionStrategy, Navigator, StartOutcome,
};
use wayfare_core::error::Result;
use wayfare_core::graph::GraphObject;
use wayfare_core::types::{DecisionKey, DecisionMap, DeferredDecision, Location};

/// Reference graph dialect: declared start nodes and directed links.
///
/// A node with one outgoing link advances along it; a node with several is a
/// decision point resolved through the strategy, unless the graph's config
/// lists it under `split_nodes`, in which case all targets are taken in
/// parallel. Every node is closed after the branch leaves it, so a sequence
/// never re-enters a position even when the link declarations contain a
/// cycle.
pub struct SequenceNavigator;

impl SequenceNavigator {
    /// Node ids whose fan-out is a parallel split rather than a choice.
    fn is_split_node(graph: &GraphObject, node_id: &str) -> bool {
        graph
            .config
            .as_ref()
            .and_then(|c| c.get("split_nodes"))
            .and_then(|v| v.as_array())
            .map(|nodes| nodes.iter().any(|n| n.as_str() == Some(node_id)))
            .unwrap_or(false)
    }
}

impl Navigator for SequenceNavigator {
    fn supports_parallel_execution(&self) -> bool {
        true
    }

    fn available_start_locations(
        &self,
        graph: &GraphObject,
        _context: &SubroutineContext,
        _strategy: &dyn DecisionStrategy,
        _decision_key: &DecisionKey,
        _decisions: &DecisionMap,
    ) -> Result<StartOutcome> {
        if graph.start_node_ids.is_empty() {
            return Ok(StartOutcome::BranchFailure {
                reason: format!("graph {} declares no start nodes", graph.object_id),
            });
        }
        let mut next_locations = Vec::with_capacity(graph.start_node_ids.len());
        for node_id in &graph.start_node_ids {
            graph.node(node_id)?; // must exist
            next_locations.push(graph.location_of(node_id));
        }
        Ok(StartOutcome::Start { next_locations })
    }

    fn available_next_locations(
        &self,
        graph: &GraphObject,
        current: &Location,
        _context: &SubroutineContext,
        strategy: &dyn DecisionStrategy,
        decision_key: &DecisionKey,
        decisions: &DecisionMap,
        _config: &RunConfig,
    ) -> Result<AdvanceOutcome> {
        graph.node(&current.location_id)?;

        let targets = graph.targets_of(&current.location_id);
        let closed_locations = vec![current.clone()];

        let next_locations: Vec<Location> = match targets.len() {
            0 => vec![],
            1 => vec![graph.location_of(targets[0])],
            _ if Self::is_split_node(graph, &current.location_id) => {
                targets.iter().map(|t| graph.location_of(t)).collect()
            }
            _ => {
                let options: Vec<Location> =
                    targets.iter().map(|t| graph.location_of(t)).collect();
                match strategy.resolve(decision_key, &options, decisions) {
                    DecisionOutcome::Chosen(location) => vec![location],
                    DecisionOutcome::Defer => {
                        return Ok(AdvanceOutcome::Deferred {
                            decisions: vec![DeferredDecision {
                                key: decision_key.clone(),
                                branch_id: None,
                                options,
                                payload: None,
                            }],
                        });
                    }
                }
            }
        };

        Ok(AdvanceOutcome::Advance {
            next_locations,
            closed_locations,
            node_still_active: false,
        })
    }
}
