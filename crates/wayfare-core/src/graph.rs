use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WayfareError};
use crate::types::{GraphObjectType, Location};

/// Tag identifying which graph dialect a `GraphObject` is expressed in.
/// The `NavigatorFactory` maps this tag to a navigator instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct GraphKind(pub String);

impl GraphKind {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for GraphKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared input or output of a subroutine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl IoDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// A leaf unit of work attached to a graph node.
///
/// `unit_type` is interpreted by the `SubroutineExecutor`, which classifies
/// the unit as single-step or multi-step. Multi-step units carry their own
/// nested graph, stored serialized so the object arena never holds recursive
/// links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subroutine {
    pub id: String,
    pub name: String,
    pub unit_type: String,
    #[serde(default)]
    pub complexity: u64,
    #[serde(default)]
    pub inputs: Vec<IoDef>,
    #[serde(default)]
    pub outputs: Vec<IoDef>,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Nested graph for multi-step units, serialized as a `GraphObject`.
    #[serde(default)]
    pub graph: Option<serde_json::Value>,
}

impl Subroutine {
    /// Deserialize the nested graph of a multi-step unit.
    pub fn nested_graph(&self) -> Result<GraphObject> {
        let value = self.graph.as_ref().ok_or_else(|| {
            WayfareError::Config(format!("Subroutine {} has no nested graph", self.id))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// One position in a graph.
///
/// Mapping tables are declared per node and interpreted through the
/// navigator's lookup methods; keys are io names on the referencing side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    /// `None` means the node is pure navigation (e.g. a project directory)
    /// and a step at this position is a no-op.
    #[serde(default)]
    pub subroutine: Option<Subroutine>,
    /// Node input name → composite key in the parent context.
    #[serde(default)]
    pub input_map: HashMap<String, String>,
    /// Node input name → subroutine input name.
    #[serde(default)]
    pub subroutine_input_map: HashMap<String, String>,
    /// Subroutine output name → node output name.
    #[serde(default)]
    pub subroutine_output_map: HashMap<String, String>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subroutine: None,
            input_map: HashMap::new(),
            subroutine_input_map: HashMap::new(),
            subroutine_output_map: HashMap::new(),
        }
    }

    pub fn with_subroutine(mut self, subroutine: Subroutine) -> Self {
        self.subroutine = Some(subroutine);
        self
    }
}

/// A directed link between two nodes of the same graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLink {
    pub from: String,
    pub to: String,
}

impl GraphLink {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A loaded routine or project graph.
///
/// Nodes live in an arena keyed by id and are traversed via id lookups, so
/// loops back to earlier nodes and substructure shared across branches are
/// safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphObject {
    pub object_type: GraphObjectType,
    pub object_id: String,
    pub name: String,
    pub kind: GraphKind,
    #[serde(default)]
    pub complexity: u64,
    pub nodes: HashMap<String, GraphNode>,
    #[serde(default)]
    pub links: Vec<GraphLink>,
    #[serde(default)]
    pub start_node_ids: Vec<String>,
    /// Root io name (the key seeded into a child context) → subroutine input
    /// name it draws from, for multi-step context seeding.
    #[serde(default)]
    pub root_input_map: HashMap<String, String>,
    /// Child-context composite key → subroutine output name, for surfacing a
    /// finished multi-step subroutine's outputs.
    #[serde(default)]
    pub root_output_map: HashMap<String, String>,
    /// Dialect-specific extras the navigator may interpret.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl GraphObject {
    pub fn node(&self, node_id: &str) -> Result<&GraphNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| WayfareError::LocationNotFound {
                object_id: self.object_id.clone(),
                location_id: node_id.to_string(),
            })
    }

    /// The location of a node inside this graph.
    pub fn location_of(&self, node_id: &str) -> Location {
        Location::new(self.object_type, self.object_id.clone(), node_id)
    }

    /// Outgoing link targets for a node, in declaration order.
    pub fn targets_of(&self, node_id: &str) -> Vec<&str> {
        self.links
            .iter()
            .filter(|l| l.from == node_id)
            .map(|l| l.to.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> GraphObject {
        let mut nodes = HashMap::new();
        nodes.insert("a".to_string(), GraphNode::new("a", "First"));
        nodes.insert("b".to_string(), GraphNode::new("b", "Second"));
        GraphObject {
            object_type: GraphObjectType::RoutineVersion,
            object_id: "R1".to_string(),
            name: "Two".to_string(),
            kind: GraphKind::new("sequence"),
            complexity: 2,
            nodes,
            links: vec![GraphLink::new("a", "b")],
            start_node_ids: vec!["a".to_string()],
            root_input_map: HashMap::new(),
            root_output_map: HashMap::new(),
            config: None,
        }
    }

    #[test]
    fn test_node_lookup() {
        let graph = two_node_graph();
        assert!(graph.node("a").is_ok());
        assert!(matches!(
            graph.node("zz"),
            Err(WayfareError::LocationNotFound { .. })
        ));
    }

    #[test]
    fn test_targets_of() {
        let graph = two_node_graph();
        assert_eq!(graph.targets_of("a"), vec!["b"]);
        assert!(graph.targets_of("b").is_empty());
    }

    #[test]
    fn test_nested_graph_round_trip() {
        let nested = serde_json::to_value(two_node_graph()).unwrap();
        let sub = Subroutine {
            id: "s1".to_string(),
            name: "Nested".to_string(),
            unit_type: "multi_step".to_string(),
            complexity: 2,
            inputs: vec![IoDef::new("seed")],
            outputs: vec![],
            instructions: None,
            graph: Some(nested),
        };
        let graph = sub.nested_graph().unwrap();
        assert_eq!(graph.object_id, "R1");
        assert_eq!(graph.start_node_ids, vec!["a"]);
    }

    #[test]
    fn test_nested_graph_missing() {
        let sub = Subroutine {
            id: "s1".to_string(),
            name: "Leaf".to_string(),
            unit_type: "generate".to_string(),
            complexity: 1,
            inputs: vec![],
            outputs: vec![],
            instructions: None,
            graph: None,
        };
        assert!(sub.nested_graph().is_err());
    }
}
