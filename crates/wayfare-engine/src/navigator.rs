use std::collections::HashMap;
use std::sync::Arc;

use wayfare_core::contracts::Navigator;
use wayfare_core::error::{Result, WayfareError};
use wayfare_core::graph::GraphKind;

/// Registry mapping a graph dialect tag to its navigator.
///
/// Constructed once at process start and passed into the orchestrator by
/// dependency injection; there is no ambient global registry. Registering a
/// dialect here is the sole extension point for new graph notations.
#[derive(Default)]
pub struct NavigatorFactory {
    navigators: HashMap<GraphKind, Arc<dyn Navigator>>,
}

impl NavigatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: GraphKind, navigator: Arc<dyn Navigator>) {
        self.navigators.insert(kind, navigator);
    }

    pub fn with_navigator(mut self, kind: GraphKind, navigator: Arc<dyn Navigator>) -> Self {
        self.register(kind, navigator);
        self
    }

    pub fn get(&self, kind: &GraphKind) -> Result<Arc<dyn Navigator>> {
        self.navigators
            .get(kind)
            .cloned()
            .ok_or_else(|| WayfareError::NavigatorNotFound(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&GraphKind> {
        self.navigators.keys().collect()
    }
}
