use crate::types::{DeferredDecision, RunId, RunStatus, RunStatusChangeReason};

/// Observable run lifecycle events.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Progress {
        run_id: RunId,
        status: RunStatus,
        steps_run: u64,
        reason: Option<RunStatusChangeReason>,
    },
    DecisionRequested {
        run_id: RunId,
        decision: DeferredDecision,
    },
    StatusChanged {
        run_id: RunId,
        status: RunStatus,
        reason: RunStatusChangeReason,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct RunEventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl RunEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
