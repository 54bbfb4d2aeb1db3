use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use wayfare_core::contracts::RunNotifier;
use wayfare_core::error::Result;
use wayfare_core::event::{RunEvent, RunEventBus};
use wayfare_core::progress::RunProgress;
use wayfare_core::types::{DeferredDecision, RunId, RunStatusChangeReason};

/// Notifier that publishes run events on a broadcast bus.
///
/// Plain progress updates are throttled to one per `min_interval`; the loop
/// emits one every iteration and subscribers rarely want that firehose.
/// Status changes and decision requests always go out immediately, and
/// `finalize_send` flushes whatever the throttle was holding back.
pub struct BroadcastNotifier {
    bus: Arc<RunEventBus>,
    min_interval: Duration,
    last_progress: Mutex<Option<Instant>>,
    pending: Mutex<Option<RunEvent>>,
}

impl BroadcastNotifier {
    pub fn new(bus: Arc<RunEventBus>) -> Self {
        Self::with_min_interval(bus, Duration::from_millis(500))
    }

    pub fn with_min_interval(bus: Arc<RunEventBus>, min_interval: Duration) -> Self {
        Self {
            bus,
            min_interval,
            last_progress: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    fn publish_now(&self, event: RunEvent) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.last_progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.bus.publish(event);
    }
}

impl RunNotifier for BroadcastNotifier {
    fn send_progress_update<'a>(
        &'a self,
        run: &'a RunProgress,
        reason: Option<RunStatusChangeReason>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(reason) = reason {
                self.publish_now(RunEvent::StatusChanged {
                    run_id: run.run_id.clone(),
                    status: run.status,
                    reason,
                });
                return Ok(());
            }

            let event = RunEvent::Progress {
                run_id: run.run_id.clone(),
                status: run.status,
                steps_run: run.metrics.steps_run,
                reason: None,
            };

            let due = self
                .last_progress
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .map(|last| last.elapsed() >= self.min_interval)
                .unwrap_or(true);
            if due {
                self.publish_now(event);
            } else {
                *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(event);
            }
            Ok(())
        })
    }

    fn send_decision_request<'a>(
        &'a self,
        run_id: &'a RunId,
        decision: &'a DeferredDecision,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.bus.publish(RunEvent::DecisionRequested {
                run_id: run_id.clone(),
                decision: decision.clone(),
            });
            Ok(())
        })
    }

    fn finalize_send(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(event) = pending {
                self.bus.publish(event);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wayfare_core::config::RunConfig;
    use wayfare_core::progress::LATEST_RUN_PROGRESS_VERSION;
    use wayfare_core::types::{
        DecisionKey, RunMetrics, RunStatus, RunType, UserContext,
    };

    fn sample_run() -> RunProgress {
        RunProgress {
            version: LATEST_RUN_PROGRESS_VERSION,
            run_id: RunId::new(),
            run_type: RunType::RunRoutine,
            status: RunStatus::InProgress,
            status_reason: None,
            config: RunConfig::default(),
            branches: vec![],
            subcontexts: HashMap::new(),
            decisions: HashMap::new(),
            metrics: RunMetrics::default(),
            failed_branch_count: 0,
            owner: UserContext::new("u1"),
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_flushed() {
        let bus = Arc::new(RunEventBus::default());
        let mut rx = bus.subscribe();
        let notifier = BroadcastNotifier::with_min_interval(bus, Duration::from_secs(3600));
        let run = sample_run();

        notifier.send_progress_update(&run, None).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(RunEvent::Progress { .. })));

        // Second update inside the window is held back.
        notifier.send_progress_update(&run, None).await.unwrap();
        assert!(rx.try_recv().is_err());

        notifier.finalize_send().await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(RunEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn test_status_change_bypasses_throttle() {
        let bus = Arc::new(RunEventBus::default());
        let mut rx = bus.subscribe();
        let notifier = BroadcastNotifier::with_min_interval(bus, Duration::from_secs(3600));
        let mut run = sample_run();

        notifier.send_progress_update(&run, None).await.unwrap();
        let _ = rx.try_recv();

        run.status = RunStatus::Completed;
        notifier
            .send_progress_update(&run, Some(RunStatusChangeReason::AllBranchesCompleted))
            .await
            .unwrap();
        match rx.try_recv() {
            Ok(RunEvent::StatusChanged { status, reason, .. }) => {
                assert_eq!(status, RunStatus::Completed);
                assert_eq!(reason, RunStatusChangeReason::AllBranchesCompleted);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decision_requests_are_immediate() {
        let bus = Arc::new(RunEventBus::default());
        let mut rx = bus.subscribe();
        let notifier = BroadcastNotifier::new(bus);

        let decision = DeferredDecision {
            key: DecisionKey("k".into()),
            branch_id: None,
            options: vec![],
            payload: None,
        };
        notifier
            .send_decision_request(&RunId::new(), &decision)
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(RunEvent::DecisionRequested { .. })));
    }
}
