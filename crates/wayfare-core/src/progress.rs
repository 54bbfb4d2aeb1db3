use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::context::SubroutineContext;
use crate::types::{
    BranchId, BranchStatus, DecisionMap, Location, LocationStack, ProcessId, RunId, RunMetrics,
    RunStatus, RunStatusChangeReason, RunType, SubroutineInstanceId, UserContext,
};

/// Schema version written into every persisted `RunProgress`.
pub const LATEST_RUN_PROGRESS_VERSION: u32 = 1;

/// One independently-advancing execution path within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchProgress {
    pub branch_id: BranchId,
    /// Shared by siblings spawned from the same fork point.
    pub process_id: ProcessId,
    /// Groups branches belonging to one multi-step subroutine invocation.
    pub subroutine_instance_id: SubroutineInstanceId,
    /// Set when this branch spawned a nested multi-step subroutine and is
    /// parked waiting for it.
    #[serde(default)]
    pub child_subroutine_instance_id: Option<SubroutineInstanceId>,
    /// Path from run root to current position; top is always current.
    pub location_stack: LocationStack,
    pub status: BranchStatus,
    /// Positions that must not be re-entered (loop prevention).
    #[serde(default)]
    pub closed_locations: Vec<Location>,
    #[serde(default)]
    pub supports_parallel_execution: bool,
    /// Why the branch failed, when it did.
    #[serde(default)]
    pub failure: Option<String>,
}

impl BranchProgress {
    pub fn current_location(&self) -> Option<&Location> {
        self.location_stack.current()
    }

    pub fn is_closed(&self, location: &Location) -> bool {
        self.closed_locations.contains(location)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = BranchStatus::Failed;
        self.failure = Some(reason.into());
    }
}

/// The aggregate root for one run. Exactly one `RunProgress` is mutated per
/// loop iteration; the orchestrator is the single writer for its run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    #[serde(rename = "__version", default = "default_progress_version")]
    pub version: u32,
    pub run_id: RunId,
    pub run_type: RunType,
    pub status: RunStatus,
    #[serde(default)]
    pub status_reason: Option<RunStatusChangeReason>,
    pub config: RunConfig,
    pub branches: Vec<BranchProgress>,
    /// One context per live subroutine instance; removed once merged into the
    /// instance's parent.
    #[serde(default)]
    pub subcontexts: HashMap<SubroutineInstanceId, SubroutineContext>,
    /// Outstanding deferred decisions.
    #[serde(default)]
    pub decisions: DecisionMap,
    #[serde(default)]
    pub metrics: RunMetrics,
    /// How many branches have failed over the life of the run, including
    /// branches already pruned. Decides Completed vs Failed at the end.
    #[serde(default)]
    pub failed_branch_count: u64,
    pub owner: UserContext,
    pub started_at: DateTime<Utc>,
}

fn default_progress_version() -> u32 {
    1
}

impl RunProgress {
    /// Migrate an older stored aggregate forward before resuming.
    pub fn migrate(mut self) -> Self {
        self.config = self.config.migrate();
        self.version = LATEST_RUN_PROGRESS_VERSION;
        self
    }

    pub fn set_status(&mut self, status: RunStatus, reason: RunStatusChangeReason) {
        self.status = status;
        self.status_reason = Some(reason);
    }

    pub fn branch(&self, branch_id: &BranchId) -> Option<&BranchProgress> {
        self.branches.iter().find(|b| &b.branch_id == branch_id)
    }

    pub fn branch_mut(&mut self, branch_id: &BranchId) -> Option<&mut BranchProgress> {
        self.branches.iter_mut().find(|b| &b.branch_id == branch_id)
    }

    pub fn branches_with_status(&self, status: BranchStatus) -> impl Iterator<Item = &BranchProgress> {
        self.branches.iter().filter(move |b| b.status == status)
    }

    pub fn count_with_status(&self, status: BranchStatus) -> usize {
        self.branches_with_status(status).count()
    }

    /// Whether anything can still make progress (or resume).
    pub fn has_live_branches(&self) -> bool {
        self.branches
            .iter()
            .any(|b| matches!(b.status, BranchStatus::Active | BranchStatus::Waiting))
    }

    /// True when at least one branch exists and every branch is `Waiting`.
    pub fn all_branches_waiting(&self) -> bool {
        !self.branches.is_empty()
            && self
                .branches
                .iter()
                .all(|b| b.status == BranchStatus::Waiting)
    }

    /// True when every branch sharing `instance_id` has reached `Completed`.
    /// Gate for merging the instance's outputs into its parent context.
    pub fn instance_completed(&self, instance_id: &SubroutineInstanceId) -> bool {
        let mut any = false;
        for b in &self.branches {
            if &b.subroutine_instance_id == instance_id {
                any = true;
                if b.status != BranchStatus::Completed {
                    return false;
                }
            }
        }
        any
    }

    /// Siblings of `process_id` currently at `location`.
    pub fn siblings_at(&self, process_id: &ProcessId, location: &Location) -> Vec<&BranchProgress> {
        self.branches
            .iter()
            .filter(|b| {
                &b.process_id == process_id && b.current_location() == Some(location)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GraphObjectType;

    fn branch(instance: &SubroutineInstanceId, status: BranchStatus) -> BranchProgress {
        BranchProgress {
            branch_id: BranchId::new(),
            process_id: ProcessId::new(),
            subroutine_instance_id: instance.clone(),
            child_subroutine_instance_id: None,
            location_stack: LocationStack::new(Location::new(
                GraphObjectType::RoutineVersion,
                "R1",
                "n1",
            )),
            status,
            closed_locations: vec![],
            supports_parallel_execution: true,
            failure: None,
        }
    }

    fn run_with(branches: Vec<BranchProgress>) -> RunProgress {
        RunProgress {
            version: LATEST_RUN_PROGRESS_VERSION,
            run_id: RunId::new(),
            run_type: RunType::RunRoutine,
            status: RunStatus::InProgress,
            status_reason: None,
            config: RunConfig::default(),
            branches,
            subcontexts: HashMap::new(),
            decisions: HashMap::new(),
            metrics: RunMetrics::default(),
            failed_branch_count: 0,
            owner: UserContext::new("u1"),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_instance_completed_requires_all_siblings() {
        let instance = SubroutineInstanceId::new();
        let run = run_with(vec![
            branch(&instance, BranchStatus::Completed),
            branch(&instance, BranchStatus::Waiting),
        ]);
        assert!(!run.instance_completed(&instance));

        let run = run_with(vec![
            branch(&instance, BranchStatus::Completed),
            branch(&instance, BranchStatus::Completed),
        ]);
        assert!(run.instance_completed(&instance));

        // No branches with that instance at all: not completed
        assert!(!run.instance_completed(&SubroutineInstanceId::new()));
    }

    #[test]
    fn test_all_branches_waiting() {
        let instance = SubroutineInstanceId::new();
        assert!(!run_with(vec![]).all_branches_waiting());
        assert!(run_with(vec![branch(&instance, BranchStatus::Waiting)]).all_branches_waiting());
        assert!(!run_with(vec![
            branch(&instance, BranchStatus::Waiting),
            branch(&instance, BranchStatus::Active)
        ])
        .all_branches_waiting());
    }

    #[test]
    fn test_progress_round_trip_keeps_version() {
        let instance = SubroutineInstanceId::new();
        let mut run = run_with(vec![branch(&instance, BranchStatus::Active)]);
        run.subcontexts
            .insert(instance.clone(), SubroutineContext::new());

        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"__version\":1"));
        let back: RunProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, LATEST_RUN_PROGRESS_VERSION);
        assert_eq!(back.branches.len(), 1);
        assert!(back.subcontexts.contains_key(&instance));
    }

    #[test]
    fn test_mark_failed_records_reason() {
        let instance = SubroutineInstanceId::new();
        let mut b = branch(&instance, BranchStatus::Active);
        b.mark_failed("location resolved to nothing");
        assert_eq!(b.status, BranchStatus::Failed);
        assert!(b.failure.as_deref().unwrap().contains("resolved"));
    }
}
