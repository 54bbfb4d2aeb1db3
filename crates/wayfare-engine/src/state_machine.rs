use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use wayfare_core::config::{BranchFailureBehavior, LimitBehavior, RunConfig};
use wayfare_core::context::{SubroutineContext, SubroutineContextManager, TaskInfo};
use wayfare_core::contracts::{
    AdvanceOutcome, DecisionStrategy, GraphLoader, RunNotifier, RunPersistence, SubroutineExecutor,
};
use wayfare_core::error::{Result, WayfareError};
use wayfare_core::graph::GraphObject;
use wayfare_core::progress::{BranchProgress, RunProgress, LATEST_RUN_PROGRESS_VERSION};
use wayfare_core::types::{
    BranchId, BranchStatus, Credits, DecisionKey, DeferredDecision, GraphObjectType, Location,
    LocationStack, ProcessId, RunId, RunMetrics, RunStatus, RunStatusChangeReason, RunType,
    SubroutineInstanceId, UserContext,
};

use crate::navigator::NavigatorFactory;
use crate::step::{
    choose_concurrency_mode, execute_step, ConcurrencyMode, StepAction, StepInput, StepOutcome,
};

/// Hard cap on loop iterations. A healthy run ends long before this; hitting
/// the cap means navigation never converged.
pub const MAX_RUN_LOOPS: u64 = 10_000;

/// Batch size for parallel step execution.
pub const MAX_PARALLEL_BRANCHES: usize = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for controlling a run from outside the loop.
///
/// Requests are recorded immediately but observed only at the top of the
/// next loop iteration; a mid-iteration request never tears a batch apart.
#[derive(Clone, Default)]
pub struct RunControl {
    pending_config: Arc<Mutex<Option<RunConfig>>>,
    stop_request: Arc<Mutex<Option<RunStatus>>>,
    pending_resolutions: Arc<Mutex<Vec<(DecisionKey, Location)>>>,
}

impl RunControl {
    /// Ask the run to stop with `Paused` or `Cancelled`.
    pub fn stop_run(&self, status: RunStatus) -> Result<()> {
        if !matches!(status, RunStatus::Paused | RunStatus::Cancelled) {
            return Err(WayfareError::Config(format!(
                "stop status must be Paused or Cancelled, got {status}"
            )));
        }
        *lock(&self.stop_request) = Some(status);
        Ok(())
    }

    /// Swap the run's configuration. Applied atomically at the next
    /// iteration boundary.
    pub fn update_run_config(&self, config: RunConfig) {
        *lock(&self.pending_config) = Some(config);
    }

    /// Answer an outstanding deferred decision. Ignored if the key is
    /// unknown or the choice is not among the recorded options.
    pub fn resolve_decision(&self, key: DecisionKey, choice: Location) {
        lock(&self.pending_resolutions).push((key, choice));
    }
}

/// The run orchestrator: drives one run's graph traversal to a terminal or
/// paused status.
///
/// All domain effects go through the injected contracts; the machine itself
/// only owns the aggregate and the loop. One machine drives one run at a
/// time and is the single writer for that run's state.
pub struct RunStateMachine {
    loader: Arc<dyn GraphLoader>,
    navigators: Arc<NavigatorFactory>,
    executor: Arc<dyn SubroutineExecutor>,
    persistence: Arc<dyn RunPersistence>,
    notifier: Arc<dyn RunNotifier>,
    strategy: Arc<dyn DecisionStrategy>,
    control: RunControl,
    run: Option<RunProgress>,
    user: Option<UserContext>,
    max_loops: u64,
}

impl RunStateMachine {
    pub fn new(
        loader: Arc<dyn GraphLoader>,
        navigators: Arc<NavigatorFactory>,
        executor: Arc<dyn SubroutineExecutor>,
        persistence: Arc<dyn RunPersistence>,
        notifier: Arc<dyn RunNotifier>,
        strategy: Arc<dyn DecisionStrategy>,
    ) -> Self {
        Self {
            loader,
            navigators,
            executor,
            persistence,
            notifier,
            strategy,
            control: RunControl::default(),
            run: None,
            user: None,
            max_loops: MAX_RUN_LOOPS,
        }
    }

    /// Control handle usable concurrently with `run`.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// The current aggregate, if initialized.
    pub fn progress(&self) -> Option<&RunProgress> {
        self.run.as_ref()
    }

    /// Swap the decision strategy and re-derive the outstanding decision set
    /// under the new policy.
    pub fn set_decision_strategy(&mut self, strategy: Arc<dyn DecisionStrategy>) {
        self.strategy = strategy;
        if let Some(run) = &mut self.run {
            run.decisions = self.strategy.update_decision_options(run, &[]);
        }
    }

    /// Set up a brand-new run starting from `start_locations`. All start
    /// locations must point into the same root object. The initial aggregate
    /// is persisted before this returns, so a crash right after never loses
    /// the run.
    pub async fn init_new_run(
        &mut self,
        start_locations: Vec<Location>,
        config: RunConfig,
        user: UserContext,
    ) -> Result<RunId> {
        let first = start_locations
            .first()
            .ok_or(WayfareError::NoStartLocations)?
            .clone();
        for location in &start_locations[1..] {
            if !first.same_object(location) {
                return Err(WayfareError::MismatchedStartLocations(
                    first.to_string(),
                    location.to_string(),
                ));
            }
        }

        let object = self
            .loader
            .load_object(first.object_type, &first.object_id, &user)
            .await?
            .ok_or_else(|| WayfareError::ObjectNotFound {
                object_type: first.object_type.to_string(),
                object_id: first.object_id.clone(),
            })?;
        let navigator = self.navigators.get(&object.kind)?;
        let supports_parallel = navigator.supports_parallel_execution();

        let run_type = match first.object_type {
            GraphObjectType::RoutineVersion => RunType::RunRoutine,
            GraphObjectType::ProjectVersion => RunType::RunProject,
        };

        let instance = SubroutineInstanceId::new();
        let mut context = SubroutineContext::new();
        context.overall_task = Some(TaskInfo {
            name: object.name.clone(),
            description: None,
            instructions: None,
        });

        let branches = fork_branches(None, &start_locations, &instance, supports_parallel, None);
        let mut subcontexts = HashMap::new();
        subcontexts.insert(instance, context);

        let run = RunProgress {
            version: LATEST_RUN_PROGRESS_VERSION,
            run_id: RunId::new(),
            run_type,
            status: RunStatus::InProgress,
            status_reason: None,
            config,
            branches,
            subcontexts,
            decisions: HashMap::new(),
            metrics: RunMetrics::default(),
            failed_branch_count: 0,
            owner: user.clone(),
            started_at: Utc::now(),
        };

        self.persistence.save_progress(&run).await?;
        self.persistence.finalize_save(false).await?;
        tracing::info!(run_id = %run.run_id, branches = run.branches.len(), "run initialized");

        let run_id = run.run_id.clone();
        self.run = Some(run);
        self.user = Some(user);
        Ok(run_id)
    }

    /// Pick up a previously persisted run and prepare it to continue.
    /// The stored aggregate is migrated forward first; a run with no live
    /// branches cannot be resumed.
    pub async fn init_existing_run(&mut self, run_id: &RunId, user: UserContext) -> Result<()> {
        let stored = self
            .persistence
            .load_progress(run_id, &user)
            .await?
            .ok_or_else(|| WayfareError::RunNotFound(run_id.to_string()))?;
        let mut run = stored.migrate();

        if !run.has_live_branches() {
            return Err(WayfareError::NothingToResume(run_id.to_string()));
        }

        run.status = RunStatus::InProgress;
        run.status_reason = None;
        run.config.loop_config.reset();
        tracing::info!(%run_id, branches = run.branches.len(), "run resumed");

        self.run = Some(run);
        self.user = Some(user);
        Ok(())
    }

    /// Drive the run until it reaches a terminal or paused status.
    ///
    /// Whatever happens inside the loop, the final aggregate is saved,
    /// buffered writes are flushed, and a last progress notification goes
    /// out before this returns.
    pub async fn run(&mut self) -> Result<RunProgress> {
        let user = self.user.clone().ok_or(WayfareError::NotInitialized)?;
        let mut run = self.run.take().ok_or(WayfareError::NotInitialized)?;

        let drive_result = self.drive(&mut run, &user).await;

        let save_result = match self.persistence.save_progress(&run).await {
            Ok(()) => self.persistence.finalize_save(run.status.is_terminal()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self
            .notifier
            .send_progress_update(&run, run.status_reason)
            .await
        {
            tracing::warn!(error = %e, "final progress notification failed");
        }
        if let Err(e) = self.notifier.finalize_send().await {
            tracing::warn!(error = %e, "notification flush failed");
        }

        tracing::info!(
            run_id = %run.run_id,
            status = %run.status,
            steps = run.metrics.steps_run,
            credits = %run.metrics.credits_spent,
            "run loop exited"
        );

        self.run = Some(run.clone());
        drive_result?;
        save_result?;
        Ok(run)
    }

    async fn drive(&self, run: &mut RunProgress, user: &UserContext) -> Result<()> {
        let mut last_tick = Instant::now();
        let mut loops: u64 = 0;

        loop {
            loops += 1;
            if loops > self.max_loops {
                tracing::error!(run_id = %run.run_id, "loop iteration cap reached");
                run.set_status(RunStatus::Failed, RunStatusChangeReason::MaxLoops);
                break;
            }

            // Control requests land at iteration boundaries only.
            if let Some(config) = lock(&self.control.pending_config).take() {
                tracing::info!(run_id = %run.run_id, "run config updated");
                run.config = config;
            }
            let resolutions: Vec<(DecisionKey, Location)> =
                lock(&self.control.pending_resolutions).drain(..).collect();
            for (key, choice) in resolutions {
                match run.decisions.get_mut(&key) {
                    Some(decision) if decision.options.contains(&choice) => {
                        decision.options = vec![choice];
                    }
                    _ => {
                        tracing::warn!(%key, "decision resolution ignored: unknown key or option")
                    }
                }
            }
            if let Some(status) = lock(&self.control.stop_request).take() {
                run.set_status(status, RunStatusChangeReason::StopRequested);
                break;
            }

            // Wall-clock accrual includes time spent waiting.
            let now = Instant::now();
            run.metrics.time_elapsed_ms += now.duration_since(last_tick).as_millis() as u64;
            last_tick = now;

            if let Some((status, reason)) = limit_breach(run) {
                run.set_status(status, reason);
                break;
            }

            let failed_before = run.failed_branch_count;
            let graphs = self.resolve_graphs(run, user).await;

            if !run.has_live_branches() {
                finish(run);
                break;
            }

            if run.all_branches_waiting() {
                run.config.loop_config.back_off();
            } else {
                run.config.loop_config.reset();
            }

            let mut outbox: Vec<DeferredDecision> = Vec::new();

            let stop = self.execute_phase(run, &graphs, &mut outbox).await;
            // Completed work is saved before a limit stop is honored.
            self.persistence.save_progress(run).await?;
            if let Some((status, reason)) = stop {
                run.set_status(status, reason);
                break;
            }

            self.advance_branches(run, &graphs, &mut outbox);

            for decision in outbox.drain(..) {
                if let Err(e) = self
                    .notifier
                    .send_decision_request(&run.run_id, &decision)
                    .await
                {
                    tracing::warn!(error = %e, key = %decision.key, "decision notification failed");
                }
            }

            if run.failed_branch_count > failed_before {
                match run.config.on_branch_failure {
                    BranchFailureBehavior::Continue => {}
                    BranchFailureBehavior::Pause => {
                        run.set_status(RunStatus::Paused, RunStatusChangeReason::BranchFailure);
                        break;
                    }
                    BranchFailureBehavior::Stop => {
                        run.set_status(RunStatus::Failed, RunStatusChangeReason::BranchFailure);
                        break;
                    }
                }
            }

            // Failed branches kept until now for the policy check above.
            run.branches.retain(|b| b.status != BranchStatus::Failed);

            self.merge_completed_instances(run, &graphs);

            if !run.has_live_branches() {
                finish(run);
                break;
            }

            if run.all_branches_waiting()
                && run.config.loop_config.current_loop_delay_ms
                    >= run.config.loop_config.max_loop_delay_ms
            {
                run.set_status(RunStatus::Paused, RunStatusChangeReason::AllBranchesWaiting);
                break;
            }

            self.persistence.save_progress(run).await?;

            if let Err(e) = self.notifier.send_progress_update(run, None).await {
                tracing::warn!(error = %e, "progress notification failed");
            }

            tokio::time::sleep(Duration::from_millis(
                run.config.loop_config.current_loop_delay_ms,
            ))
            .await;
        }

        Ok(())
    }

    /// Load the graph each live branch currently sits in. Branches whose
    /// position cannot be resolved are failed here.
    async fn resolve_graphs(
        &self,
        run: &mut RunProgress,
        user: &UserContext,
    ) -> HashMap<BranchId, Arc<GraphObject>> {
        let mut cache: HashMap<(GraphObjectType, String), Arc<GraphObject>> = HashMap::new();
        let mut resolved = HashMap::new();
        let mut failures: Vec<(BranchId, String)> = Vec::new();

        let live: Vec<(BranchId, Option<Location>)> = run
            .branches
            .iter()
            .filter(|b| matches!(b.status, BranchStatus::Active | BranchStatus::Waiting))
            .map(|b| (b.branch_id.clone(), b.current_location().cloned()))
            .collect();

        for (branch_id, location) in live {
            let Some(location) = location else {
                failures.push((branch_id, "branch has no current location".to_string()));
                continue;
            };
            let cache_key = (location.object_type, location.object_id.clone());
            if let Some(graph) = cache.get(&cache_key) {
                resolved.insert(branch_id, Arc::clone(graph));
                continue;
            }
            match self
                .loader
                .load_object(location.object_type, &location.object_id, user)
                .await
            {
                Ok(Some(graph)) => {
                    let graph = Arc::new(graph);
                    cache.insert(cache_key, Arc::clone(&graph));
                    resolved.insert(branch_id, graph);
                }
                Ok(None) => {
                    failures.push((branch_id, format!("graph object not found: {location}")));
                }
                Err(e) => failures.push((branch_id, e.to_string())),
            }
        }

        for (branch_id, reason) in failures {
            fail_branch(run, &branch_id, reason);
        }
        resolved
    }

    /// Execute one step for every branch that is due for one. Returns a
    /// status/reason pair when a resource limit interrupts the batch.
    async fn execute_phase(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
        outbox: &mut Vec<DeferredDecision>,
    ) -> Option<(RunStatus, RunStatusChangeReason)> {
        let inputs = self.build_step_inputs(run, graphs);
        if inputs.is_empty() {
            return None;
        }

        let prospective = Credits::checked_sum(inputs.iter().map(|(_, estimate)| estimate));
        match choose_concurrency_mode(run, &prospective) {
            ConcurrencyMode::Sequential => {
                for (input, estimate) in inputs {
                    // The budget is re-checked before each unit so a breach
                    // stops the run before the breaching unit executes.
                    let projected = run.metrics.credits_spent.clone() + &estimate;
                    if projected > run.config.limits.max_credits {
                        return Some((
                            limit_status(run.config.limits.on_max_credits),
                            RunStatusChangeReason::MaxCredits,
                        ));
                    }
                    let outcome = execute_step(
                        input,
                        self.executor.as_ref(),
                        self.navigators.as_ref(),
                        self.strategy.as_ref(),
                    )
                    .await;
                    self.apply_step_outcome(run, graphs, outcome, outbox);
                    if let Some(stop) = limit_breach(run) {
                        return Some(stop);
                    }
                }
            }
            ConcurrencyMode::Parallel => {
                let mut queue: VecDeque<StepInput> =
                    inputs.into_iter().map(|(input, _)| input).collect();
                while !queue.is_empty() {
                    let batch: Vec<StepInput> = (0..MAX_PARALLEL_BRANCHES)
                        .filter_map(|_| queue.pop_front())
                        .collect();
                    let outcomes = join_all(batch.into_iter().map(|input| {
                        execute_step(
                            input,
                            self.executor.as_ref(),
                            self.navigators.as_ref(),
                            self.strategy.as_ref(),
                        )
                    }))
                    .await;
                    for outcome in outcomes {
                        self.apply_step_outcome(run, graphs, outcome, outbox);
                    }
                    if let Some(stop) = limit_breach(run) {
                        return Some(stop);
                    }
                }
            }
        }
        None
    }

    /// Snapshot a `StepInput` (plus cost estimate) for every branch whose
    /// current position has not executed yet.
    fn build_step_inputs(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
    ) -> Vec<(StepInput, Credits)> {
        let due: Vec<BranchId> = run
            .branches
            .iter()
            .filter(|b| is_step_due(b))
            .map(|b| b.branch_id.clone())
            .collect();

        let mut inputs = Vec::new();
        let mut missing_context: Vec<(BranchId, SubroutineInstanceId)> = Vec::new();

        for branch_id in due {
            let Some(graph) = graphs.get(&branch_id) else {
                continue;
            };
            let Some(branch) = run.branch(&branch_id) else {
                continue;
            };
            let Some(location) = branch.current_location().cloned() else {
                continue;
            };
            let instance = branch.subroutine_instance_id.clone();
            let decision_key = self.strategy.decision_key(branch, "start");

            let Some(context) = run.subcontexts.get(&instance).cloned() else {
                missing_context.push((branch_id, instance));
                continue;
            };

            let estimate = graph
                .nodes
                .get(&location.location_id)
                .and_then(|node| node.subroutine.as_ref())
                .map(|sub| self.executor.estimate_cost(&sub.unit_type, &context))
                .unwrap_or_else(Credits::zero);

            inputs.push((
                StepInput {
                    branch_id,
                    instance_id: instance,
                    location,
                    graph: Arc::clone(graph),
                    parent_context: context,
                    decisions: run.decisions.clone(),
                    config: run.config.clone(),
                    decision_key,
                },
                estimate,
            ));
        }

        for (branch_id, instance) in missing_context {
            fail_branch(
                run,
                &branch_id,
                WayfareError::ContextNotFound(instance.to_string()).to_string(),
            );
        }
        inputs
    }

    fn apply_step_outcome(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
        outcome: StepOutcome,
        outbox: &mut Vec<DeferredDecision>,
    ) {
        let branch_id = outcome.branch_id;
        match outcome.action {
            StepAction::NoOp => {
                // Pure navigation node; close it so the branch advances.
                close_current(run, &branch_id);
            }
            StepAction::Completed {
                node_id,
                inputs,
                outputs,
                cost,
                complexity,
            } => {
                let instance = match run.branch(&branch_id) {
                    Some(b) => b.subroutine_instance_id.clone(),
                    None => return,
                };
                if let (Some(graph), Some(context)) =
                    (graphs.get(&branch_id), run.subcontexts.get_mut(&instance))
                {
                    if let Ok(node) = graph.node(&node_id) {
                        SubroutineContextManager::apply_result_to_parent(
                            context, node, &inputs, &outputs,
                        );
                    }
                }
                run.metrics.credits_spent += &cost;
                run.metrics.steps_run += 1;
                run.metrics.complexity_completed += complexity;
                close_current(run, &branch_id);
                tracing::debug!(branch = %branch_id, node = %node_id, cost = %cost, "step completed");
            }
            StepAction::Spawn {
                node_id,
                instance,
                context,
                start_locations,
                supports_parallel,
            } => {
                let (base_stack, start_key) = match run.branch(&branch_id) {
                    Some(b) => (
                        b.location_stack.clone(),
                        self.strategy.decision_key(b, "start"),
                    ),
                    None => return,
                };
                if let Some(branch) = run.branch_mut(&branch_id) {
                    branch.status = BranchStatus::Waiting;
                    branch.child_subroutine_instance_id = Some(instance.clone());
                }
                // The entry choice behind this key is now made, and the node
                // is claimed for the whole process group.
                run.decisions.remove(&start_key);
                close_current(run, &branch_id);
                run.subcontexts.insert(instance.clone(), context);
                let spawned = fork_branches(
                    None,
                    &start_locations,
                    &instance,
                    supports_parallel,
                    Some(&base_stack),
                );
                tracing::debug!(
                    branch = %branch_id,
                    node = %node_id,
                    spawned = spawned.len(),
                    "descended into nested graph"
                );
                run.branches.extend(spawned);
            }
            StepAction::Deferred { decisions } => {
                if let Some(branch) = run.branch_mut(&branch_id) {
                    branch.status = BranchStatus::Waiting;
                }
                self.register_decisions(run, &branch_id, decisions, outbox);
            }
            StepAction::Failed { reason } => fail_branch(run, &branch_id, reason),
        }
    }

    /// Move every branch whose step is done to its next position(s).
    fn advance_branches(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
        outbox: &mut Vec<DeferredDecision>,
    ) {
        let candidates: Vec<BranchId> = run
            .branches
            .iter()
            .filter(|b| is_advance_due(b))
            .map(|b| b.branch_id.clone())
            .collect();

        for branch_id in candidates {
            let Some(graph) = graphs.get(&branch_id) else {
                continue;
            };
            let snapshot = match run.branch(&branch_id) {
                Some(branch) => branch.current_location().cloned().map(|location| {
                    (
                        branch.subroutine_instance_id.clone(),
                        location,
                        self.strategy.decision_key(branch, "navigation"),
                    )
                }),
                None => continue,
            };
            let Some((instance, location, decision_key)) = snapshot else {
                continue;
            };

            let navigator = match self.navigators.get(&graph.kind) {
                Ok(navigator) => navigator,
                Err(e) => {
                    fail_branch(run, &branch_id, e.to_string());
                    continue;
                }
            };
            let context = run.subcontexts.get(&instance).cloned().unwrap_or_default();

            let outcome = navigator.available_next_locations(
                graph,
                &location,
                &context,
                self.strategy.as_ref(),
                &decision_key,
                &run.decisions,
                &run.config,
            );

            match outcome {
                Err(e) => fail_branch(run, &branch_id, e.to_string()),
                Ok(AdvanceOutcome::BranchFailure { reason }) => {
                    fail_branch(run, &branch_id, reason)
                }
                Ok(AdvanceOutcome::Deferred { decisions }) => {
                    if let Some(branch) = run.branch_mut(&branch_id) {
                        branch.status = BranchStatus::Waiting;
                    }
                    self.register_decisions(run, &branch_id, decisions, outbox);
                }
                Ok(AdvanceOutcome::Advance {
                    next_locations,
                    closed_locations,
                    node_still_active,
                }) => {
                    let (process_id, supports_parallel, mut next) = {
                        let Some(branch) = run.branch_mut(&branch_id) else {
                            continue;
                        };
                        for closed in closed_locations {
                            if !branch.closed_locations.contains(&closed) {
                                branch.closed_locations.push(closed);
                            }
                        }
                        let next: Vec<Location> = next_locations
                            .into_iter()
                            .filter(|l| !branch.closed_locations.contains(l))
                            .collect();
                        if node_still_active {
                            branch.status = BranchStatus::Waiting;
                            continue;
                        }
                        if next.is_empty() {
                            branch.status = BranchStatus::Completed;
                            tracing::debug!(branch = %branch_id, "branch completed");
                            continue;
                        }
                        branch.status = BranchStatus::Active;
                        (
                            branch.process_id.clone(),
                            branch.supports_parallel_execution,
                            next,
                        )
                    };

                    // The choice behind this key is now made.
                    run.decisions.remove(&decision_key);

                    let first = next.remove(0);
                    if let Some(branch) = run.branch_mut(&branch_id) {
                        branch.location_stack.replace_current(first.clone());
                    }

                    // Converging siblings merge: whoever was parked at the
                    // join is absorbed by the arriving branch.
                    let parked: Vec<BranchId> = run
                        .branches
                        .iter()
                        .filter(|s| {
                            s.branch_id != branch_id
                                && s.process_id == process_id
                                && matches!(s.status, BranchStatus::Active | BranchStatus::Waiting)
                                && s.child_subroutine_instance_id.is_none()
                                && s.current_location() == Some(&first)
                        })
                        .map(|s| s.branch_id.clone())
                        .collect();
                    for sibling_id in parked {
                        if let Some(sibling) = run.branch_mut(&sibling_id) {
                            sibling.status = BranchStatus::Completed;
                        }
                    }

                    if !next.is_empty() {
                        if let Some(starting) = run.branch(&branch_id).cloned() {
                            let forked = fork_branches(
                                Some(&starting),
                                &next,
                                &instance,
                                supports_parallel,
                                None,
                            );
                            tracing::debug!(branch = %branch_id, forked = forked.len(), "branch forked");
                            run.branches.extend(forked);
                        }
                    }
                }
            }
        }
    }

    /// Fold finished subroutine instances back into their parents and wake
    /// the parked parent branches.
    fn merge_completed_instances(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
    ) {
        let mut instances: Vec<SubroutineInstanceId> = run
            .branches
            .iter()
            .map(|b| b.subroutine_instance_id.clone())
            .collect();
        instances.sort();
        instances.dedup();

        for instance in instances {
            if !run.instance_completed(&instance) {
                continue;
            }
            let Some(parent_id) = run
                .branches
                .iter()
                .find(|b| b.child_subroutine_instance_id.as_ref() == Some(&instance))
                .map(|b| b.branch_id.clone())
            else {
                // Root instance: terminal handling picks it up.
                continue;
            };

            let child_context = run.subcontexts.remove(&instance).unwrap_or_default();
            match self.merge_into_parent(run, graphs, &parent_id, &child_context) {
                Ok(()) => {
                    if let Some(parent) = run.branch_mut(&parent_id) {
                        parent.status = BranchStatus::Active;
                        parent.child_subroutine_instance_id = None;
                    }
                    // The node's work is done; the parent should advance,
                    // not re-enter it.
                    close_current(run, &parent_id);
                    tracing::debug!(branch = %parent_id, instance = %instance, "nested instance merged");
                }
                Err(e) => fail_branch(run, &parent_id, e.to_string()),
            }
            run.branches
                .retain(|b| b.subroutine_instance_id != instance);
        }
    }

    fn merge_into_parent(
        &self,
        run: &mut RunProgress,
        graphs: &HashMap<BranchId, Arc<GraphObject>>,
        parent_id: &BranchId,
        child: &SubroutineContext,
    ) -> Result<()> {
        let (parent_instance, location) = {
            let parent = run
                .branch(parent_id)
                .ok_or_else(|| WayfareError::Config(format!("branch {parent_id} vanished")))?;
            let location = parent
                .current_location()
                .cloned()
                .ok_or_else(|| WayfareError::Config("parent branch has no position".to_string()))?;
            (parent.subroutine_instance_id.clone(), location)
        };
        let graph = graphs
            .get(parent_id)
            .ok_or_else(|| WayfareError::ObjectNotFound {
                object_type: location.object_type.to_string(),
                object_id: location.object_id.clone(),
            })?;
        let node = graph.node(&location.location_id)?;
        let subroutine = node.subroutine.as_ref().ok_or_else(|| {
            WayfareError::Config(format!("node {} has no subroutine to merge", node.id))
        })?;
        let nested = subroutine.nested_graph()?;
        let parent_context = run
            .subcontexts
            .get_mut(&parent_instance)
            .ok_or_else(|| WayfareError::ContextNotFound(parent_instance.to_string()))?;
        SubroutineContextManager::merge_multi_step_outputs(parent_context, node, &nested, child);
        Ok(())
    }

    fn register_decisions(
        &self,
        run: &mut RunProgress,
        branch_id: &BranchId,
        mut decisions: Vec<DeferredDecision>,
        outbox: &mut Vec<DeferredDecision>,
    ) {
        for decision in &mut decisions {
            if decision.branch_id.is_none() {
                decision.branch_id = Some(branch_id.clone());
            }
        }
        // Re-polling an already registered decision must not re-notify.
        for decision in &decisions {
            if !run.decisions.contains_key(&decision.key) {
                outbox.push(decision.clone());
            }
        }
        run.decisions = self.strategy.update_decision_options(run, &decisions);
    }
}

/// A branch is due for a step when it is live, not parked on a child, and
/// its current position has not executed yet.
fn is_step_due(branch: &BranchProgress) -> bool {
    let live = match branch.status {
        BranchStatus::Active => true,
        BranchStatus::Waiting => branch.child_subroutine_instance_id.is_none(),
        _ => false,
    };
    live && branch
        .current_location()
        .map(|l| !branch.closed_locations.contains(l))
        .unwrap_or(false)
}

/// A branch is due for navigation once its current position has executed.
fn is_advance_due(branch: &BranchProgress) -> bool {
    let live = match branch.status {
        BranchStatus::Active => true,
        BranchStatus::Waiting => branch.child_subroutine_instance_id.is_none(),
        _ => false,
    };
    live && branch
        .current_location()
        .map(|l| branch.closed_locations.contains(l))
        .unwrap_or(false)
}

/// Close the branch's current location for its entire process group. A
/// location executed once is done for every sibling on the same process;
/// a sibling arriving there later is absorbed instead of re-running it.
fn close_current(run: &mut RunProgress, branch_id: &BranchId) {
    let snapshot = run.branch(branch_id).and_then(|branch| {
        branch
            .current_location()
            .cloned()
            .map(|location| (branch.process_id.clone(), location))
    });
    let Some((process_id, location)) = snapshot else {
        return;
    };
    for branch in run
        .branches
        .iter_mut()
        .filter(|b| b.process_id == process_id)
    {
        if !branch.closed_locations.contains(&location) {
            branch.closed_locations.push(location.clone());
        }
    }
}

fn fail_branch(run: &mut RunProgress, branch_id: &BranchId, reason: impl Into<String>) {
    let reason = reason.into();
    let newly_failed = match run.branch_mut(branch_id) {
        Some(branch) if branch.status != BranchStatus::Failed => {
            branch.mark_failed(reason.clone());
            true
        }
        _ => false,
    };
    if newly_failed {
        run.failed_branch_count += 1;
        tracing::warn!(branch = %branch_id, %reason, "branch failed");
    }
}

fn finish(run: &mut RunProgress) {
    if run.failed_branch_count > 0 {
        run.set_status(RunStatus::Failed, RunStatusChangeReason::BranchFailure);
    } else {
        run.set_status(
            RunStatus::Completed,
            RunStatusChangeReason::AllBranchesCompleted,
        );
    }
}

fn limit_status(behavior: LimitBehavior) -> RunStatus {
    match behavior {
        LimitBehavior::Pause => RunStatus::Paused,
        LimitBehavior::Fail => RunStatus::Failed,
    }
}

fn limit_breach(run: &RunProgress) -> Option<(RunStatus, RunStatusChangeReason)> {
    let limits = &run.config.limits;
    if run.metrics.time_elapsed_ms >= limits.max_time_ms {
        return Some((
            limit_status(limits.on_max_time),
            RunStatusChangeReason::MaxTime,
        ));
    }
    if run.metrics.credits_spent > limits.max_credits {
        return Some((
            limit_status(limits.on_max_credits),
            RunStatusChangeReason::MaxCredits,
        ));
    }
    if run.metrics.steps_run >= limits.max_steps {
        return Some((
            limit_status(limits.on_max_steps),
            RunStatusChangeReason::MaxSteps,
        ));
    }
    None
}

/// Create one branch per location.
///
/// `starting` is the branch being forked when siblings split off mid-run;
/// the siblings inherit its process id, path, and closed set. `base_stack`
/// is supplied instead when descending into a nested graph, where the new
/// branches push onto the parent's path under a fresh process id.
fn fork_branches(
    starting: Option<&BranchProgress>,
    next_locations: &[Location],
    instance: &SubroutineInstanceId,
    supports_parallel: bool,
    base_stack: Option<&LocationStack>,
) -> Vec<BranchProgress> {
    let process_id = starting
        .map(|b| b.process_id.clone())
        .unwrap_or_else(ProcessId::new);

    next_locations
        .iter()
        .map(|location| {
            let (location_stack, closed_locations) = if let Some(base) = base_stack {
                let mut stack = base.clone();
                stack.push(location.clone());
                (stack, Vec::new())
            } else if let Some(starting) = starting {
                let mut stack = starting.location_stack.clone();
                stack.replace_current(location.clone());
                (stack, starting.closed_locations.clone())
            } else {
                (LocationStack::new(location.clone()), Vec::new())
            };
            BranchProgress {
                branch_id: BranchId::new(),
                process_id: process_id.clone(),
                subroutine_instance_id: instance.clone(),
                child_subroutine_instance_id: None,
                location_stack,
                status: BranchStatus::Active,
                closed_locations,
                supports_parallel_execution: supports_parallel,
                failure: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceNavigator;
    use crate::testing::{InMemoryLoader, RecordingNotifier, ScriptedExecutor};
    use wayfare_core::graph::{GraphKind, GraphLink, GraphNode};
    use wayfare_core::strategy::{AutoDecisionStrategy, DeferAllStrategy};
    use wayfare_store::memory::InMemoryRunStore;

    fn machine_with(loader: InMemoryLoader) -> RunStateMachine {
        RunStateMachine::new(
            Arc::new(loader),
            Arc::new(
                NavigatorFactory::new()
                    .with_navigator(GraphKind::new("sequence"), Arc::new(SequenceNavigator)),
            ),
            Arc::new(ScriptedExecutor::new()),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(AutoDecisionStrategy),
        )
    }

    fn one_node_graph() -> GraphObject {
        let mut nodes = HashMap::new();
        nodes.insert("n1".to_string(), GraphNode::new("n1", "Only"));
        GraphObject {
            object_type: GraphObjectType::RoutineVersion,
            object_id: "R1".to_string(),
            name: "G".to_string(),
            kind: GraphKind::new("sequence"),
            complexity: 1,
            nodes,
            links: vec![],
            start_node_ids: vec!["n1".to_string()],
            root_input_map: HashMap::new(),
            root_output_map: HashMap::new(),
            config: None,
        }
    }

    #[tokio::test]
    async fn test_init_rejects_empty_start_locations() {
        let mut machine = machine_with(InMemoryLoader::new());
        let result = machine
            .init_new_run(vec![], RunConfig::default(), UserContext::new("u1"))
            .await;
        assert!(matches!(result, Err(WayfareError::NoStartLocations)));
    }

    #[tokio::test]
    async fn test_init_rejects_mixed_root_objects() {
        let mut machine = machine_with(InMemoryLoader::new());
        let result = machine
            .init_new_run(
                vec![
                    Location::new(GraphObjectType::RoutineVersion, "R1", "n1"),
                    Location::new(GraphObjectType::RoutineVersion, "R2", "n1"),
                ],
                RunConfig::default(),
                UserContext::new("u1"),
            )
            .await;
        assert!(matches!(
            result,
            Err(WayfareError::MismatchedStartLocations(_, _))
        ));
    }

    #[tokio::test]
    async fn test_init_unknown_object() {
        let mut machine = machine_with(InMemoryLoader::new());
        let result = machine
            .init_new_run(
                vec![Location::new(GraphObjectType::RoutineVersion, "R1", "n1")],
                RunConfig::default(),
                UserContext::new("u1"),
            )
            .await;
        assert!(matches!(result, Err(WayfareError::ObjectNotFound { .. })));
    }

    #[tokio::test]
    async fn test_init_forks_one_branch_per_start_location() {
        let mut graph = one_node_graph();
        graph
            .nodes
            .insert("n2".to_string(), GraphNode::new("n2", "Other"));
        let mut machine = machine_with(InMemoryLoader::new().with_object(graph));

        machine
            .init_new_run(
                vec![
                    Location::new(GraphObjectType::RoutineVersion, "R1", "n1"),
                    Location::new(GraphObjectType::RoutineVersion, "R1", "n2"),
                ],
                RunConfig::default(),
                UserContext::new("u1"),
            )
            .await
            .unwrap();

        let run = machine.progress().unwrap();
        assert_eq!(run.branches.len(), 2);
        assert_eq!(run.status, RunStatus::InProgress);
        let [a, b] = &run.branches[..] else {
            panic!("expected two branches")
        };
        assert_ne!(a.branch_id, b.branch_id);
        assert_eq!(a.process_id, b.process_id);
        assert_eq!(a.subroutine_instance_id, b.subroutine_instance_id);
        assert!(run.subcontexts.contains_key(&a.subroutine_instance_id));
    }

    #[tokio::test]
    async fn test_run_requires_initialization() {
        let mut machine = machine_with(InMemoryLoader::new());
        assert!(matches!(
            machine.run().await,
            Err(WayfareError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_resume_missing_run() {
        let mut machine = machine_with(InMemoryLoader::new());
        let result = machine
            .init_existing_run(&RunId::new(), UserContext::new("u1"))
            .await;
        assert!(matches!(result, Err(WayfareError::RunNotFound(_))));
    }

    #[test]
    fn test_stop_run_rejects_terminal_statuses() {
        let control = RunControl::default();
        assert!(control.stop_run(RunStatus::Paused).is_ok());
        assert!(control.stop_run(RunStatus::Cancelled).is_ok());
        assert!(control.stop_run(RunStatus::Completed).is_err());
        assert!(control.stop_run(RunStatus::Failed).is_err());
        assert!(control.stop_run(RunStatus::InProgress).is_err());
    }

    #[test]
    fn test_fork_inherits_process_and_closed_set() {
        let instance = SubroutineInstanceId::new();
        let root = Location::new(GraphObjectType::RoutineVersion, "R1", "a");
        let starting = fork_branches(None, std::slice::from_ref(&root), &instance, true, None)
            .pop()
            .unwrap();

        let mut starting = starting;
        starting.closed_locations.push(root.clone());

        let siblings = fork_branches(
            Some(&starting),
            &[
                Location::new(GraphObjectType::RoutineVersion, "R1", "b"),
                Location::new(GraphObjectType::RoutineVersion, "R1", "c"),
            ],
            &instance,
            true,
            None,
        );
        assert_eq!(siblings.len(), 2);
        for sibling in &siblings {
            assert_eq!(sibling.process_id, starting.process_id);
            assert_eq!(sibling.closed_locations, starting.closed_locations);
            assert_eq!(sibling.location_stack.depth(), 1);
        }
        assert_eq!(siblings[0].current_location().unwrap().location_id, "b");
    }

    #[test]
    fn test_fork_into_nested_graph_pushes_path() {
        let instance = SubroutineInstanceId::new();
        let base = LocationStack::new(Location::new(GraphObjectType::RoutineVersion, "R1", "n1"));
        let children = fork_branches(
            None,
            &[Location::new(GraphObjectType::RoutineVersion, "R2", "start")],
            &instance,
            true,
            Some(&base),
        );
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].location_stack.depth(), 2);
        assert_eq!(children[0].current_location().unwrap().object_id, "R2");
        assert!(children[0].closed_locations.is_empty());
    }

    #[tokio::test]
    async fn test_close_current_closes_for_process_siblings() {
        let mut graph = one_node_graph();
        graph
            .nodes
            .insert("n2".to_string(), GraphNode::new("n2", "Other"));
        let mut machine = machine_with(InMemoryLoader::new().with_object(graph));
        machine
            .init_new_run(
                vec![
                    Location::new(GraphObjectType::RoutineVersion, "R1", "n1"),
                    Location::new(GraphObjectType::RoutineVersion, "R1", "n2"),
                ],
                RunConfig::default(),
                UserContext::new("u1"),
            )
            .await
            .unwrap();

        let mut run = machine.run.clone().unwrap();
        let first_id = run.branches[0].branch_id.clone();
        let executed = run.branches[0].current_location().cloned().unwrap();
        close_current(&mut run, &first_id);

        // Both siblings now treat the executed location as done.
        for branch in &run.branches {
            assert!(branch.closed_locations.contains(&executed));
        }
        assert!(!is_step_due(&run.branches[0]));
        assert!(is_step_due(&run.branches[1]));
    }

    #[tokio::test]
    async fn test_spawn_clears_resolved_start_decision() {
        let mut machine = machine_with(InMemoryLoader::new().with_object(one_node_graph()));
        machine
            .init_new_run(
                vec![Location::new(GraphObjectType::RoutineVersion, "R1", "n1")],
                RunConfig::default(),
                UserContext::new("u1"),
            )
            .await
            .unwrap();

        let mut run = machine.run.clone().unwrap();
        let branch_id = run.branches[0].branch_id.clone();
        let key = machine.strategy.decision_key(&run.branches[0], "start");
        run.decisions.insert(
            key.clone(),
            DeferredDecision {
                key: key.clone(),
                branch_id: Some(branch_id.clone()),
                options: vec![Location::new(GraphObjectType::RoutineVersion, "R2", "w")],
                payload: None,
            },
        );

        let instance = SubroutineInstanceId::new();
        let outcome = StepOutcome {
            branch_id: branch_id.clone(),
            action: StepAction::Spawn {
                node_id: "n1".to_string(),
                instance: instance.clone(),
                context: SubroutineContext::new(),
                start_locations: vec![Location::new(GraphObjectType::RoutineVersion, "R2", "w")],
                supports_parallel: true,
            },
        };
        let mut outbox = Vec::new();
        machine.apply_step_outcome(&mut run, &HashMap::new(), outcome, &mut outbox);

        // An answered entry decision does not linger as outstanding.
        assert!(!run.decisions.contains_key(&key));
        let parent = run.branch(&branch_id).unwrap();
        assert_eq!(parent.status, BranchStatus::Waiting);
        assert_eq!(parent.child_subroutine_instance_id, Some(instance));
    }

    #[tokio::test]
    async fn test_unanswered_decision_fails_at_loop_cap() {
        let mut nodes = HashMap::new();
        for id in ["a", "b", "c"] {
            nodes.insert(id.to_string(), GraphNode::new(id, id.to_uppercase()));
        }
        let graph = GraphObject {
            object_type: GraphObjectType::RoutineVersion,
            object_id: "R1".to_string(),
            name: "G".to_string(),
            kind: GraphKind::new("sequence"),
            complexity: 3,
            nodes,
            links: vec![GraphLink::new("a", "b"), GraphLink::new("a", "c")],
            start_node_ids: vec!["a".to_string()],
            root_input_map: HashMap::new(),
            root_output_map: HashMap::new(),
            config: None,
        };
        let mut machine = RunStateMachine::new(
            Arc::new(InMemoryLoader::new().with_object(graph)),
            Arc::new(
                NavigatorFactory::new()
                    .with_navigator(GraphKind::new("sequence"), Arc::new(SequenceNavigator)),
            ),
            Arc::new(ScriptedExecutor::new()),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(DeferAllStrategy),
        );
        machine.max_loops = 5;

        // A flat delay never reaches the all-waiting pause threshold, so a
        // deferred choice nobody answers keeps the loop spinning.
        let mut config = RunConfig::default();
        config.loop_config.loop_delay_ms = 1;
        config.loop_config.current_loop_delay_ms = 1;
        config.loop_config.loop_delay_multiplier = 1.0;
        config.loop_config.max_loop_delay_ms = 10_000;

        machine
            .init_new_run(
                vec![Location::new(GraphObjectType::RoutineVersion, "R1", "a")],
                config,
                UserContext::new("u1"),
            )
            .await
            .unwrap();
        let run = machine.run().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.status_reason, Some(RunStatusChangeReason::MaxLoops));
    }

    #[test]
    fn test_step_and_advance_due_are_disjoint() {
        let instance = SubroutineInstanceId::new();
        let location = Location::new(GraphObjectType::RoutineVersion, "R1", "n1");
        let mut branch = fork_branches(
            None,
            std::slice::from_ref(&location),
            &instance,
            true,
            None,
        )
        .pop()
        .unwrap();

        assert!(is_step_due(&branch));
        assert!(!is_advance_due(&branch));

        branch.closed_locations.push(location);
        assert!(!is_step_due(&branch));
        assert!(is_advance_due(&branch));

        branch.child_subroutine_instance_id = Some(SubroutineInstanceId::new());
        branch.status = BranchStatus::Waiting;
        assert!(!is_step_due(&branch));
        assert!(!is_advance_due(&branch));
    }
}
