//! Step scheduling and frontier advancement.
//!
//! Advancement alternates between two phases. Under the instance lock,
//! `settle` drains every transition that resolves synchronously:
//! condition branches, review and decision suspension, parallel forks,
//! and terminal targets. With the lock released, collected automation
//! steps run concurrently; their outcomes are then applied under the
//! lock again, and the loop repeats until nothing is dispatchable.
//!
//! A pause requested while actions are in flight takes effect at the
//! next phase boundary; in-flight actions are never interrupted.

use crate::engine::actions::ActionRegistry;
use crate::engine::evaluator;
use crate::engine::instance::{
    BranchRef, ExecutionInstance, ExecutionStatus, JoinBarrier, WaitState,
};
use crate::engine::notify::{EngineNotification, NotificationHook};
use crate::model::context::VariableContext;
use crate::model::step::{
    ActionSpec, JoinPolicy, OnExhaustion, Outcome, StepId, StepKind, StepTarget,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// An automation step pulled off the frontier for execution outside
/// the lock.
pub(crate) struct AutomationDispatch {
    entry_id: u64,
    step: StepId,
    actions: Vec<ActionSpec>,
    ctx: VariableContext,
    attempt: u32,
    delay: Option<Duration>,
}

/// Result of one automation dispatch, applied back under the lock.
pub(crate) struct AutomationOutcome {
    entry_id: u64,
    step: StepId,
    /// `Err` carries the failing action's name and error message.
    result: Result<(), (String, String)>,
}

/// Drive the instance until it is no longer `Running` or nothing on
/// the frontier can be dispatched.
pub(crate) async fn advance(
    instance: &Arc<Mutex<ExecutionInstance>>,
    registry: &Arc<dyn ActionRegistry>,
    hook: Option<&Arc<dyn NotificationHook>>,
) {
    let hook = hook.map(|h| h.as_ref() as &dyn NotificationHook);
    loop {
        let dispatches = {
            let mut inst = instance.lock().await;
            if inst.status != ExecutionStatus::Running {
                break;
            }
            settle(&mut inst, hook);
            if inst.status != ExecutionStatus::Running {
                break;
            }
            collect_automation(&mut inst)
        };
        if dispatches.is_empty() {
            break;
        }

        let mut handles = Vec::with_capacity(dispatches.len());
        for dispatch in dispatches {
            let registry = Arc::clone(registry);
            handles.push(tokio::spawn(run_automation(dispatch, registry)));
        }
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(outcome) = handle.await {
                outcomes.push(outcome);
            }
        }

        let mut inst = instance.lock().await;
        for outcome in outcomes {
            apply_outcome(&mut inst, outcome, hook);
        }
    }
}

/// Process all synchronously resolvable frontier entries. Automation
/// entries are left in `Ready` for `collect_automation`.
pub(crate) fn settle(inst: &mut ExecutionInstance, hook: Option<&dyn NotificationHook>) {
    // A cycle made only of synchronous steps never reaches a
    // suspension point, so one pass would spin forever while holding
    // the instance lock. Cycles are legal, but any graph that resolves
    // more synchronous transitions than this in a single pass is
    // looping without waiting on anything.
    let hop_limit = inst.graph.steps.len().saturating_mul(8).max(64);
    let mut hops = 0usize;
    loop {
        if inst.status != ExecutionStatus::Running {
            return;
        }
        check_completion(inst, hook);
        if inst.status != ExecutionStatus::Running {
            return;
        }

        // Breakpoints fire before dispatch, regardless of step kind,
        // and are one-shot so resume proceeds past them.
        let tripped = inst
            .frontier
            .iter()
            .find(|e| e.wait == WaitState::Ready && inst.breakpoints.contains(&e.step))
            .map(|e| e.step.clone());
        if let Some(step) = tripped {
            inst.breakpoints.remove(&step);
            inst.status = ExecutionStatus::Paused;
            inst.log_warning(Some(step), "breakpoint hit; execution paused", None);
            return;
        }

        let graph = inst.graph.clone();
        let pos = inst.frontier.iter().position(|e| {
            e.wait == WaitState::Ready
                && graph
                    .step(&e.step)
                    .map(|s| !matches!(s.kind, StepKind::Automation { .. }))
                    .unwrap_or(true)
        });
        let Some(pos) = pos else {
            return;
        };
        let entry = inst.frontier.remove(pos);

        hops += 1;
        if hops > hop_limit {
            inst.log_error(
                Some(entry.step.clone()),
                "synchronous step limit exceeded; condition cycle suspected",
                Some(json!({ "limit": hop_limit })),
            );
            fail_instance(inst, hook);
            return;
        }

        let Some(step) = graph.step(&entry.step).cloned() else {
            inst.log_error(
                Some(entry.step.clone()),
                "frontier references unknown step",
                None,
            );
            fail_instance(inst, hook);
            return;
        };

        match step.kind {
            StepKind::Condition {
                expr,
                on_true,
                on_false,
            } => {
                let evaluation = evaluator::evaluate(&expr, &inst.variables);
                let target = if evaluation.value { on_true } else { on_false };
                let details = json!({
                    "expr": expr,
                    "result": evaluation.value,
                    "warnings": evaluation.warnings,
                });
                if evaluation.warnings.is_empty() {
                    inst.log_info(
                        Some(step.id.clone()),
                        "branch condition evaluated",
                        Some(details),
                    );
                } else {
                    inst.log_warning(
                        Some(step.id.clone()),
                        "branch condition evaluated with warnings",
                        Some(details),
                    );
                }
                apply_target(inst, entry.branch, target, hook);
            }

            StepKind::Review {
                assignees,
                min_approvers,
                require_all,
                deadline_hours,
                ..
            } => {
                // Fresh approval round on every activation; a revision
                // loop must not see stale responses.
                inst.approvals.insert(step.id.clone(), Vec::new());
                inst.log_info(
                    Some(step.id.clone()),
                    "review requested",
                    Some(json!({
                        "assignees": assignees,
                        "min_approvers": min_approvers,
                        "require_all": require_all,
                        "deadline_hours": deadline_hours,
                    })),
                );
                let mut entry = entry;
                entry.wait = WaitState::Review;
                inst.frontier.push(entry);
                if let Some(hook) = hook {
                    hook.notify(EngineNotification::ReviewRequested {
                        instance_id: inst.instance_id.clone(),
                        step_id: step.id.clone(),
                        assignees,
                        deadline_hours,
                    });
                }
            }

            StepKind::Decision { options } => {
                let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
                inst.log_info(
                    Some(step.id.clone()),
                    "decision requested",
                    Some(json!({ "options": labels })),
                );
                let mut entry = entry;
                entry.wait = WaitState::Decision;
                inst.frontier.push(entry);
                if let Some(hook) = hook {
                    hook.notify(EngineNotification::DecisionRequested {
                        instance_id: inst.instance_id.clone(),
                        step_id: step.id.clone(),
                        options: labels,
                    });
                }
            }

            StepKind::Parallel {
                branches,
                join,
                next,
            } => {
                inst.joins.insert(
                    step.id.clone(),
                    JoinBarrier {
                        policy: join,
                        next,
                        outer: entry.branch.clone(),
                        total: branches.len(),
                        completed: 0,
                    },
                );
                inst.log_info(
                    Some(step.id.clone()),
                    "parallel fork",
                    Some(json!({ "branches": branches.len(), "join": join })),
                );
                for (index, branch) in branches.iter().enumerate() {
                    if let Some(head) = branch.first() {
                        inst.push_entry(
                            head.clone(),
                            Some(BranchRef {
                                parallel: step.id.clone(),
                                index,
                            }),
                        );
                    }
                }
            }

            StepKind::Automation { .. } => {
                // Not reachable: the position filter excludes
                // automation steps. Put the entry back untouched.
                inst.frontier.insert(pos, entry);
                return;
            }
        }
    }
}

/// Move Ready and Retry automation entries to Dispatching and return
/// their dispatch descriptions.
pub(crate) fn collect_automation(inst: &mut ExecutionInstance) -> Vec<AutomationDispatch> {
    let graph = inst.graph.clone();
    let ctx = inst.variables.clone();
    let mut dispatches = Vec::new();

    for entry in inst.frontier.iter_mut() {
        let delay = match &entry.wait {
            WaitState::Ready => None,
            WaitState::Retry { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => continue,
        };
        let Some(step) = graph.step(&entry.step) else {
            continue;
        };
        let StepKind::Automation { actions, .. } = &step.kind else {
            continue;
        };

        let attempt = if delay.is_none() {
            // Fresh activation: a revisit through a cycle starts with a
            // clean retry budget.
            inst.retries_used.remove(&entry.step);
            1
        } else {
            inst.retries_used.get(&entry.step).copied().unwrap_or(0) + 1
        };

        entry.wait = WaitState::Dispatching;
        dispatches.push(AutomationDispatch {
            entry_id: entry.entry_id,
            step: entry.step.clone(),
            actions: actions.clone(),
            ctx: ctx.clone(),
            attempt,
            delay,
        });
    }

    for dispatch in &dispatches {
        if dispatch.attempt == 1 {
            let names: Vec<&str> = dispatch.actions.iter().map(|a| a.name.as_str()).collect();
            inst.log_info(
                Some(dispatch.step.clone()),
                "automation step started",
                Some(json!({ "actions": names })),
            );
        }
    }

    dispatches
}

/// Run one automation dispatch to completion. A retry waits out its
/// delay first. Actions run in order; the first failure aborts the
/// rest of the list.
async fn run_automation(
    dispatch: AutomationDispatch,
    registry: Arc<dyn ActionRegistry>,
) -> AutomationOutcome {
    if let Some(delay) = dispatch.delay {
        tokio::time::sleep(delay).await;
    }
    for action in &dispatch.actions {
        if let Err(e) = registry
            .invoke(&action.name, &action.params, &dispatch.ctx)
            .await
        {
            return AutomationOutcome {
                entry_id: dispatch.entry_id,
                step: dispatch.step,
                result: Err((action.name.clone(), e.to_string())),
            };
        }
    }
    AutomationOutcome {
        entry_id: dispatch.entry_id,
        step: dispatch.step,
        result: Ok(()),
    }
}

/// Fold an automation outcome back into the instance.
pub(crate) fn apply_outcome(
    inst: &mut ExecutionInstance,
    outcome: AutomationOutcome,
    hook: Option<&dyn NotificationHook>,
) {
    let Some(pos) = inst.entry_position(outcome.entry_id) else {
        // The entry was cancelled while its actions ran; the actions
        // were allowed to finish but their result is dropped.
        log::debug!(
            "instance {}: dropping outcome of cancelled step {}",
            inst.instance_id,
            outcome.step
        );
        return;
    };

    match outcome.result {
        Ok(()) => {
            let entry = inst.frontier.remove(pos);
            inst.retries_used.remove(&entry.step);
            inst.log_success(Some(entry.step.clone()), "automation step completed", None);
            let graph = inst.graph.clone();
            let next = graph.step(&entry.step).and_then(|s| match &s.kind {
                StepKind::Automation { next, .. } => Some(next.clone()),
                _ => None,
            });
            if let Some(next) = next {
                apply_target(inst, entry.branch, next, hook);
            }
        }
        Err((action, message)) => {
            let step_id = outcome.step;
            let used = inst.retries_used.get(&step_id).copied().unwrap_or(0);
            let policy = inst.graph.step(&step_id).and_then(|s| s.error_policy.clone());

            match policy {
                Some(policy) if used < policy.max_retries => {
                    inst.retries_used.insert(step_id.clone(), used + 1);
                    inst.frontier[pos].wait = WaitState::Retry {
                        delay_ms: policy.retry_delay_ms,
                    };
                    inst.log_warning(
                        Some(step_id),
                        "automation action failed; retrying",
                        Some(json!({
                            "action": action,
                            "error": message,
                            "attempt": used + 1,
                            "max_retries": policy.max_retries,
                        })),
                    );
                }
                Some(policy) => {
                    let entry = inst.frontier.remove(pos);
                    match policy.on_exhaustion {
                        OnExhaustion::Skip => {
                            inst.log_warning(
                                Some(step_id.clone()),
                                "retries exhausted; skipping step",
                                Some(json!({ "action": action, "error": message })),
                            );
                            let graph = inst.graph.clone();
                            let next = graph.step(&step_id).and_then(|s| match &s.kind {
                                StepKind::Automation { next, .. } => Some(next.clone()),
                                _ => None,
                            });
                            if let Some(next) = next {
                                apply_target(inst, entry.branch, next, hook);
                            }
                        }
                        OnExhaustion::Fallback(fallback) => {
                            inst.log_warning(
                                Some(step_id),
                                "retries exhausted; rerouting to fallback",
                                Some(json!({
                                    "action": action,
                                    "error": message,
                                    "fallback": fallback,
                                })),
                            );
                            apply_target(inst, entry.branch, StepTarget::Step(fallback), hook);
                        }
                        OnExhaustion::Fail => {
                            inst.log_error(
                                Some(step_id),
                                "retries exhausted; execution failed",
                                Some(json!({ "action": action, "error": message })),
                            );
                            fail_instance(inst, hook);
                        }
                    }
                }
                None => {
                    inst.frontier.remove(pos);
                    inst.log_error(
                        Some(step_id),
                        "automation step failed",
                        Some(json!({ "action": action, "error": message })),
                    );
                    fail_instance(inst, hook);
                }
            }
        }
    }
}

/// Route execution from a resolved step to its target.
pub(crate) fn apply_target(
    inst: &mut ExecutionInstance,
    branch: Option<BranchRef>,
    target: StepTarget,
    hook: Option<&dyn NotificationHook>,
) {
    match target {
        StepTarget::Step(id) => {
            inst.push_entry(id, branch);
        }
        StepTarget::End(Outcome::Complete) => match branch {
            Some(branch) => branch_completed(inst, branch, hook),
            None => check_completion(inst, hook),
        },
        StepTarget::End(Outcome::Reject) => reject_from(inst, branch, hook),
    }
}

/// A branch ran to its terminal target; update the fork's barrier and
/// resolve the join when its policy is satisfied.
fn branch_completed(inst: &mut ExecutionInstance, branch: BranchRef, hook: Option<&dyn NotificationHook>) {
    let Some(barrier) = inst.joins.get_mut(&branch.parallel) else {
        // The join already resolved (Any policy); a late branch end is
        // a no-op.
        return;
    };
    barrier.completed += 1;
    let completed = barrier.completed;
    let total = barrier.total;
    let resolved = match barrier.policy {
        JoinPolicy::All => completed >= total,
        JoinPolicy::Any | JoinPolicy::First => true,
    };

    inst.log_info(
        Some(branch.parallel.clone()),
        "parallel branch completed",
        Some(json!({ "branch": branch.index, "completed": completed, "total": total })),
    );

    if resolved {
        if let Some(barrier) = inst.joins.remove(&branch.parallel) {
            cancel_branches(inst, &branch.parallel);
            inst.log_success(Some(branch.parallel.clone()), "parallel step resolved", None);
            apply_target(inst, barrier.outer, barrier.next, hook);
        }
    }
}

/// Remove every frontier entry still inside the given fork, including
/// entries of forks nested within it.
fn cancel_branches(inst: &mut ExecutionInstance, parallel: &StepId) {
    let mut cancelled = Vec::new();
    let mut i = 0;
    while i < inst.frontier.len() {
        let in_fork = inst.frontier[i]
            .branch
            .as_ref()
            .map(|b| &b.parallel == parallel)
            .unwrap_or(false);
        if in_fork {
            cancelled.push(inst.frontier.remove(i));
        } else {
            i += 1;
        }
    }
    for entry in &cancelled {
        inst.log_warning(
            Some(entry.step.clone()),
            "branch cancelled",
            Some(json!({ "branch": entry.branch.as_ref().map(|b| b.index) })),
        );
    }

    let nested: Vec<StepId> = inst
        .joins
        .iter()
        .filter(|(_, barrier)| {
            barrier
                .outer
                .as_ref()
                .map(|o| &o.parallel == parallel)
                .unwrap_or(false)
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in nested {
        inst.joins.remove(&id);
        cancel_branches(inst, &id);
    }
}

/// Propagate a rejection outward. A rejection inside a fork rejects
/// the whole parallel step and continues outward from there; at the
/// top level it terminates the instance as Rejected.
fn reject_from(
    inst: &mut ExecutionInstance,
    branch: Option<BranchRef>,
    hook: Option<&dyn NotificationHook>,
) {
    match branch {
        Some(branch) => {
            inst.log_warning(
                Some(branch.parallel.clone()),
                "parallel branch rejected",
                Some(json!({ "branch": branch.index })),
            );
            let barrier = inst.joins.remove(&branch.parallel);
            cancel_branches(inst, &branch.parallel);
            let outer = barrier.and_then(|b| b.outer);
            reject_from(inst, outer, hook);
        }
        None => {
            let remaining: Vec<_> = inst.frontier.drain(..).collect();
            for entry in &remaining {
                inst.log_warning(Some(entry.step.clone()), "step cancelled", None);
            }
            inst.joins.clear();
            inst.status = ExecutionStatus::Rejected;
            inst.log_warning(None, "execution rejected", None);
            notify_terminal(inst, hook);
        }
    }
}

/// Terminate the instance as Failed, cancelling whatever is active.
pub(crate) fn fail_instance(inst: &mut ExecutionInstance, hook: Option<&dyn NotificationHook>) {
    let remaining: Vec<_> = inst.frontier.drain(..).collect();
    for entry in &remaining {
        inst.log_warning(Some(entry.step.clone()), "step cancelled", None);
    }
    inst.joins.clear();
    inst.status = ExecutionStatus::Failed;
    inst.log_error(None, "execution failed", None);
    notify_terminal(inst, hook);
}

/// Complete the instance once the frontier is empty.
pub(crate) fn check_completion(inst: &mut ExecutionInstance, hook: Option<&dyn NotificationHook>) {
    if inst.status == ExecutionStatus::Running && inst.frontier.is_empty() {
        inst.status = ExecutionStatus::Completed;
        inst.log_success(None, "execution completed", None);
        notify_terminal(inst, hook);
    }
}

fn notify_terminal(inst: &ExecutionInstance, hook: Option<&dyn NotificationHook>) {
    if let Some(hook) = hook {
        hook.notify(EngineNotification::Terminal {
            instance_id: inst.instance_id.clone(),
            status: inst.status,
        });
    }
}
