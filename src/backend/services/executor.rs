// src/backend/services/executor.rs
use crate::error::{AfterselfError, Result};
use crate::models::action::{Action, ActionPlan};
use crate::models::audit_log::{AuditEvent, AuditKind};
use crate::models::common::Timestamp;
use crate::models::config::ExecutorConfig;
use crate::models::state::{ExecutorProgress, GateState};
use crate::services::collaborators::{ActionOutcome, ActionRunners};
use crate::storage::{RecordKey, Vault};
use crate::utils::time::{millis, until, Clock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every action completed or exhausted its attempts.
    Settled(ExecutorProgress),
    /// The stop signal fired (the switch was disabled).
    Stopped,
}

/// Orders actions by fire time (`triggered_at + delay`). The sort is stable, so
/// actions that fire together keep plan order.
pub fn schedule(plan: &ActionPlan, triggered_at: Timestamp) -> Vec<(Timestamp, &Action)> {
    let mut scheduled: Vec<(Timestamp, &Action)> = plan
        .actions
        .iter()
        .map(|action| (triggered_at.saturating_add(millis(action.delay)), action))
        .collect();
    scheduled.sort_by_key(|(fire_at, _)| *fire_at);
    scheduled
}

/// Runs a triggered plan once per episode, checkpointing progress in the vault.
pub struct ActionExecutor {
    vault: Arc<Vault>,
    runners: ActionRunners,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    progress: Mutex<Option<ExecutorProgress>>,
    confirmed: Notify,
}

impl ActionExecutor {
    pub fn new(vault: Arc<Vault>, runners: ActionRunners, clock: Arc<dyn Clock>, config: ExecutorConfig) -> Self {
        Self {
            vault,
            runners,
            clock,
            config,
            progress: Mutex::new(None),
            confirmed: Notify::new(),
        }
    }

    /// Persisted progress for `episode`, if any.
    pub fn progress_for(&self, episode: Timestamp) -> Result<Option<ExecutorProgress>> {
        Ok(self
            .vault
            .get::<ExecutorProgress>(RecordKey::ExecutorProgress)?
            .filter(|p| p.episode == episode))
    }

    /// Drives `plan` for the episode triggered at `triggered_at` until every action
    /// settles or `stop` flips to true. Resumes from persisted progress.
    pub async fn run(
        &self,
        plan: &ActionPlan,
        triggered_at: Timestamp,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ExecutionOutcome> {
        let progress = self.load_or_start(plan, triggered_at).await?;

        if progress.gate == GateState::AwaitingConfirmation && !self.wait_for_confirmation(&mut stop).await? {
            return Ok(ExecutionOutcome::Stopped);
        }

        let mut last_dispatch: Option<Timestamp> = None;
        for (fire_at, action) in schedule(plan, triggered_at) {
            if self.is_settled(&action.id).await {
                continue;
            }
            if !sleep_until_or_stop(self.clock.as_ref(), fire_at, &mut stop).await {
                return Ok(ExecutionOutcome::Stopped);
            }
            if !self.run_action(action, &mut last_dispatch, &mut stop).await? {
                return Ok(ExecutionOutcome::Stopped);
            }
        }

        let progress = self.snapshot().await?;
        info!(
            episode = triggered_at,
            completed = progress.completed_actions,
            failed = progress.failed_actions.len(),
            "action plan settled"
        );
        Ok(ExecutionOutcome::Settled(progress))
    }

    /// Releases a confirmation-gated run. Persisted before the waiting run is woken.
    pub async fn confirm(&self, episode: Timestamp) -> Result<()> {
        let mut guard = self.progress.lock().await;
        let mut progress = match guard.as_ref() {
            Some(progress) if progress.episode == episode => progress.clone(),
            _ => self
                .progress_for(episode)?
                .ok_or(AfterselfError::NotAwaitingConfirmation)?,
        };
        if progress.gate != GateState::AwaitingConfirmation {
            return Err(AfterselfError::NotAwaitingConfirmation);
        }
        progress.gate = GateState::Confirmed;
        self.vault.put(RecordKey::ExecutorProgress, &progress)?;
        *guard = Some(progress);
        drop(guard);

        info!(episode, "execution confirmed");
        self.audit(AuditEvent::success(
            AuditKind::Executor,
            "executor.confirmed",
            json!({ "episode": episode }),
        ))?;
        self.confirmed.notify_one();
        Ok(())
    }

    async fn load_or_start(&self, plan: &ActionPlan, triggered_at: Timestamp) -> Result<ExecutorProgress> {
        let mut guard = self.progress.lock().await;
        let progress = match self.progress_for(triggered_at)? {
            Some(progress) => {
                if let Some(in_flight) = &progress.current_action {
                    info!(action_id = %in_flight, "retrying in-flight action from attempt 1");
                }
                progress
            }
            None => {
                let progress =
                    ExecutorProgress::new(triggered_at, plan.actions.len() as u32, self.config.confirmation_gate);
                self.vault.put(RecordKey::ExecutorProgress, &progress)?;
                info!(
                    episode = triggered_at,
                    plan_id = %plan.id,
                    total = progress.total_actions,
                    gated = self.config.confirmation_gate,
                    "executor started"
                );
                self.audit(AuditEvent::success(
                    AuditKind::Executor,
                    "executor.started",
                    json!({
                        "episode": triggered_at,
                        "planId": plan.id,
                        "totalActions": progress.total_actions,
                        "confirmationGate": self.config.confirmation_gate,
                    }),
                ))?;
                progress
            }
        };
        *guard = Some(progress.clone());
        Ok(progress)
    }

    /// `false` if stopped before confirmation arrived.
    async fn wait_for_confirmation(&self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        info!("execution paused until confirmed");
        loop {
            let gate = self.snapshot().await?.gate;
            if gate != GateState::AwaitingConfirmation {
                return Ok(true);
            }
            tokio::select! {
                _ = self.confirmed.notified() => {}
                Ok(_) = stop.wait_for(|stopped| *stopped) => return Ok(false),
            }
        }
    }

    /// Attempts one action up to its retry budget. `false` if stopped midway.
    async fn run_action(
        &self,
        action: &Action,
        last_dispatch: &mut Option<Timestamp>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let max_attempts = self.config.max_retries.max(1);
        let spacing = millis(self.config.action_delay());
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if let Some(previous) = *last_dispatch {
                let earliest = previous.saturating_add(spacing);
                if !sleep_until_or_stop(self.clock.as_ref(), earliest, stop).await {
                    return Ok(false);
                }
            }

            self.update(|p| {
                p.begin_attempt(&action.id);
                Ok(())
            })
            .await?;
            *last_dispatch = Some(self.clock.now());
            debug!(action_id = %action.id, kind = action.kind.type_name(), attempt, "dispatching action");

            let outcome = tokio::select! {
                outcome = self.runners.execute(action) => outcome,
                Ok(_) = stop.wait_for(|stopped| *stopped) => return Ok(false),
            };

            match outcome {
                ActionOutcome::Succeeded => {
                    self.update(|p| p.record_completed(&action.id)).await?;
                    info!(action_id = %action.id, attempt, "action completed");
                    if self.config.audit_log {
                        self.audit(AuditEvent::success(
                            AuditKind::Executor,
                            "action.completed",
                            json!({ "actionId": action.id, "type": action.kind.type_name(), "attempt": attempt }),
                        ))?;
                    }
                    return Ok(true);
                }
                ActionOutcome::Failed(reason) => {
                    let err = AfterselfError::TransientDelivery(reason.clone());
                    warn!(action_id = %action.id, attempt, max_attempts, error = %err, "action attempt failed");
                    self.audit(AuditEvent::failure(
                        AuditKind::Executor,
                        "action.attempt_failed",
                        err.to_string(),
                        json!({ "actionId": action.id, "type": action.kind.type_name(), "attempt": attempt }),
                    ))?;
                    last_reason = reason;
                    if attempt < max_attempts {
                        let backoff = self.config.action_delay().saturating_mul(attempt);
                        if !sleep_for_or_stop(backoff, stop).await {
                            return Ok(false);
                        }
                    }
                }
            }
        }

        let err = AfterselfError::PermanentAction {
            action_id: action.id.clone(),
            attempts: max_attempts,
            reason: last_reason,
        };
        self.update(|p| p.record_failed(&action.id)).await?;
        warn!(error = %err, "action exhausted its attempts");
        self.audit(AuditEvent::failure(
            AuditKind::Executor,
            "action.failed",
            err.to_string(),
            json!({ "actionId": action.id, "type": action.kind.type_name(), "attempts": max_attempts }),
        ))?;
        Ok(true)
    }

    /// Mutates the in-memory progress and persists it before returning.
    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutorProgress) -> Result<()>,
    {
        let mut guard = self.progress.lock().await;
        let progress = guard
            .as_mut()
            .ok_or_else(|| AfterselfError::InternalError("executor progress not loaded".to_string()))?;
        mutate(progress)?;
        self.vault.put(RecordKey::ExecutorProgress, &*progress)
    }

    async fn snapshot(&self) -> Result<ExecutorProgress> {
        self.progress
            .lock()
            .await
            .clone()
            .ok_or_else(|| AfterselfError::InternalError("executor progress not loaded".to_string()))
    }

    async fn is_settled(&self, id: &str) -> bool {
        self.progress
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| p.has_settled(id))
    }

    fn audit(&self, event: AuditEvent) -> Result<()> {
        self.vault.append_audit(event, self.clock.now()).map(|_| ())
    }
}

/// `false` if stopped first.
async fn sleep_until_or_stop(clock: &dyn Clock, at: Timestamp, stop: &mut watch::Receiver<bool>) -> bool {
    sleep_for_or_stop(until(clock, at), stop).await
}

async fn sleep_for_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        Ok(_) = stop.wait_for(|stopped| *stopped) => false,
    }
}
