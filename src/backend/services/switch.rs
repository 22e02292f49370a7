// src/backend/services/switch.rs
// The top-level driver. Owns every SwitchState transition.

use crate::error::{AfterselfError, Result};
use crate::models::action::ActionPlan;
use crate::models::audit_log::{AuditEntry, AuditEvent, AuditKind};
use crate::models::common::{SwitchState, Timestamp};
use crate::models::config::AfterselfConfig;
use crate::models::contact::{ContactResponse, TrustedContact};
use crate::models::state::{
    AfterselfState, EscalationRound, ExecutorProgress, HeartbeatRecord, ResolutionReason, RoundOutcome,
    SwitchRecord,
};
use crate::services::collaborators::{Collaborators, DeliveryOutcome, SwitchEvent};
use crate::services::escalation::EscalationCoordinator;
use crate::services::executor::{ActionExecutor, ExecutionOutcome};
use crate::storage::{RecordKey, Vault};
use crate::utils::guards::{check_contacts, check_contacts_mutable, check_not_halted, check_plan_mutable};
use crate::utils::time::{millis, Clock};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{error, info, warn};

const CHECK_IN_PING: &str = "Afterself check-in: reply or open the app to let us know you're okay.";
const WARNING_MESSAGE: &str = "Afterself: you missed a check-in. If we don't hear from you before the \
                               warning period ends, your trusted contacts will be asked to confirm.";

/// What the driver should do after one evaluation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    /// Evaluate again right away.
    Now,
    /// Nothing is due before this time.
    At(Timestamp),
    /// Only an external operation can change anything.
    Idle,
}

struct Core {
    switch: SwitchRecord,
    heartbeat: HeartbeatRecord,
    /// Stop signal of the executor run in progress, if any.
    exec_stop: Option<watch::Sender<bool>>,
    /// Episode for which a disabled executor was already reported.
    executor_skipped: Option<Timestamp>,
}

pub struct SwitchMachine {
    config: AfterselfConfig,
    vault: Arc<Vault>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    coordinator: EscalationCoordinator,
    executor: ActionExecutor,
    core: Mutex<Core>,
    /// Held for a whole `advance`: one evaluation step at a time.
    driver: Mutex<()>,
    wake: Notify,
    halted: AtomicBool,
}

impl SwitchMachine {
    /// Loads the persisted switch (or initializes it armed) and checks every record
    /// can be read. A just-entered state is replayed by the next `advance`.
    pub fn open(
        config: AfterselfConfig,
        vault: Arc<Vault>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_config()?;
        let now = clock.now();

        let switch = match vault.get::<SwitchRecord>(RecordKey::SwitchState)? {
            Some(record) => {
                info!(state = %record.state, entered_at = record.entered_at, "switch state loaded");
                record
            }
            None => {
                let record = SwitchRecord::armed(now);
                vault.put(RecordKey::SwitchState, &record)?;
                vault.append_audit(
                    AuditEvent::success(AuditKind::Config, "switch.initialized", json!({ "state": record.state })),
                    now,
                )?;
                info!("switch initialized armed");
                record
            }
        };
        let heartbeat = vault.get::<HeartbeatRecord>(RecordKey::Heartbeat)?.unwrap_or_default();
        if vault.get::<Vec<TrustedContact>>(RecordKey::TrustedContacts)?.is_none() {
            vault.put(RecordKey::TrustedContacts, &config.heartbeat.escalation_contacts)?;
        }
        vault.get_plan()?;
        vault.get::<EscalationRound>(RecordKey::EscalationRound)?;
        vault.get::<ExecutorProgress>(RecordKey::ExecutorProgress)?;

        let coordinator = EscalationCoordinator::new(
            Arc::clone(&vault),
            Arc::clone(&collaborators.delivery),
            Arc::clone(&clock),
            config.heartbeat.escalation_timeout,
        );
        let executor = ActionExecutor::new(
            Arc::clone(&vault),
            collaborators.runners.clone(),
            Arc::clone(&clock),
            config.executor.clone(),
        );

        Ok(Self {
            config,
            vault,
            clock,
            collaborators,
            coordinator,
            executor,
            core: Mutex::new(Core {
                switch,
                heartbeat,
                exec_stop: None,
                executor_skipped: None,
            }),
            driver: Mutex::new(()),
            wake: Notify::new(),
            halted: AtomicBool::new(false),
        })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Resolves when an operation changed something the driver should look at.
    pub fn changed(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// One evaluation step of the current state.
    pub async fn advance(&self) -> Result<NextStep> {
        check_not_halted(self.is_halted())?;
        let _driving = self.driver.lock().await;
        let result = self.step().await;
        self.halt_on_integrity(result)
    }

    pub async fn check_in(&self) -> Result<SwitchState> {
        check_not_halted(self.is_halted())?;
        let result = self.check_in_inner().await;
        self.halt_on_integrity(result)
    }

    /// Moves any state to `disabled`, cancelling a running round or executor.
    pub async fn disable(&self) -> Result<SwitchState> {
        check_not_halted(self.is_halted())?;
        let result = self.disable_inner().await;
        self.halt_on_integrity(result)
    }

    /// `disabled → armed` only. The missed check-in counter is left as is.
    pub async fn rearm(&self) -> Result<SwitchState> {
        check_not_halted(self.is_halted())?;
        let result = async {
            let mut core = self.core.lock().await;
            let state = core.switch.state;
            if state != SwitchState::Disabled {
                return Err(AfterselfError::InvalidTransition {
                    from: state,
                    to: SwitchState::Armed,
                });
            }
            self.transition(&mut core, SwitchState::Armed, json!({ "reason": "rearm" }))?;
            Ok(SwitchState::Armed)
        }
        .await;
        self.wake.notify_one();
        self.halt_on_integrity(result)
    }

    /// Releases a confirmation-gated execution.
    pub async fn confirm_execution(&self) -> Result<()> {
        check_not_halted(self.is_halted())?;
        let episode = {
            let core = self.core.lock().await;
            match (core.switch.state, core.switch.triggered_at) {
                (SwitchState::Triggered, Some(episode)) => episode,
                _ => return Err(AfterselfError::NotAwaitingConfirmation),
            }
        };
        let result = self.executor.confirm(episode).await;
        self.halt_on_integrity(result)
    }

    pub async fn submit_contact_response(&self, contact_id: &str, response: ContactResponse) -> Result<()> {
        check_not_halted(self.is_halted())?;
        if self.core.lock().await.switch.state != SwitchState::Escalating {
            return Err(AfterselfError::NoActiveRound);
        }
        let result = self.coordinator.submit_response(contact_id, response).await;
        self.halt_on_integrity(result)
    }

    /// Validates and stores a new plan. Rejected once the switch has triggered.
    pub async fn replace_plan(&self, mut plan: ActionPlan) -> Result<ActionPlan> {
        check_not_halted(self.is_halted())?;
        plan.validate_plan()?;
        let result = async {
            let core = self.core.lock().await;
            check_plan_mutable(core.switch.state)?;
            plan.updated_at = self.clock.now();
            self.vault.put_plan(&plan)?;
            info!(plan_id = %plan.id, actions = plan.actions.len(), "action plan replaced");
            self.audit(AuditEvent::success(
                AuditKind::Config,
                "plan.replaced",
                json!({ "planId": plan.id, "actions": plan.actions.len() }),
            ))?;
            Ok(plan)
        }
        .await;
        self.halt_on_integrity(result)
    }

    /// Validates and stores the trusted contacts. Rejected while a round runs.
    pub async fn replace_contacts(&self, contacts: Vec<TrustedContact>) -> Result<()> {
        check_not_halted(self.is_halted())?;
        check_contacts(&contacts)?;
        let result = async {
            let core = self.core.lock().await;
            check_contacts_mutable(core.switch.state)?;
            self.vault.put(RecordKey::TrustedContacts, &contacts)?;
            info!(contacts = contacts.len(), "trusted contacts replaced");
            self.audit(AuditEvent::success(
                AuditKind::Config,
                "contacts.replaced",
                json!({ "contacts": contacts.iter().map(|c| c.id.as_str()).collect::<Vec<_>>() }),
            ))
        }
        .await;
        self.halt_on_integrity(result)
    }

    pub async fn plan(&self) -> Result<Option<ActionPlan>> {
        let result = self.vault.get_plan();
        self.halt_on_integrity(result)
    }

    pub async fn contacts(&self) -> Result<Vec<TrustedContact>> {
        let result = self.vault.get::<Vec<TrustedContact>>(RecordKey::TrustedContacts);
        self.halt_on_integrity(result).map(Option::unwrap_or_default)
    }

    /// Aggregated read-only view.
    pub async fn state(&self) -> Result<AfterselfState> {
        let core = self.core.lock().await;
        let result = (|| -> Result<AfterselfState> {
            let responses = self
                .vault
                .get::<EscalationRound>(RecordKey::EscalationRound)?
                .map(|round| round.responses)
                .unwrap_or_default();
            let progress = match core.switch.triggered_at {
                Some(episode) => self.executor.progress_for(episode)?,
                None => None,
            };
            Ok(AfterselfState {
                switch_state: core.switch.state,
                entered_at: core.switch.entered_at,
                last_check_in: core.heartbeat.last_check_in,
                last_ping_sent: core.heartbeat.last_ping_sent,
                missed_check_ins: core.heartbeat.missed_check_ins,
                escalation_responses: responses,
                executor_progress: progress,
                ghost_activated_at: core.switch.ghost_activated_at,
                mortality_token_balance: core.switch.mortality_token_balance,
                mortality_transfer_complete: core.switch.mortality_transfer_complete,
            })
        })();
        drop(core);
        self.halt_on_integrity(result)
    }

    pub async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        let result = self.vault.audit_entries();
        self.halt_on_integrity(result)
    }

    async fn step(&self) -> Result<NextStep> {
        let state = self.core.lock().await.switch.state;
        match state {
            SwitchState::Armed => self.step_armed().await,
            SwitchState::Warning => self.step_warning().await,
            SwitchState::Escalating => self.step_escalating().await,
            SwitchState::Triggered => self.step_triggered().await,
            SwitchState::Completed | SwitchState::Disabled => Ok(NextStep::Idle),
        }
    }

    /// Heartbeat tick: due `interval` after the latest of armed entry, check-in and
    /// ping. A due tick after an unanswered ping is a missed check-in.
    async fn step_armed(&self) -> Result<NextStep> {
        let mut core = self.core.lock().await;
        if core.switch.state != SwitchState::Armed {
            return Ok(NextStep::Now);
        }
        let now = self.clock.now();
        let interval = millis(self.config.heartbeat.interval);
        let entered_at = core.switch.entered_at;
        let anchor = entered_at
            .max(core.heartbeat.last_check_in.unwrap_or(0))
            .max(core.heartbeat.last_ping_sent.unwrap_or(0));
        let due = anchor.saturating_add(interval);
        if now < due {
            return Ok(NextStep::At(due));
        }

        let unanswered_ping = core
            .heartbeat
            .last_ping_sent
            .filter(|&ping| ping >= entered_at && !core.heartbeat.checked_in_since(ping));
        if let Some(ping) = unanswered_ping {
            core.heartbeat.record_missed_tick(ping);
            self.vault.put(RecordKey::Heartbeat, &core.heartbeat)?;
            let missed = core.heartbeat.missed_check_ins;
            warn!(missed_check_ins = missed, "check-in missed");
            self.transition(&mut core, SwitchState::Warning, json!({ "missedCheckIns": missed }))?;
            drop(core);
            self.notify_owner(WARNING_MESSAGE, "heartbeat.warning_sent").await?;
            return Ok(NextStep::Now);
        }

        core.heartbeat.record_ping(now);
        self.vault.put(RecordKey::Heartbeat, &core.heartbeat)?;
        drop(core);
        self.notify_owner(CHECK_IN_PING, "heartbeat.ping_sent").await?;
        Ok(NextStep::At(now.saturating_add(interval)))
    }

    async fn step_warning(&self) -> Result<NextStep> {
        let mut core = self.core.lock().await;
        if core.switch.state != SwitchState::Warning {
            return Ok(NextStep::Now);
        }
        let entered_at = core.switch.entered_at;
        if core.heartbeat.checked_in_since(entered_at) {
            self.transition(&mut core, SwitchState::Armed, json!({ "reason": "check_in" }))?;
            return Ok(NextStep::Now);
        }
        let deadline = entered_at.saturating_add(millis(self.config.heartbeat.warning_period));
        if self.clock.now() < deadline {
            return Ok(NextStep::At(deadline));
        }
        self.transition(&mut core, SwitchState::Escalating, json!({ "reason": "warning_period_elapsed" }))?;
        Ok(NextStep::Now)
    }

    async fn step_escalating(&self) -> Result<NextStep> {
        let mut core = self.core.lock().await;
        if core.switch.state != SwitchState::Escalating {
            return Ok(NextStep::Now);
        }
        let episode = core.switch.entered_at;

        let resolution = if core.heartbeat.checked_in_since(episode) {
            self.coordinator.cancel(episode, ResolutionReason::CheckIn).await?
        } else {
            let contacts = self
                .vault
                .get::<Vec<TrustedContact>>(RecordKey::TrustedContacts)?
                .unwrap_or_else(|| self.config.heartbeat.escalation_contacts.clone());
            let opened = self.coordinator.open_round(episode, contacts).await?;
            drop(core);
            let resolution = self.coordinator.run_round(opened).await?;
            core = self.core.lock().await;
            resolution
        };

        if core.switch.state != SwitchState::Escalating || core.switch.entered_at != episode {
            return Ok(NextStep::Now);
        }
        match resolution.outcome {
            RoundOutcome::Alive => {
                self.transition(&mut core, SwitchState::Armed, json!({ "reason": resolution.reason }))?;
            }
            RoundOutcome::Absent => {
                self.transition(&mut core, SwitchState::Triggered, json!({ "reason": resolution.reason }))?;
            }
            RoundOutcome::Aborted => {
                return Err(AfterselfError::InternalError(
                    "escalation round aborted while the switch is still escalating".to_string(),
                ));
            }
        }
        Ok(NextStep::Now)
    }

    async fn step_triggered(&self) -> Result<NextStep> {
        let (episode, ghost_pending, mortality_pending) = {
            let core = self.core.lock().await;
            if core.switch.state != SwitchState::Triggered {
                return Ok(NextStep::Now);
            }
            let episode = core
                .switch
                .triggered_at
                .ok_or_else(|| AfterselfError::InternalError("triggered switch has no trigger time".to_string()))?;
            (episode, !core.switch.ghost_notified, !core.switch.mortality_notified)
        };

        if ghost_pending {
            self.notify_ghost(SwitchEvent::Triggered, episode).await?;
        }
        if mortality_pending {
            self.report_mortality(episode).await?;
        }

        if !self.config.executor.enabled {
            let mut core = self.core.lock().await;
            if core.executor_skipped != Some(episode) {
                core.executor_skipped = Some(episode);
                warn!(episode, "executor disabled; plan will not run");
                self.audit(AuditEvent::failure(
                    AuditKind::Executor,
                    "executor.skipped",
                    "executor is disabled in configuration",
                    json!({ "episode": episode }),
                ))?;
            }
            return Ok(NextStep::Idle);
        }

        let plan = self
            .vault
            .get_plan()?
            .unwrap_or_else(|| ActionPlan::empty("empty", "No plan", episode));
        let stop = {
            let mut core = self.core.lock().await;
            if core.switch.state != SwitchState::Triggered || core.switch.triggered_at != Some(episode) {
                return Ok(NextStep::Now);
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            core.exec_stop = Some(stop_tx);
            stop_rx
        };

        let outcome = self.executor.run(&plan, episode, stop).await;
        let mut core = self.core.lock().await;
        core.exec_stop = None;

        match outcome? {
            ExecutionOutcome::Settled(progress) => {
                if core.switch.state != SwitchState::Triggered || core.switch.triggered_at != Some(episode) {
                    return Ok(NextStep::Now);
                }
                self.transition(
                    &mut core,
                    SwitchState::Completed,
                    json!({
                        "totalActions": progress.total_actions,
                        "completedActions": progress.completed_actions,
                        "failedActions": progress.failed_actions,
                    }),
                )?;
                drop(core);
                self.notify_ghost(SwitchEvent::Completed, episode).await?;
                Ok(NextStep::Now)
            }
            ExecutionOutcome::Stopped => Ok(NextStep::Now),
        }
    }

    async fn check_in_inner(&self) -> Result<SwitchState> {
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        let state = core.switch.state;
        core.heartbeat.record_check_in(now);
        self.vault.put(RecordKey::Heartbeat, &core.heartbeat)?;
        info!(state = %state, "check-in received");
        self.audit(AuditEvent::success(
            AuditKind::Heartbeat,
            "heartbeat.check_in",
            json!({ "state": state }),
        ))?;

        match state {
            SwitchState::Warning => {
                self.transition(&mut core, SwitchState::Armed, json!({ "reason": "check_in" }))?;
            }
            SwitchState::Escalating => {
                let episode = core.switch.entered_at;
                self.coordinator.cancel(episode, ResolutionReason::CheckIn).await?;
                self.transition(&mut core, SwitchState::Armed, json!({ "reason": "check_in" }))?;
            }
            _ => {}
        }
        let state = core.switch.state;
        drop(core);
        self.wake.notify_one();
        Ok(state)
    }

    async fn disable_inner(&self) -> Result<SwitchState> {
        let mut core = self.core.lock().await;
        let state = core.switch.state;
        if state == SwitchState::Disabled {
            return Ok(state);
        }
        let episode = core.switch.entered_at;
        self.transition(&mut core, SwitchState::Disabled, json!({ "reason": "manual" }))?;
        if let Some(stop) = &core.exec_stop {
            let _ = stop.send(true);
        }
        if state == SwitchState::Escalating {
            self.coordinator.cancel(episode, ResolutionReason::Disabled).await?;
        }
        drop(core);
        self.wake.notify_one();
        Ok(SwitchState::Disabled)
    }

    /// Moves the switch and persists the record before anything else happens.
    fn transition(&self, core: &mut Core, to: SwitchState, details: Value) -> Result<()> {
        let now = self.clock.now();
        let from = core.switch.transition(to, now)?;
        self.vault.put(RecordKey::SwitchState, &core.switch)?;
        info!(from = %from, to = %to, "switch transition");

        let mut details = match details {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("from".to_string(), json!(from));
        details.insert("to".to_string(), json!(to));
        let kind = match to {
            SwitchState::Armed | SwitchState::Warning => AuditKind::Heartbeat,
            SwitchState::Escalating => AuditKind::Escalation,
            SwitchState::Triggered | SwitchState::Completed => AuditKind::Executor,
            SwitchState::Disabled => AuditKind::Config,
        };
        self.audit(AuditEvent::success(kind, "switch.transition", Value::Object(details)))
    }

    /// Sends `content` to the owner on every configured channel at once.
    async fn notify_owner(&self, content: &str, action: &str) -> Result<()> {
        let delivery = &self.collaborators.delivery;
        let channels = &self.config.heartbeat.channels;
        let outcomes = join_all(channels.iter().map(|&channel| async move {
            (channel, delivery.notify_owner(channel, content).await)
        }))
        .await;

        for (channel, outcome) in outcomes {
            let details = json!({ "channel": channel });
            let event = match outcome {
                DeliveryOutcome::Delivered => AuditEvent::success(AuditKind::Heartbeat, action, details),
                DeliveryOutcome::Failed(reason) => {
                    let err = AfterselfError::TransientDelivery(reason);
                    warn!(channel = channel.as_str(), error = %err, "owner notification failed");
                    AuditEvent::failure(AuditKind::Heartbeat, action, err.to_string(), details)
                }
            };
            self.audit(event)?;
        }
        Ok(())
    }

    async fn notify_ghost(&self, event: SwitchEvent, episode: Timestamp) -> Result<()> {
        let Some(ghost) = self.collaborators.ghost.as_ref().filter(|_| self.config.ghost.enabled) else {
            return Ok(());
        };
        let now = self.clock.now();
        let outcome = ghost.on_switch_event(event, now).await;
        if event == SwitchEvent::Triggered {
            let delivered = outcome.is_ok();
            self.mark_episode(episode, |switch| {
                switch.ghost_notified = true;
                if delivered && switch.ghost_activated_at.is_none() {
                    switch.ghost_activated_at = Some(now);
                }
            })
            .await?;
        }
        match outcome {
            Ok(()) => {
                info!(?event, "ghost mode notified");
                self.audit(AuditEvent::success(
                    AuditKind::Ghost,
                    "ghost.notified",
                    json!({ "event": format!("{event:?}"), "episode": episode }),
                ))
            }
            Err(reason) => {
                warn!(?event, %reason, "ghost mode notification failed");
                self.audit(AuditEvent::failure(
                    AuditKind::Ghost,
                    "ghost.notify_failed",
                    reason,
                    json!({ "event": format!("{event:?}"), "episode": episode }),
                ))
            }
        }
    }

    async fn report_mortality(&self, episode: Timestamp) -> Result<()> {
        let Some(pool) = self
            .collaborators
            .mortality
            .as_ref()
            .filter(|_| self.config.mortality_pool.enabled)
        else {
            return Ok(());
        };
        let outcome = pool.on_triggered(episode).await;
        self.mark_episode(episode, |switch| {
            switch.mortality_notified = true;
            if let Ok(report) = &outcome {
                switch.mortality_token_balance = Some(report.token_balance);
                switch.mortality_transfer_complete = report.transfer_complete;
            }
        })
        .await?;
        match outcome {
            Ok(report) => {
                info!(balance = report.token_balance, complete = report.transfer_complete, "mortality pool reported");
                self.audit(AuditEvent::success(
                    AuditKind::Mortality,
                    "mortality.reported",
                    json!({ "tokenBalance": report.token_balance, "transferComplete": report.transfer_complete }),
                ))
            }
            Err(reason) => {
                warn!(%reason, "mortality pool transfer failed");
                self.audit(AuditEvent::failure(
                    AuditKind::Mortality,
                    "mortality.failed",
                    reason,
                    json!({ "episode": episode }),
                ))
            }
        }
    }

    /// Applies `update` to the switch record if it still belongs to the trigger `episode`.
    async fn mark_episode(&self, episode: Timestamp, update: impl FnOnce(&mut SwitchRecord)) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.switch.triggered_at != Some(episode) {
            return Ok(());
        }
        update(&mut core.switch);
        self.vault.put(RecordKey::SwitchState, &core.switch)
    }

    fn audit(&self, event: AuditEvent) -> Result<()> {
        self.vault.append_audit(event, self.clock.now()).map(|_| ())
    }

    /// A vault integrity failure halts the switch for good.
    fn halt_on_integrity<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_integrity() && !self.halted.swap(true, Ordering::SeqCst) {
                error!(error = %err, "vault integrity failure; switch halted");
                let audited = self.audit(AuditEvent::failure(
                    AuditKind::Error,
                    "vault.integrity",
                    err.to_string(),
                    json!({}),
                ));
                if let Err(audit_err) = audited {
                    error!(error = %audit_err, "could not record the integrity failure in the audit log");
                }
            }
        }
        result
    }
}
