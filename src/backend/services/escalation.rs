// src/backend/services/escalation.rs
use crate::error::{AfterselfError, Result};
use crate::models::audit_log::{AuditEvent, AuditKind};
use crate::models::common::{ContactId, Timestamp};
use crate::models::contact::{ContactResponse, EscalationResponse, TrustedContact};
use crate::models::state::{EscalationRound, ResolutionReason, RoundOutcome, RoundResolution};
use crate::services::collaborators::{ChannelDelivery, DeliveryOutcome};
use crate::storage::{RecordKey, Vault};
use crate::utils::time::{millis, until, Clock};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Resolution policy for a round at `now`. Pure apart from synthesizing
/// `no_response` entries for silent contacts once the deadline has passed.
///
/// Any `confirmed_alive` wins. Otherwise the round resolves absent when every
/// contact answered, or at the deadline whatever was collected.
pub fn resolve(round: &mut EscalationRound, now: Timestamp) -> Option<RoundResolution> {
    if let Some(resolution) = &round.resolution {
        return Some(resolution.clone());
    }
    let resolved = |outcome, reason| RoundResolution {
        outcome,
        reason,
        resolved_at: now,
    };

    if round.count(ContactResponse::ConfirmedAlive) > 0 {
        return Some(resolved(RoundOutcome::Alive, ResolutionReason::ContactConfirmedAlive));
    }
    if !round.contacts.is_empty() && round.all_responded() {
        return Some(resolved(RoundOutcome::Absent, ResolutionReason::ConfirmedAbsent));
    }
    if now >= round.deadline {
        let silent: Vec<ContactId> = round.pending_contacts().map(|c| c.id.clone()).collect();
        let deadline = round.deadline;
        round.responses.extend(silent.into_iter().map(|contact_id| EscalationResponse {
            contact_id,
            response: ContactResponse::NoResponse,
            timestamp: deadline,
        }));
        let reason = if round.count(ContactResponse::ConfirmedAbsent) > 0 {
            ResolutionReason::ConfirmedAbsent
        } else {
            ResolutionReason::NoResponseTimeout
        };
        return Some(resolved(RoundOutcome::Absent, reason));
    }
    None
}

fn outcome_for(reason: ResolutionReason) -> RoundOutcome {
    match reason {
        ResolutionReason::ContactConfirmedAlive | ResolutionReason::CheckIn => RoundOutcome::Alive,
        ResolutionReason::ConfirmedAbsent | ResolutionReason::NoResponseTimeout => RoundOutcome::Absent,
        ResolutionReason::Disabled => RoundOutcome::Aborted,
    }
}

fn request_message(contact: &TrustedContact) -> String {
    format!(
        "Hi {}, this is Afterself. The person who listed you as a trusted contact has missed their \
         check-ins. Reply ALIVE if you know they are well, or ABSENT to confirm their absence.",
        contact.name
    )
}

/// Result of opening a round: either already resolved, or waiting to run.
#[derive(Debug)]
pub enum OpenedRound {
    Resolved(RoundResolution),
    Pending(PendingRound),
}

#[derive(Debug)]
pub struct PendingRound {
    round: EscalationRound,
    cancel: watch::Receiver<bool>,
}

#[derive(Default)]
struct ActiveRound {
    round: Option<EscalationRound>,
    cancel: Option<watch::Sender<bool>>,
}

/// Collects trusted-contact responses for one escalation round at a time.
pub struct EscalationCoordinator {
    vault: Arc<Vault>,
    delivery: Arc<dyn ChannelDelivery>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    active: Mutex<ActiveRound>,
    wake: Notify,
}

impl EscalationCoordinator {
    pub fn new(
        vault: Arc<Vault>,
        delivery: Arc<dyn ChannelDelivery>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            vault,
            delivery,
            clock,
            timeout,
            active: Mutex::new(ActiveRound::default()),
            wake: Notify::new(),
        }
    }

    /// Opens the round for the `escalating` entry at `episode` and registers it as
    /// the one responses and cancellation route to. Called under the switch's lock,
    /// so a check-in or disable can never land before the round is registered.
    ///
    /// A persisted round for the same episode is resumed with its responses and
    /// original deadline; requests go out only if they were never recorded as sent.
    pub async fn open_round(&self, episode: Timestamp, contacts: Vec<TrustedContact>) -> Result<OpenedRound> {
        let mut active = self.active.lock().await;
        let round = match self.vault.get::<EscalationRound>(RecordKey::EscalationRound)? {
            Some(round) if round.episode == episode => {
                info!(episode, responses = round.responses.len(), "resuming escalation round");
                round
            }
            _ => self.start_round(episode, contacts)?,
        };
        if let Some(resolution) = &round.resolution {
            return Ok(OpenedRound::Resolved(resolution.clone()));
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        active.round = Some(round.clone());
        active.cancel = Some(cancel_tx);
        Ok(OpenedRound::Pending(PendingRound {
            round,
            cancel: cancel_rx,
        }))
    }

    /// Sends the requests of an opened round and waits until it resolves.
    pub async fn run_round(&self, opened: OpenedRound) -> Result<RoundResolution> {
        let PendingRound { round, cancel } = match opened {
            OpenedRound::Resolved(resolution) => return Ok(resolution),
            OpenedRound::Pending(pending) => pending,
        };

        let sends = self.send_requests(round.contacts.clone(), cancel);
        tokio::pin!(sends);
        let mut sends_done = round.requests_sent_at.is_some();

        loop {
            if let Some(resolution) = self.evaluate().await? {
                return Ok(resolution);
            }
            tokio::select! {
                outcomes = &mut sends, if !sends_done => {
                    sends_done = true;
                    self.record_requests_sent(outcomes).await?;
                }
                _ = tokio::time::sleep(until(self.clock.as_ref(), round.deadline)) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Records one contact's answer. At most one answer per contact counts.
    pub async fn submit_response(&self, contact_id: &str, response: ContactResponse) -> Result<()> {
        if response == ContactResponse::NoResponse {
            return Err(AfterselfError::InvalidResponse(
                "no_response is only recorded at timeout".to_string(),
            ));
        }
        let mut active = self.active.lock().await;
        let now = self.clock.now();
        let round = active
            .round
            .as_mut()
            .filter(|round| round.resolution.is_none())
            .ok_or(AfterselfError::NoActiveRound)?;
        if !round.contacts.iter().any(|c| c.id == contact_id) {
            return Err(AfterselfError::UnknownContact(contact_id.to_string()));
        }
        if round.has_responded(contact_id) {
            debug!(contact_id, "ignoring repeated escalation response");
            return Ok(());
        }

        round.responses.push(EscalationResponse {
            contact_id: contact_id.to_string(),
            response,
            timestamp: now,
        });
        self.vault.put(RecordKey::EscalationRound, &*round)?;
        drop(active);

        info!(contact_id, ?response, "escalation response recorded");
        self.audit(AuditEvent::success(
            AuditKind::Escalation,
            "escalation.response",
            json!({ "contactId": contact_id, "response": response }),
        ))?;
        self.wake.notify_one();
        Ok(())
    }

    /// Resolves the round of `episode` from outside (check-in or disable) and stops
    /// outstanding waits. The first resolution persisted wins; it is returned. With
    /// no round opened for the episode yet, a resolved empty round is recorded so
    /// none can start for it later.
    pub async fn cancel(&self, episode: Timestamp, reason: ResolutionReason) -> Result<RoundResolution> {
        let mut active = self.active.lock().await;
        let now = self.clock.now();
        let state = &mut *active;

        let mut loaded;
        let registered = state.round.as_ref().is_some_and(|round| round.episode == episode);
        let round = match state.round.as_mut().filter(|_| registered) {
            Some(round) => round,
            None => {
                loaded = match self.vault.get::<EscalationRound>(RecordKey::EscalationRound)? {
                    Some(round) if round.episode == episode => round,
                    _ => EscalationRound {
                        episode,
                        started_at: now,
                        deadline: now,
                        contacts: Vec::new(),
                        requests_sent_at: None,
                        responses: Vec::new(),
                        resolution: None,
                    },
                };
                &mut loaded
            }
        };
        if let Some(existing) = &round.resolution {
            return Ok(existing.clone());
        }

        let resolution = RoundResolution {
            outcome: outcome_for(reason),
            reason,
            resolved_at: now,
        };
        round.resolution = Some(resolution.clone());
        self.vault.put(RecordKey::EscalationRound, &*round)?;
        self.audit_resolution(round, &resolution)?;

        if registered {
            if let Some(cancel) = &state.cancel {
                let _ = cancel.send(true);
            }
        }
        self.wake.notify_one();
        Ok(resolution)
    }

    fn start_round(&self, episode: Timestamp, contacts: Vec<TrustedContact>) -> Result<EscalationRound> {
        let now = self.clock.now();
        let round = EscalationRound {
            episode,
            started_at: now,
            deadline: now.saturating_add(millis(self.timeout)),
            contacts,
            requests_sent_at: None,
            responses: Vec::new(),
            resolution: None,
        };
        self.vault.put(RecordKey::EscalationRound, &round)?;
        info!(episode, contacts = round.contacts.len(), deadline = round.deadline, "escalation round started");
        self.audit(AuditEvent::success(
            AuditKind::Escalation,
            "escalation.started",
            json!({
                "episode": episode,
                "deadline": round.deadline,
                "contacts": round.contacts.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            }),
        ))?;
        Ok(round)
    }

    async fn evaluate(&self) -> Result<Option<RoundResolution>> {
        let mut active = self.active.lock().await;
        let now = self.clock.now();
        let state = &mut *active;
        let round = state.round.as_mut().ok_or(AfterselfError::NoActiveRound)?;

        let already_resolved = round.resolution.is_some();
        let Some(resolution) = resolve(round, now) else {
            return Ok(None);
        };
        if !already_resolved {
            round.resolution = Some(resolution.clone());
            self.vault.put(RecordKey::EscalationRound, &*round)?;
            self.audit_resolution(round, &resolution)?;
        }

        if let Some(cancel) = state.cancel.take() {
            let _ = cancel.send(true);
        }
        state.round = None;
        Ok(Some(resolution))
    }

    /// One task per contact; a slow or failing channel never holds up the others.
    async fn send_requests(
        &self,
        contacts: Vec<TrustedContact>,
        cancel: watch::Receiver<bool>,
    ) -> Vec<(TrustedContact, DeliveryOutcome)> {
        let tasks = contacts.into_iter().map(|contact| {
            let delivery = Arc::clone(&self.delivery);
            let mut cancel = cancel.clone();
            let content = request_message(&contact);
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    outcome = delivery.send(contact.channel, contact.address(), &content) => outcome,
                    Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {
                        DeliveryOutcome::Failed("round resolved before delivery".to_string())
                    }
                };
                (contact, outcome)
            })
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(sent) => Some(sent),
                Err(err) => {
                    warn!(error = %err, "escalation request task failed");
                    None
                }
            })
            .collect()
    }

    async fn record_requests_sent(&self, outcomes: Vec<(TrustedContact, DeliveryOutcome)>) -> Result<()> {
        for (contact, outcome) in &outcomes {
            let details = json!({ "contactId": contact.id, "channel": contact.channel });
            let event = match outcome {
                DeliveryOutcome::Delivered => {
                    AuditEvent::success(AuditKind::Escalation, "escalation.request_sent", details)
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(contact_id = %contact.id, channel = contact.channel.as_str(), %reason, "escalation request not delivered");
                    AuditEvent::failure(AuditKind::Escalation, "escalation.request_failed", reason.clone(), details)
                }
            };
            self.audit(event)?;
        }

        let mut active = self.active.lock().await;
        let now = self.clock.now();
        if let Some(round) = active.round.as_mut() {
            if round.resolution.is_none() && round.requests_sent_at.is_none() {
                round.requests_sent_at = Some(now);
                self.vault.put(RecordKey::EscalationRound, &*round)?;
            }
        }
        Ok(())
    }

    fn audit_resolution(&self, round: &EscalationRound, resolution: &RoundResolution) -> Result<()> {
        info!(
            episode = round.episode,
            outcome = ?resolution.outcome,
            reason = ?resolution.reason,
            "escalation round resolved"
        );
        self.audit(AuditEvent::success(
            AuditKind::Escalation,
            "escalation.resolved",
            json!({
                "episode": round.episode,
                "outcome": resolution.outcome,
                "reason": resolution.reason,
                "confirmedAbsent": round.count(ContactResponse::ConfirmedAbsent),
                "confirmedAlive": round.count(ContactResponse::ConfirmedAlive),
                "noResponse": round.count(ContactResponse::NoResponse),
            }),
        ))
    }

    fn audit(&self, event: AuditEvent) -> Result<()> {
        self.vault.append_audit(event, self.clock.now()).map(|_| ())
    }
}
