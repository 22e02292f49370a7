// src/backend/models/state.rs
use crate::error::{AfterselfError, Result};
use crate::models::common::{ActionId, SwitchState, Timestamp};
use crate::models::contact::{ContactResponse, EscalationResponse, TrustedContact};
use serde::{Deserialize, Serialize};

/// Persisted switch state and the timestamps of the current episode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRecord {
    pub state: SwitchState,
    /// When the current state was entered.
    pub entered_at: Timestamp,
    /// Set on entering `triggered`; identifies the trigger episode.
    pub triggered_at: Option<Timestamp>,
    pub ghost_activated_at: Option<Timestamp>,
    pub mortality_token_balance: Option<f64>,
    pub mortality_transfer_complete: bool,
    /// Ghost mode was told about this trigger episode, whatever it answered.
    #[serde(default)]
    pub ghost_notified: bool,
    /// The mortality pool was called for this trigger episode, whatever it reported.
    #[serde(default)]
    pub mortality_notified: bool,
}

impl SwitchRecord {
    pub fn armed(now: Timestamp) -> Self {
        Self {
            state: SwitchState::Armed,
            entered_at: now,
            triggered_at: None,
            ghost_activated_at: None,
            mortality_token_balance: None,
            mortality_transfer_complete: false,
            ghost_notified: false,
            mortality_notified: false,
        }
    }

    /// Moves to `to`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, to: SwitchState, now: Timestamp) -> Result<SwitchState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(AfterselfError::InvalidTransition { from, to });
        }
        self.state = to;
        self.entered_at = now;
        match to {
            SwitchState::Triggered => {
                self.triggered_at = Some(now);
                self.ghost_activated_at = None;
                self.mortality_token_balance = None;
                self.mortality_transfer_complete = false;
                self.ghost_notified = false;
                self.mortality_notified = false;
            }
            SwitchState::Armed => self.triggered_at = None,
            _ => {}
        }
        Ok(from)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub last_check_in: Option<Timestamp>,
    pub last_ping_sent: Option<Timestamp>,
    /// Consecutive missed heartbeat ticks since the last check-in.
    pub missed_check_ins: u32,
    /// The ping whose missed tick was last counted.
    #[serde(default)]
    pub missed_ping: Option<Timestamp>,
}

impl HeartbeatRecord {
    pub fn record_check_in(&mut self, now: Timestamp) {
        self.last_check_in = Some(now);
        self.missed_check_ins = 0;
    }

    pub fn record_ping(&mut self, now: Timestamp) {
        self.last_ping_sent = Some(now);
    }

    /// Counts the missed tick that followed `ping`. Counting the same ping again
    /// (a replayed tick after a crash) is a no-op and returns false.
    pub fn record_missed_tick(&mut self, ping: Timestamp) -> bool {
        if self.missed_ping == Some(ping) {
            return false;
        }
        self.missed_ping = Some(ping);
        self.missed_check_ins = self.missed_check_ins.saturating_add(1);
        true
    }

    pub fn checked_in_since(&self, since: Timestamp) -> bool {
        self.last_check_in.is_some_and(|at| at >= since)
    }
}

/// Confirmation-gate sub-state of a triggered episode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    NotRequired,
    AwaitingConfirmation,
    Confirmed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorProgress {
    /// Trigger timestamp of the episode this progress belongs to.
    pub episode: Timestamp,
    pub total_actions: u32,
    pub completed_actions: u32,
    pub completed_ids: Vec<ActionId>,
    pub failed_actions: Vec<ActionId>,
    pub current_action: Option<ActionId>,
    pub gate: GateState,
}

impl ExecutorProgress {
    pub fn new(episode: Timestamp, total_actions: u32, gated: bool) -> Self {
        Self {
            episode,
            total_actions,
            completed_actions: 0,
            completed_ids: Vec::new(),
            failed_actions: Vec::new(),
            current_action: None,
            gate: if gated {
                GateState::AwaitingConfirmation
            } else {
                GateState::NotRequired
            },
        }
    }

    pub fn settled_count(&self) -> u32 {
        self.completed_actions + self.failed_actions.len() as u32
    }

    pub fn is_settled(&self) -> bool {
        self.settled_count() >= self.total_actions
    }

    pub fn has_settled(&self, id: &str) -> bool {
        self.completed_ids.iter().any(|c| c == id) || self.failed_actions.iter().any(|f| f == id)
    }

    pub fn begin_attempt(&mut self, id: &str) {
        self.current_action = Some(id.to_string());
    }

    pub fn record_completed(&mut self, id: &str) -> Result<()> {
        self.ensure_can_settle(id)?;
        self.completed_ids.push(id.to_string());
        self.completed_actions += 1;
        self.current_action = None;
        Ok(())
    }

    pub fn record_failed(&mut self, id: &str) -> Result<()> {
        self.ensure_can_settle(id)?;
        self.failed_actions.push(id.to_string());
        self.current_action = None;
        Ok(())
    }

    fn ensure_can_settle(&self, id: &str) -> Result<()> {
        if self.has_settled(id) {
            return Err(AfterselfError::InternalError(format!("action {id} already settled")));
        }
        if self.settled_count() >= self.total_actions {
            return Err(AfterselfError::InternalError(format!(
                "settling {id} would exceed {} actions",
                self.total_actions
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Alive,
    Absent,
    /// The switch was disabled mid-round.
    Aborted,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    ContactConfirmedAlive,
    CheckIn,
    ConfirmedAbsent,
    /// Nobody answered before the timeout; resolved toward the plan.
    NoResponseTimeout,
    Disabled,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoundResolution {
    pub outcome: RoundOutcome,
    pub reason: ResolutionReason,
    pub resolved_at: Timestamp,
}

/// One escalation round, persisted as it progresses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRound {
    /// The `escalating` entry time this round belongs to.
    pub episode: Timestamp,
    pub started_at: Timestamp,
    pub deadline: Timestamp,
    /// Snapshot taken at round start; immutable for the round.
    pub contacts: Vec<TrustedContact>,
    pub requests_sent_at: Option<Timestamp>,
    pub responses: Vec<EscalationResponse>,
    pub resolution: Option<RoundResolution>,
}

impl EscalationRound {
    pub fn has_responded(&self, contact_id: &str) -> bool {
        self.responses.iter().any(|r| r.contact_id == contact_id)
    }

    pub fn all_responded(&self) -> bool {
        self.contacts.iter().all(|c| self.has_responded(&c.id))
    }

    pub fn pending_contacts(&self) -> impl Iterator<Item = &TrustedContact> {
        self.contacts.iter().filter(|c| !self.has_responded(&c.id))
    }

    pub fn count(&self, response: ContactResponse) -> usize {
        self.responses.iter().filter(|r| r.response == response).count()
    }
}

/// Aggregated read-only view for front ends.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AfterselfState {
    pub switch_state: SwitchState,
    pub entered_at: Timestamp,
    pub last_check_in: Option<Timestamp>,
    pub last_ping_sent: Option<Timestamp>,
    pub missed_check_ins: u32,
    pub escalation_responses: Vec<EscalationResponse>,
    pub executor_progress: Option<ExecutorProgress>,
    pub ghost_activated_at: Option<Timestamp>,
    pub mortality_token_balance: Option<f64>,
    pub mortality_transfer_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn progress_never_exceeds_total() {
        let mut progress = ExecutorProgress::new(1, 2, false);
        progress.begin_attempt("a1");
        progress.record_completed("a1").unwrap();
        assert_eq!(progress.current_action, None);
        progress.record_failed("a2").unwrap();
        assert!(progress.is_settled());
        assert!(progress.record_completed("a3").is_err());
        assert!(progress.record_failed("a1").is_err());
        assert_eq!(progress.settled_count(), 2);
    }

    #[test]
    fn transition_rejects_skipping_escalation() {
        let mut record = SwitchRecord::armed(0);
        let err = record.transition(SwitchState::Triggered, 5).unwrap_err();
        assert_eq!(
            err,
            AfterselfError::InvalidTransition {
                from: SwitchState::Armed,
                to: SwitchState::Triggered
            }
        );
        record.transition(SwitchState::Warning, 5).unwrap();
        record.transition(SwitchState::Escalating, 6).unwrap();
        record.transition(SwitchState::Triggered, 7).unwrap();
        assert_eq!(record.triggered_at, Some(7));
    }

    #[test]
    fn new_trigger_episode_clears_collaborator_flags() {
        let mut record = SwitchRecord::armed(0);
        for (to, at) in [(SwitchState::Warning, 1), (SwitchState::Escalating, 2), (SwitchState::Triggered, 3)] {
            record.transition(to, at).unwrap();
        }
        record.ghost_notified = true;
        record.mortality_notified = true;
        record.mortality_token_balance = Some(1.5);

        for (to, at) in [
            (SwitchState::Disabled, 4),
            (SwitchState::Armed, 5),
            (SwitchState::Warning, 6),
            (SwitchState::Escalating, 7),
            (SwitchState::Triggered, 8),
        ] {
            record.transition(to, at).unwrap();
        }
        assert_eq!(record.triggered_at, Some(8));
        assert!(!record.ghost_notified);
        assert!(!record.mortality_notified);
        assert_eq!(record.mortality_token_balance, None);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Tick,
        CheckIn,
    }

    proptest! {
        #[test]
        fn missed_counter_tracks_consecutive_ticks(
            events in proptest::collection::vec(prop_oneof![Just(Event::Tick), Just(Event::CheckIn)], 0..64)
        ) {
            let mut record = HeartbeatRecord::default();
            let mut expected = 0u32;
            for (now, event) in events.iter().enumerate() {
                match event {
                    Event::Tick => {
                        prop_assert!(record.record_missed_tick(now as Timestamp));
                        prop_assert!(!record.record_missed_tick(now as Timestamp));
                        expected += 1;
                    }
                    Event::CheckIn => {
                        record.record_check_in(now as Timestamp);
                        expected = 0;
                        prop_assert_eq!(record.last_check_in, Some(now as Timestamp));
                    }
                }
                prop_assert_eq!(record.missed_check_ins, expected);
            }
        }
    }
}
