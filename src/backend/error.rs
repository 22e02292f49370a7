// src/backend/error.rs
use crate::models::common::SwitchState;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AfterselfError {
    /// A channel or action collaborator failed; retryable within the action's budget.
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    #[error("Action {action_id} failed permanently after {attempts} attempts: {reason}")]
    PermanentAction {
        action_id: String,
        attempts: u32,
        reason: String,
    },

    /// Authentication failure or a corrupt record. Fatal: the switch halts.
    #[error("Vault integrity failure on {record}: {reason}")]
    VaultIntegrity { record: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: SwitchState, to: SwitchState },

    #[error("Action plan is locked while the switch is {0}")]
    PlanLocked(SwitchState),

    #[error("Trusted contacts are locked while an escalation round is running")]
    ContactsLocked,

    #[error("No escalation round in progress")]
    NoActiveRound,

    #[error("Unknown trusted contact: {0}")]
    UnknownContact(String),

    #[error("Invalid escalation response: {0}")]
    InvalidResponse(String),

    #[error("No triggered plan is waiting for confirmation")]
    NotAwaitingConfirmation,

    #[error("Switch halted after a vault integrity failure; operator intervention required")]
    Halted,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AfterselfError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::VaultIntegrity { .. })
    }

    pub(crate) fn integrity(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VaultIntegrity {
            record: record.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for AfterselfError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AfterselfError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AfterselfError>;
