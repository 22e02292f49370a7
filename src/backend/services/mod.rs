// src/backend/services/mod.rs

pub mod collaborators;
pub mod escalation;
pub mod executor;
pub mod scheduler;
pub mod switch;

pub use collaborators::{
    ActionOutcome, ActionRunner, ActionRunners, ChannelActionRunner, ChannelDelivery, Collaborators,
    DeliveryOutcome, GhostMode, MortalityPool, MortalityReport, SwitchEvent,
};
pub use escalation::{EscalationCoordinator, OpenedRound, PendingRound};
pub use executor::{ActionExecutor, ExecutionOutcome};
pub use scheduler::run_switch;
pub use switch::{NextStep, SwitchMachine};
