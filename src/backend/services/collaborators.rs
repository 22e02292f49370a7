// src/backend/services/collaborators.rs
// Seams to the outside world. The core never talks to a network itself.

use crate::models::action::{Action, ActionKind};
use crate::models::common::{Channel, SocialPlatform, Timestamp};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

/// Message delivery per channel. Failures are transient from the core's point of view.
#[async_trait]
pub trait ChannelDelivery: Send + Sync {
    /// Sends `content` to `address` on `channel` (contact requests, message/email actions).
    async fn send(&self, channel: Channel, address: &str, content: &str) -> DeliveryOutcome;

    /// Sends a check-in ping or a warning to the owner on `channel`.
    async fn notify_owner(&self, channel: Channel, content: &str) -> DeliveryOutcome;

    /// Publishes a post on the owner's account.
    async fn post(&self, platform: SocialPlatform, content: &str, media: &[String]) -> DeliveryOutcome;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed(String),
}

impl From<DeliveryOutcome> for ActionOutcome {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Delivered => Self::Succeeded,
            DeliveryOutcome::Failed(reason) => Self::Failed(reason),
        }
    }
}

/// Executes one action type. Transfers and closures must treat the action id as a
/// dedup key: the executor may retry an attempt whose outcome it never recorded.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn execute(&self, action: &Action) -> ActionOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    Triggered,
    Completed,
}

/// Downstream consumer of the switch's triggered/completed transitions.
#[async_trait]
pub trait GhostMode: Send + Sync {
    async fn on_switch_event(&self, event: SwitchEvent, at: Timestamp) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MortalityReport {
    pub token_balance: f64,
    pub transfer_complete: bool,
}

#[async_trait]
pub trait MortalityPool: Send + Sync {
    async fn on_triggered(&self, triggered_at: Timestamp) -> Result<MortalityReport, String>;
}

/// Routes message, email and social_post actions through channel delivery.
pub struct ChannelActionRunner {
    delivery: Arc<dyn ChannelDelivery>,
}

impl ChannelActionRunner {
    pub fn new(delivery: Arc<dyn ChannelDelivery>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl ActionRunner for ChannelActionRunner {
    async fn execute(&self, action: &Action) -> ActionOutcome {
        match &action.kind {
            ActionKind::Message { channel, to, content, .. } => {
                self.delivery.send(*channel, to, content).await.into()
            }
            ActionKind::Email { to, subject, body, .. } => {
                let content = format!("Subject: {subject}\n\n{body}");
                self.delivery.send(Channel::Email, to, &content).await.into()
            }
            ActionKind::SocialPost { platform, content, media } => {
                self.delivery.post(*platform, content, media).await.into()
            }
            other => ActionOutcome::Failed(format!(
                "channel runner cannot execute {} actions",
                other.type_name()
            )),
        }
    }
}

/// One runner per action type.
#[derive(Clone)]
pub struct ActionRunners {
    pub message: Arc<dyn ActionRunner>,
    pub email: Arc<dyn ActionRunner>,
    pub crypto_transfer: Arc<dyn ActionRunner>,
    pub close_account: Arc<dyn ActionRunner>,
    pub social_post: Arc<dyn ActionRunner>,
    pub custom: Arc<dyn ActionRunner>,
}

impl ActionRunners {
    /// Channel-backed runners for message/email/social_post plus the three
    /// integrations the core cannot provide itself.
    pub fn with_channel_delivery(
        delivery: Arc<dyn ChannelDelivery>,
        crypto_transfer: Arc<dyn ActionRunner>,
        close_account: Arc<dyn ActionRunner>,
        custom: Arc<dyn ActionRunner>,
    ) -> Self {
        let channel: Arc<dyn ActionRunner> = Arc::new(ChannelActionRunner::new(delivery));
        Self {
            message: channel.clone(),
            email: channel.clone(),
            crypto_transfer,
            close_account,
            social_post: channel,
            custom,
        }
    }

    /// The single dispatch site over action types.
    pub fn runner_for(&self, kind: &ActionKind) -> &Arc<dyn ActionRunner> {
        match kind {
            ActionKind::Message { .. } => &self.message,
            ActionKind::Email { .. } => &self.email,
            ActionKind::CryptoTransfer { .. } => &self.crypto_transfer,
            ActionKind::CloseAccount { .. } => &self.close_account,
            ActionKind::SocialPost { .. } => &self.social_post,
            ActionKind::Custom { .. } => &self.custom,
        }
    }

    pub async fn execute(&self, action: &Action) -> ActionOutcome {
        self.runner_for(&action.kind).execute(action).await
    }
}

impl fmt::Debug for ActionRunners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRunners").finish_non_exhaustive()
    }
}

/// Everything the switch needs from outside, handed in at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub delivery: Arc<dyn ChannelDelivery>,
    pub runners: ActionRunners,
    pub ghost: Option<Arc<dyn GhostMode>>,
    pub mortality: Option<Arc<dyn MortalityPool>>,
}
