// src/backend/models/common.rs
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Timestamp = u64; // Epoch milliseconds
pub type ContactId = String;
pub type ActionId = String;
pub type PlanId = String;

/// Messaging channels a contact or the owner can be reached on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Discord,
    Signal,
    Slack,
    Imessage,
    Webchat,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Signal => "signal",
            Self::Slack => "slack",
            Self::Imessage => "imessage",
            Self::Webchat => "webchat",
            Self::Email => "email",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SocialPlatform {
    Twitter,
    Instagram,
    Facebook,
    Linkedin,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    #[default]
    Armed,      // Normal, timer running, user alive
    Warning,    // Missed check-in, warning sent to user
    Escalating, // Contacting trusted contacts for confirmation
    Triggered,  // Confirmed absence, executor running
    Completed,  // All actions settled
    Disabled,   // Manually disabled
}

impl SwitchState {
    pub fn allowed_transitions(&self) -> &'static [SwitchState] {
        use SwitchState::*;
        match self {
            Armed => &[Warning, Disabled],
            Warning => &[Armed, Escalating, Disabled],
            Escalating => &[Armed, Triggered, Disabled],
            Triggered => &[Completed, Disabled],
            Completed => &[Disabled],
            Disabled => &[Armed],
        }
    }

    pub fn can_transition_to(&self, target: SwitchState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// States in which the action plan may no longer change.
    pub fn locks_plan(&self) -> bool {
        matches!(self, Self::Triggered | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Armed => "armed",
            Self::Warning => "warning",
            Self::Escalating => "escalating",
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
