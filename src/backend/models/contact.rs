// src/backend/models/contact.rs
use crate::models::common::{Channel, ContactId, Timestamp};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A person who can confirm the owner's absence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContact {
    #[validate(length(min = 1, max = 64))]
    pub id: ContactId,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 3, max = 32))]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub email: Option<String>,
}

impl TrustedContact {
    /// Address used for `channel`: the email for the email channel, else the phone,
    /// falling back to the contact id for handle-based channels.
    pub fn address(&self) -> &str {
        let preferred = match self.channel {
            Channel::Email => self.email.as_deref().or(self.phone.as_deref()),
            _ => self.phone.as_deref().or(self.email.as_deref()),
        };
        preferred.unwrap_or(&self.id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ContactResponse {
    ConfirmedAbsent,
    ConfirmedAlive,
    /// Synthesized at timeout; never sent by a contact.
    NoResponse,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EscalationResponse {
    pub contact_id: ContactId,
    pub response: ContactResponse,
    pub timestamp: Timestamp,
}
