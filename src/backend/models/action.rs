// src/backend/models/action.rs
use crate::error::{AfterselfError, Result};
use crate::models::common::{ActionId, Channel, PlanId, SocialPlatform, Timestamp};
use crate::utils::time::duration_serde;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CloseMethod {
    BrowserAutomation,
    Api,
    EmailRequest,
}

/// Payload of a post-absence action. Closed set: every consumer matches exhaustively.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ActionKind {
    Message {
        channel: Channel,
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    Email {
        to: String,
        subject: String,
        body: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    CryptoTransfer {
        asset: String,
        amount: f64,
        to_wallet: String,
        /// Use escrow for trustless transfer
        use_escrow: bool,
        chain: String,
    },
    CloseAccount {
        service: String,
        url: String,
        method: CloseMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    SocialPost {
        platform: SocialPlatform,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<String>,
    },
    Custom {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        webhook_payload: Option<serde_json::Value>,
    },
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Email { .. } => "email",
            Self::CryptoTransfer { .. } => "crypto_transfer",
            Self::CloseAccount { .. } => "close_account",
            Self::SocialPost { .. } => "social_post",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    /// Offset from the trigger time, e.g. "0h", "24h", "7d".
    #[serde(with = "duration_serde")]
    pub delay: Duration,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn new(id: impl Into<ActionId>, delay: Duration, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            delay,
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    #[validate(length(min = 1, max = 64))]
    pub id: PlanId,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    /// Actions to execute in order
    pub actions: Vec<Action>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ActionPlan {
    pub fn empty(id: impl Into<PlanId>, name: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            actions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Field rules plus unique, non-empty action ids.
    pub fn validate_plan(&self) -> Result<()> {
        self.validate()?;
        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.id.trim().is_empty() {
                return Err(AfterselfError::Config("action id must not be empty".to_string()));
            }
            if !seen.insert(action.id.as_str()) {
                return Err(AfterselfError::Config(format!("duplicate action id {}", action.id)));
            }
        }
        Ok(())
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(raw)
            .map_err(|e| AfterselfError::Config(format!("invalid action plan: {e}")))?;
        plan.validate_plan()?;
        Ok(plan)
    }
}
