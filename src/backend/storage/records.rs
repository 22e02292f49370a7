// src/backend/storage/records.rs
use std::path::{Path, PathBuf};

/// One encrypted record file per logical entity. Choose non-overlapping names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKey {
    SwitchState,
    Heartbeat,
    ActionPlan,
    TrustedContacts,
    EscalationRound,
    ExecutorProgress,
}

impl RecordKey {
    pub const ALL: [RecordKey; 6] = [
        RecordKey::SwitchState,
        RecordKey::Heartbeat,
        RecordKey::ActionPlan,
        RecordKey::TrustedContacts,
        RecordKey::EscalationRound,
        RecordKey::ExecutorProgress,
    ];

    /// Record label; doubles as the associated data bound into the ciphertext.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SwitchState => "switch_state",
            Self::Heartbeat => "heartbeat",
            Self::ActionPlan => "action_plan",
            Self::TrustedContacts => "trusted_contacts",
            Self::EscalationRound => "escalation_round",
            Self::ExecutorProgress => "executor_progress",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.rec", self.label())
    }

    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(self.file_name())
    }
}

pub const AUDIT_DIR: &str = "audit";
pub const BENEFICIARY_DIR: &str = "beneficiary";
pub const BENEFICIARY_PLAN_FILE: &str = "action_plan.ecies";

/// Sealed count of appended audit entries, rewritten after every append.
pub const AUDIT_HEAD_FILE: &str = "head.rec";
pub const AUDIT_HEAD_LABEL: &str = "audit:head";

/// Label of the audit entry at `seq`; binds the position into the ciphertext.
pub fn audit_label(seq: u64) -> String {
    format!("audit:{seq:020}")
}

pub fn audit_file_name(seq: u64) -> String {
    format!("{seq:020}.rec")
}

/// Parses the sequence number back out of an audit file name.
pub fn parse_audit_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(".rec")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
