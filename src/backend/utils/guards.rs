// src/backend/utils/guards.rs
use crate::error::{AfterselfError, Result};
use crate::models::common::SwitchState;
use crate::models::contact::TrustedContact;
use std::collections::HashSet;
use validator::Validate;

/// Checks that the plan may be replaced in `state`.
///
/// # Errors
///
/// Returns `AfterselfError::PlanLocked` while the switch is triggered or completed.
pub fn check_plan_mutable(state: SwitchState) -> Result<()> {
    if state.locks_plan() {
        Err(AfterselfError::PlanLocked(state))
    } else {
        Ok(())
    }
}

/// Checks that the contact list may be replaced in `state`.
///
/// # Errors
///
/// Returns `AfterselfError::ContactsLocked` while an escalation round runs.
pub fn check_contacts_mutable(state: SwitchState) -> Result<()> {
    if state == SwitchState::Escalating {
        Err(AfterselfError::ContactsLocked)
    } else {
        Ok(())
    }
}

/// Field rules per contact, at least one contact, unique ids.
pub fn check_contacts(contacts: &[TrustedContact]) -> Result<()> {
    if contacts.is_empty() {
        return Err(AfterselfError::Config(
            "at least one trusted contact is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for contact in contacts {
        contact.validate()?;
        if !seen.insert(contact.id.as_str()) {
            return Err(AfterselfError::Config(format!("duplicate contact id {}", contact.id)));
        }
    }
    Ok(())
}

/// Rejects any operation once a vault integrity failure halted the switch.
pub fn check_not_halted(halted: bool) -> Result<()> {
    if halted {
        Err(AfterselfError::Halted)
    } else {
        Ok(())
    }
}
