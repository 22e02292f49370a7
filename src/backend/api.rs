// src/backend/api.rs
// Front-end surface: validated requests over the switch operations.

use crate::{
    error::{AfterselfError, Result},
    models::action::ActionPlan,
    models::audit_log::AuditEntry,
    models::common::SwitchState,
    models::config::AfterselfConfig,
    models::contact::{ContactResponse, TrustedContact},
    models::state::AfterselfState,
    services::{run_switch, Collaborators, SwitchMachine},
    storage::Vault,
    utils::guards::check_contacts,
    utils::time::{Clock, TokioClock},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use validator::Validate;

// --- Validation Helper ---
fn validate_request<T: Validate>(req: &T) -> Result<()> {
    req.validate().map_err(|e| AfterselfError::Config(e.to_string()))
}

// --- Request Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContactResponseRequest {
    #[validate(length(min = 1, max = 64))]
    pub contact_id: String,
    pub response: ContactResponse,
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceContactsRequest {
    #[validate(length(min = 1), nested)]
    pub contacts: Vec<TrustedContact>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePlanRequest {
    #[validate(nested)]
    pub plan: ActionPlan,
}

/// A running switch: the machine plus its scheduler task.
pub struct Afterself {
    machine: Arc<SwitchMachine>,
    shutdown: watch::Sender<bool>,
    scheduler: Option<JoinHandle<Result<()>>>,
}

impl Afterself {
    /// Opens the vault named in `config` and starts the scheduler on the current runtime.
    pub async fn start(config: AfterselfConfig, collaborators: Collaborators) -> Result<Self> {
        Self::start_with_clock(config, collaborators, Arc::new(TokioClock::new())).await
    }

    pub async fn start_with_clock(
        config: AfterselfConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_config()?;
        let vault = Arc::new(Vault::open(&config.vault)?);
        let machine = Arc::new(SwitchMachine::open(config, vault, collaborators, clock)?);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(run_switch(Arc::clone(&machine), shutdown_rx));
        info!("afterself started");
        Ok(Self {
            machine,
            shutdown,
            scheduler: Some(scheduler),
        })
    }

    pub fn machine(&self) -> &Arc<SwitchMachine> {
        &self.machine
    }

    pub async fn check_in(&self) -> Result<SwitchState> {
        self.machine.check_in().await
    }

    pub async fn disable(&self) -> Result<SwitchState> {
        self.machine.disable().await
    }

    pub async fn rearm(&self) -> Result<SwitchState> {
        self.machine.rearm().await
    }

    pub async fn confirm_execution(&self) -> Result<()> {
        self.machine.confirm_execution().await
    }

    pub async fn submit_contact_response(&self, req: ContactResponseRequest) -> Result<()> {
        validate_request(&req)?;
        self.machine
            .submit_contact_response(&req.contact_id, req.response)
            .await
    }

    pub async fn replace_plan(&self, req: ReplacePlanRequest) -> Result<ActionPlan> {
        validate_request(&req)?;
        self.machine.replace_plan(req.plan).await
    }

    /// Accepts the plan as JSON text, durations in the `72h` / `7d` grammar.
    pub async fn replace_plan_json(&self, raw: &str) -> Result<ActionPlan> {
        let plan = ActionPlan::from_json(raw)?;
        self.machine.replace_plan(plan).await
    }

    pub async fn replace_contacts(&self, req: ReplaceContactsRequest) -> Result<()> {
        validate_request(&req)?;
        check_contacts(&req.contacts)?;
        self.machine.replace_contacts(req.contacts).await
    }

    pub async fn state(&self) -> Result<AfterselfState> {
        self.machine.state().await
    }

    pub async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        self.machine.audit_log().await
    }

    /// Stops the scheduler and waits for it. Returns the scheduler's own error, if it
    /// stopped on one.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let Some(scheduler) = self.scheduler.take() else {
            return Ok(());
        };
        match scheduler.await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "scheduler task ended abnormally");
                Err(AfterselfError::InternalError(format!("scheduler task failed: {err}")))
            }
        }
    }
}

impl Drop for Afterself {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
