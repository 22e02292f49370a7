// src/backend/services/scheduler.rs
// Drives the switch: evaluate, then sleep until the next due time, an operation, or shutdown.

use crate::error::{AfterselfError, Result};
use crate::services::switch::{NextStep, SwitchMachine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause before re-evaluating after a recoverable error (storage hiccup, lost race).
const RETRY_AFTER_ERROR: Duration = Duration::from_secs(60);

/// Runs until `shutdown` flips to true. Returns an error only when the switch halts.
pub async fn run_switch(machine: Arc<SwitchMachine>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!("switch scheduler started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let step = tokio::select! {
            step = machine.advance() => step,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };

        let wait = match step {
            Ok(NextStep::Now) => continue,
            Ok(NextStep::At(due)) => {
                debug!(due, "next evaluation scheduled");
                Some(until_due(&machine, due))
            }
            Ok(NextStep::Idle) => None,
            Err(err @ (AfterselfError::Halted | AfterselfError::VaultIntegrity { .. })) => {
                error!(error = %err, "switch scheduler stopping");
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, retry_in = ?RETRY_AFTER_ERROR, "switch evaluation failed");
                Some(RETRY_AFTER_ERROR)
            }
        };

        let sleep = async {
            match wait {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = sleep => {}
            _ = machine.changed() => debug!("woken by switch operation"),
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
    info!("switch scheduler stopped");
    Ok(())
}

fn until_due(machine: &SwitchMachine, due: u64) -> Duration {
    Duration::from_millis(due.saturating_sub(machine.now()))
}
