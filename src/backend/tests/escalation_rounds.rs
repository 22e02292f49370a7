mod support;

use afterself::models::common::SwitchState;
use afterself::models::contact::ContactResponse;
use afterself::models::state::{EscalationRound, ResolutionReason, RoundOutcome};
use afterself::services::NextStep;
use afterself::storage::RecordKey;
use afterself::AfterselfError;
use support::*;

fn stored_round(vault: &afterself::storage::Vault) -> EscalationRound {
    vault.get(RecordKey::EscalationRound).unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn contact_confirming_alive_at_minute_two_rearms_the_switch() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;
    let escalated_at = machine.now();

    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE * 2).await;
    machine
        .submit_contact_response("a", ContactResponse::ConfirmedAlive)
        .await
        .unwrap();

    assert_eq!(round.await.unwrap().unwrap(), NextStep::Now);
    assert_eq!(current_state(&machine).await, SwitchState::Armed);

    let round = stored_round(&vault);
    let resolution = round.resolution.unwrap();
    assert_eq!(resolution.outcome, RoundOutcome::Alive);
    assert_eq!(resolution.reason, ResolutionReason::ContactConfirmedAlive);
    assert_eq!(resolution.resolved_at, escalated_at + 2 * 60_000);
    assert_eq!(round.deadline, escalated_at + 10 * 60_000);
    assert_eq!(round.responses.len(), 1);
    assert_eq!(h.delivery.sent_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn all_contacts_confirming_absent_triggers_at_the_last_answer() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;
    let escalated_at = machine.now();

    let round = spawn_advance(&machine);
    for (contact, wait) in [("a", 1), ("b", 2), ("c", 2)] {
        tokio::time::sleep(MINUTE * wait).await;
        machine
            .submit_contact_response(contact, ContactResponse::ConfirmedAbsent)
            .await
            .unwrap();
    }

    assert_eq!(round.await.unwrap().unwrap(), NextStep::Now);
    assert_eq!(current_state(&machine).await, SwitchState::Triggered);

    let resolution = stored_round(&vault).resolution.unwrap();
    assert_eq!(resolution.outcome, RoundOutcome::Absent);
    assert_eq!(resolution.reason, ResolutionReason::ConfirmedAbsent);
    assert_eq!(resolution.resolved_at, escalated_at + 5 * 60_000);
    assert_eq!(machine.state().await.unwrap().escalation_responses.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn silence_until_the_timeout_resolves_absent() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;
    let escalated_at = machine.now();

    machine.advance().await.unwrap();

    assert_eq!(current_state(&machine).await, SwitchState::Triggered);
    let round = stored_round(&vault);
    let resolution = round.resolution.unwrap();
    assert_eq!(resolution.reason, ResolutionReason::NoResponseTimeout);
    assert_eq!(resolution.resolved_at, escalated_at + 10 * 60_000);
    assert!(round
        .responses
        .iter()
        .all(|r| r.response == ContactResponse::NoResponse && r.timestamp == round.deadline));
}

#[tokio::test(start_paused = true)]
async fn owner_check_in_mid_round_resolves_alive() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    machine
        .submit_contact_response("b", ContactResponse::ConfirmedAbsent)
        .await
        .unwrap();
    tokio::time::sleep(MINUTE).await;
    assert_eq!(machine.check_in().await.unwrap(), SwitchState::Armed);

    assert_eq!(round.await.unwrap().unwrap(), NextStep::Now);
    let state = machine.state().await.unwrap();
    assert_eq!(state.switch_state, SwitchState::Armed);
    assert_eq!(state.missed_check_ins, 0);
    let resolution = stored_round(&vault).resolution.unwrap();
    assert_eq!(resolution.reason, ResolutionReason::CheckIn);
    assert_eq!(resolution.outcome, RoundOutcome::Alive);
}

#[tokio::test(start_paused = true)]
async fn only_the_first_answer_per_contact_counts() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    machine
        .submit_contact_response("a", ContactResponse::ConfirmedAbsent)
        .await
        .unwrap();
    machine
        .submit_contact_response("a", ContactResponse::ConfirmedAlive)
        .await
        .unwrap();
    tokio::time::sleep(MINUTE).await;
    assert_eq!(stored_round(&vault).responses.len(), 1);
    assert!(!round.is_finished());

    let unknown = machine
        .submit_contact_response("zed", ContactResponse::ConfirmedAlive)
        .await;
    assert!(matches!(unknown, Err(AfterselfError::UnknownContact(_))));
    let synthesized = machine
        .submit_contact_response("b", ContactResponse::NoResponse)
        .await;
    assert!(matches!(synthesized, Err(AfterselfError::InvalidResponse(_))));

    machine.disable().await.unwrap();
    assert_eq!(round.await.unwrap().unwrap(), NextStep::Now);
    assert_eq!(stored_round(&vault).resolution.unwrap().outcome, RoundOutcome::Aborted);
}

#[tokio::test(start_paused = true)]
async fn responses_are_rejected_outside_escalation() {
    let h = Harness::new();
    let (_vault, machine) = h.start();
    let result = machine
        .submit_contact_response("a", ContactResponse::ConfirmedAlive)
        .await;
    assert!(matches!(result, Err(AfterselfError::NoActiveRound)));
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_to_one_contact_does_not_block_the_others() {
    let h = Harness::new();
    h.delivery.fail_address("b@example.org");
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    assert_eq!(h.delivery.sent_count(), 2);
    assert!(stored_round(&vault).requests_sent_at.is_some());

    machine
        .submit_contact_response("c", ContactResponse::ConfirmedAlive)
        .await
        .unwrap();
    round.await.unwrap().unwrap();

    let log = machine.audit_log().await.unwrap();
    let failed = entries(&log, "escalation.request_failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].details["contactId"], "b");
    assert!(!failed[0].success);
}

#[tokio::test(start_paused = true)]
async fn interrupted_round_resumes_with_its_answers_and_deadline() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;
    let escalated_at = machine.now();

    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    machine
        .submit_contact_response("a", ContactResponse::ConfirmedAbsent)
        .await
        .unwrap();
    round.abort();
    let _ = round.await;
    drop(machine);
    drop(vault);

    let (vault, machine) = h.start();
    assert_eq!(current_state(&machine).await, SwitchState::Escalating);
    let round = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    for contact in ["b", "c"] {
        machine
            .submit_contact_response(contact, ContactResponse::ConfirmedAbsent)
            .await
            .unwrap();
    }
    round.await.unwrap().unwrap();

    assert_eq!(current_state(&machine).await, SwitchState::Triggered);
    let stored = stored_round(&vault);
    assert_eq!(stored.deadline, escalated_at + 10 * 60_000);
    assert_eq!(stored.responses.len(), 3);
    assert_eq!(h.delivery.sent_count(), 3, "requests were not sent again");
}

#[tokio::test(start_paused = true)]
async fn contacts_are_locked_while_a_round_runs() {
    let h = Harness::new();
    let (_vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    let result = machine
        .replace_contacts(vec![contact("d", afterself::models::common::Channel::Slack)])
        .await;
    assert!(matches!(result, Err(AfterselfError::ContactsLocked)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_advances_run_a_single_round() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    let first = spawn_advance(&machine);
    let second = spawn_advance(&machine);
    tokio::time::sleep(MINUTE).await;
    assert_eq!(h.delivery.sent_count(), 3);
    machine
        .submit_contact_response("a", ContactResponse::ConfirmedAlive)
        .await
        .unwrap();

    assert_eq!(first.await.unwrap().unwrap(), NextStep::Now);
    assert!(second.await.unwrap().is_ok());
    assert_eq!(h.delivery.sent_count(), 3);
    assert_eq!(current_state(&machine).await, SwitchState::Armed);

    let log = machine.audit_log().await.unwrap();
    assert_eq!(entries(&log, "escalation.started").len(), 1);
    assert_eq!(entries(&log, "escalation.request_sent").len(), 3);
    assert_eq!(entries(&log, "escalation.resolved").len(), 1);
    assert_eq!(stored_round(&vault).resolution.unwrap().outcome, RoundOutcome::Alive);
}

#[tokio::test(start_paused = true)]
async fn check_in_before_the_round_opens_resolves_it_without_requests() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;
    let escalated_at = machine.now();

    let round = spawn_advance(&machine);
    assert_eq!(machine.check_in().await.unwrap(), SwitchState::Armed);
    assert!(round.await.unwrap().is_ok());

    let stored = stored_round(&vault);
    assert_eq!(stored.episode, escalated_at);
    assert!(stored.requests_sent_at.is_none());
    let resolution = stored.resolution.unwrap();
    assert_eq!(resolution.reason, ResolutionReason::CheckIn);
    assert_eq!(resolution.outcome, RoundOutcome::Alive);

    assert!(matches!(machine.advance().await.unwrap(), NextStep::At(_)));
    assert_eq!(h.delivery.sent_count(), 0);
    assert_eq!(current_state(&machine).await, SwitchState::Armed);
    let log = machine.audit_log().await.unwrap();
    assert!(entries(&log, "escalation.started").is_empty());
    assert_eq!(entries(&log, "escalation.resolved").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disabling_before_the_round_opens_aborts_it() {
    let h = Harness::new();
    let (vault, machine) = h.start();
    drive_until(&machine, SwitchState::Escalating).await;

    assert_eq!(machine.disable().await.unwrap(), SwitchState::Disabled);
    assert_eq!(machine.advance().await.unwrap(), NextStep::Idle);

    assert_eq!(h.delivery.sent_count(), 0);
    let resolution = stored_round(&vault).resolution.unwrap();
    assert_eq!(resolution.outcome, RoundOutcome::Aborted);
    assert_eq!(resolution.reason, ResolutionReason::Disabled);
    let late = machine
        .submit_contact_response("a", ContactResponse::ConfirmedAlive)
        .await;
    assert!(matches!(late, Err(AfterselfError::NoActiveRound)));
}
