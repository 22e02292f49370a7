// Shared fakes and builders for the integration scenarios.
#![allow(dead_code)]

use afterself::models::action::{Action, ActionKind, ActionPlan};
use afterself::models::audit_log::AuditEntry;
use afterself::models::common::{Channel, SocialPlatform, SwitchState, Timestamp};
use afterself::models::config::{
    AfterselfConfig, ExecutorConfig, GhostConfig, HeartbeatConfig, LlmConfig, MortalityPoolConfig, VaultConfig,
};
use afterself::models::contact::TrustedContact;
use afterself::models::state::SwitchRecord;
use afterself::services::{
    ActionOutcome, ActionRunner, ActionRunners, ChannelDelivery, Collaborators, DeliveryOutcome, GhostMode,
    MortalityPool, MortalityReport, NextStep, SwitchEvent, SwitchMachine,
};
use afterself::storage::{RecordKey, Vault};
use afterself::utils::time::{Clock, TokioClock};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const BASE: Timestamp = 1_700_000_000_000;
pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct FakeDelivery {
    pub sent: Mutex<Vec<(Channel, String, String)>>,
    pub owner: Mutex<Vec<(Channel, String)>>,
    pub posts: Mutex<Vec<(SocialPlatform, String)>>,
    pub failing: Mutex<HashSet<String>>,
}

impl FakeDelivery {
    pub fn fail_address(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn owner_messages(&self) -> Vec<String> {
        self.owner.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl ChannelDelivery for FakeDelivery {
    async fn send(&self, channel: Channel, address: &str, content: &str) -> DeliveryOutcome {
        if self.failing.lock().unwrap().contains(address) {
            return DeliveryOutcome::Failed(format!("{address} unreachable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel, address.to_string(), content.to_string()));
        DeliveryOutcome::Delivered
    }

    async fn notify_owner(&self, channel: Channel, content: &str) -> DeliveryOutcome {
        self.owner.lock().unwrap().push((channel, content.to_string()));
        DeliveryOutcome::Delivered
    }

    async fn post(&self, platform: SocialPlatform, content: &str, _media: &[String]) -> DeliveryOutcome {
        self.posts.lock().unwrap().push((platform, content.to_string()));
        DeliveryOutcome::Delivered
    }
}

/// Runner whose outcomes are scripted per action id; succeeds once a script runs dry.
pub struct ScriptedRunner {
    clock: Arc<dyn Clock>,
    script: Mutex<HashMap<String, VecDeque<ActionOutcome>>>,
    pub calls: Mutex<Vec<(String, Timestamp)>>,
}

impl ScriptedRunner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_times(&self, action_id: &str, times: usize) {
        let failures = (0..times).map(|i| ActionOutcome::Failed(format!("attempt {} refused", i + 1)));
        self.script
            .lock()
            .unwrap()
            .entry(action_id.to_string())
            .or_default()
            .extend(failures);
    }

    pub fn calls(&self) -> Vec<(String, Timestamp)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl ActionRunner for ScriptedRunner {
    async fn execute(&self, action: &Action) -> ActionOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((action.id.clone(), self.clock.now()));
        self.script
            .lock()
            .unwrap()
            .get_mut(&action.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ActionOutcome::Succeeded)
    }
}

#[derive(Default)]
pub struct FakeGhost {
    pub events: Mutex<Vec<SwitchEvent>>,
    pub failing: Mutex<bool>,
}

#[async_trait]
impl GhostMode for FakeGhost {
    async fn on_switch_event(&self, event: SwitchEvent, _at: Timestamp) -> Result<(), String> {
        self.events.lock().unwrap().push(event);
        if *self.failing.lock().unwrap() {
            return Err("ghost agent offline".to_string());
        }
        Ok(())
    }
}

/// Mortality pool returning a fixed report (a completed transfer by default).
pub struct FakeMortality {
    pub calls: Mutex<u32>,
    pub report: Mutex<Result<MortalityReport, String>>,
}

impl Default for FakeMortality {
    fn default() -> Self {
        Self {
            calls: Mutex::new(0),
            report: Mutex::new(Ok(MortalityReport {
                token_balance: 42.5,
                transfer_complete: true,
            })),
        }
    }
}

impl FakeMortality {
    pub fn reports(&self, report: Result<MortalityReport, String>) {
        *self.report.lock().unwrap() = report;
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl MortalityPool for FakeMortality {
    async fn on_triggered(&self, _triggered_at: Timestamp) -> Result<MortalityReport, String> {
        *self.calls.lock().unwrap() += 1;
        self.report.lock().unwrap().clone()
    }
}

pub fn contact(id: &str, channel: Channel) -> TrustedContact {
    TrustedContact {
        id: id.to_string(),
        name: id.to_uppercase(),
        channel,
        phone: Some(format!("+1555{id}")),
        email: Some(format!("{id}@example.org")),
    }
}

pub fn message(id: &str, delay: Duration) -> Action {
    Action::new(
        id,
        delay,
        ActionKind::Message {
            channel: Channel::Whatsapp,
            to: "+15550123".to_string(),
            content: format!("message {id}"),
            attachments: vec![],
        },
    )
}

pub fn plan(actions: Vec<Action>) -> ActionPlan {
    let mut plan = ActionPlan::empty("estate", "Estate plan", BASE);
    plan.actions = actions;
    plan
}

/// 1h heartbeat, 1h warning period, 10m escalation timeout, three contacts.
pub fn config(dir: &TempDir) -> AfterselfConfig {
    AfterselfConfig {
        heartbeat: HeartbeatConfig {
            interval: HOUR,
            channels: vec![Channel::Telegram, Channel::Email],
            warning_period: HOUR,
            escalation_timeout: MINUTE * 10,
            escalation_contacts: vec![
                contact("a", Channel::Signal),
                contact("b", Channel::Email),
                contact("c", Channel::Whatsapp),
            ],
        },
        vault: VaultConfig::for_path(dir.path().join("vault")),
        executor: ExecutorConfig {
            enabled: true,
            confirmation_gate: false,
            audit_log: true,
            max_retries: 2,
            action_delay: 1_000,
        },
        ghost: GhostConfig::default(),
        llm: LlmConfig::default(),
        mortality_pool: MortalityPoolConfig::default(),
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AfterselfConfig,
    pub clock: Arc<TokioClock>,
    pub delivery: Arc<FakeDelivery>,
    pub runner: Arc<ScriptedRunner>,
    pub ghost: Arc<FakeGhost>,
    pub mortality: Arc<FakeMortality>,
}

impl Harness {
    /// Must be called inside a (paused) tokio runtime: the clock anchors to it.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let clock = Arc::new(TokioClock::starting_at(BASE));
        let runner = Arc::new(ScriptedRunner::new(clock.clone()));
        Self {
            dir,
            config,
            clock,
            delivery: Arc::new(FakeDelivery::default()),
            runner,
            ghost: Arc::new(FakeGhost::default()),
            mortality: Arc::new(FakeMortality::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let runner: Arc<dyn ActionRunner> = self.runner.clone();
        Collaborators {
            delivery: self.delivery.clone(),
            runners: ActionRunners {
                message: runner.clone(),
                email: runner.clone(),
                crypto_transfer: runner.clone(),
                close_account: runner.clone(),
                social_post: runner.clone(),
                custom: runner,
            },
            ghost: Some(self.ghost.clone()),
            mortality: Some(self.mortality.clone()),
        }
    }

    pub fn open_vault(&self) -> Arc<Vault> {
        Arc::new(Vault::open(&self.config.vault).unwrap())
    }

    /// Writes records straight into the vault before the switch opens it.
    pub fn seed(&self, write: impl FnOnce(&Vault)) {
        let vault = self.open_vault();
        write(&vault);
    }

    /// Persists a switch that triggered at `BASE` with `plan` stored.
    pub fn seed_triggered(&self, plan: &ActionPlan) {
        self.seed(|vault| {
            let mut record = SwitchRecord::armed(BASE);
            record.state = SwitchState::Triggered;
            record.triggered_at = Some(BASE);
            vault.put(RecordKey::SwitchState, &record).unwrap();
            vault.put_plan(plan).unwrap();
        });
    }

    /// A fresh vault handle plus a machine over it. Drop both before starting again.
    pub fn start(&self) -> (Arc<Vault>, Arc<SwitchMachine>) {
        let vault = self.open_vault();
        let machine = SwitchMachine::open(
            self.config.clone(),
            vault.clone(),
            self.collaborators(),
            self.clock.clone(),
        )
        .unwrap();
        (vault, Arc::new(machine))
    }
}

pub fn transitions(log: &[AuditEntry]) -> Vec<String> {
    log
        .iter()
        .filter(|e| e.action == "switch.transition")
        .map(|e| e.details["to"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn entries<'a>(log: &'a [AuditEntry], action: &str) -> Vec<&'a AuditEntry> {
    log.iter().filter(|e| e.action == action).collect()
}

pub async fn current_state(machine: &SwitchMachine) -> SwitchState {
    machine.state().await.unwrap().switch_state
}

/// Advances the machine, sleeping through due times, until it reaches `target`.
pub async fn drive_until(machine: &SwitchMachine, target: SwitchState) {
    for _ in 0..32 {
        if current_state(machine).await == target {
            return;
        }
        match machine.advance().await.unwrap() {
            NextStep::Now => {}
            NextStep::At(due) => tokio::time::sleep(Duration::from_millis(due.saturating_sub(machine.now()))).await,
            NextStep::Idle => break,
        }
    }
    assert_eq!(current_state(machine).await, target, "switch never reached {target}");
}

/// Runs one `advance` in the background (an escalation round or an executor run).
pub fn spawn_advance(machine: &Arc<SwitchMachine>) -> JoinHandle<afterself::Result<NextStep>> {
    let machine = Arc::clone(machine);
    tokio::spawn(async move { machine.advance().await })
}
