//! Scripted in-memory driver for tests.
//!
//! Every call is recorded. Plan, apply and destroy pop the next scripted
//! outcome for that operation and succeed when nothing is queued; outputs are
//! synthesised from the members declared at `create` time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::DeploymentConfig;
use crate::error::{DriverError, Result};
use crate::{DriverOutcome, ProvisioningDriver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Create(String),
    Plan(String),
    Apply(String),
    Destroy(String),
    Outputs(String),
    StripStaleReference { id: String, address: String },
}

impl DriverCall {
    pub fn op(&self) -> &'static str {
        match self {
            DriverCall::Create(_) => "create",
            DriverCall::Plan(_) => "plan",
            DriverCall::Apply(_) => "apply",
            DriverCall::Destroy(_) => "destroy",
            DriverCall::Outputs(_) => "outputs",
            DriverCall::StripStaleReference { .. } => "strip",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DriverCall::Create(id)
            | DriverCall::Plan(id)
            | DriverCall::Apply(id)
            | DriverCall::Destroy(id)
            | DriverCall::Outputs(id)
            | DriverCall::StripStaleReference { id, .. } => id,
        }
    }
}

#[derive(Default)]
struct Script {
    creates: VecDeque<Option<String>>,
    plans: VecDeque<DriverOutcome>,
    applies: VecDeque<DriverOutcome>,
    destroys: VecDeque<DriverOutcome>,
    destroys_by_id: HashMap<String, VecDeque<DriverOutcome>>,
    strip_error: Option<String>,
    outputs_error: Option<String>,
    missing_outputs: HashSet<String>,
    deployments: HashMap<String, DeploymentConfig>,
    calls: Vec<DriverCall>,
    call_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockDriver {
    script: Mutex<Script>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a result for the next `create`; `None` succeeds.
    pub fn push_create_failure(&self, message: &str) -> &Self {
        self.script().creates.push_back(Some(message.to_string()));
        self
    }

    pub fn push_create_success(&self) -> &Self {
        self.script().creates.push_back(None);
        self
    }

    pub fn push_plan(&self, outcome: DriverOutcome) -> &Self {
        self.script().plans.push_back(outcome);
        self
    }

    pub fn push_apply(&self, outcome: DriverOutcome) -> &Self {
        self.script().applies.push_back(outcome);
        self
    }

    /// Queue a result for the next `destroy` of any id not scripted with
    /// [`MockDriver::push_destroy_for`].
    pub fn push_destroy(&self, outcome: DriverOutcome) -> &Self {
        self.script().destroys.push_back(outcome);
        self
    }

    pub fn push_destroy_for(&self, id: &str, outcome: DriverOutcome) -> &Self {
        self.script()
            .destroys_by_id
            .entry(id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn fail_strip(&self, message: &str) -> &Self {
        self.script().strip_error = Some(message.to_string());
        self
    }

    pub fn fail_outputs(&self, message: &str) -> &Self {
        self.script().outputs_error = Some(message.to_string());
        self
    }

    /// The deployment will export nothing for this member.
    pub fn omit_outputs_for(&self, member_id: &str) -> &Self {
        self.script().missing_outputs.insert(member_id.to_string());
        self
    }

    /// Every call sleeps this long on the calling thread first.
    pub fn set_call_delay(&self, delay: Duration) -> &Self {
        self.script().call_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.script().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.script().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn deployment(&self, id: &str) -> Option<DeploymentConfig> {
        self.script().deployments.get(id).cloned()
    }

    fn record(&self, call: DriverCall) {
        let delay = {
            let mut script = self.script();
            script.calls.push(call);
            script.call_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }
}

impl ProvisioningDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(&self, id: &str, config: &DeploymentConfig) -> Result<()> {
        self.record(DriverCall::Create(id.to_string()));
        let mut script = self.script();
        if let Some(Some(message)) = script.creates.pop_front() {
            return Err(DriverError::Command {
                command: format!("create {id}"),
                output: message,
            });
        }
        script.deployments.insert(id.to_string(), config.clone());
        Ok(())
    }

    fn plan(&self, id: &str) -> DriverOutcome {
        self.record(DriverCall::Plan(id.to_string()));
        self.script()
            .plans
            .pop_front()
            .unwrap_or_else(|| DriverOutcome::success(format!("Plan for {id}: ok")))
    }

    fn apply(&self, id: &str) -> DriverOutcome {
        self.record(DriverCall::Apply(id.to_string()));
        self.script()
            .applies
            .pop_front()
            .unwrap_or_else(|| DriverOutcome::success(format!("Apply complete for {id}")))
    }

    fn destroy(&self, id: &str) -> DriverOutcome {
        self.record(DriverCall::Destroy(id.to_string()));
        let mut script = self.script();
        let for_id = script
            .destroys_by_id
            .get_mut(id)
            .and_then(|queue| queue.pop_front());
        for_id
            .or_else(|| script.destroys.pop_front())
            .unwrap_or_else(|| DriverOutcome::success(format!("Destroy complete for {id}")))
    }

    fn outputs(&self, id: &str) -> Result<BTreeMap<String, String>> {
        self.record(DriverCall::Outputs(id.to_string()));
        let script = self.script();
        if let Some(message) = &script.outputs_error {
            return Err(DriverError::Command {
                command: format!("outputs {id}"),
                output: message.clone(),
            });
        }
        let config = script
            .deployments
            .get(id)
            .ok_or_else(|| DriverError::UnknownWorkspace(id.to_string()))?;

        let mut outputs = BTreeMap::new();
        for member in &config.members {
            if script.missing_outputs.contains(&member.member_id) {
                continue;
            }
            let m = &member.member_id;
            outputs.insert(format!("{m}.project_id"), format!("proj-{m}"));
            outputs.insert(format!("{m}.access_key"), format!("key-{m}"));
        }
        Ok(outputs)
    }

    fn strip_stale_reference(&self, id: &str, resource_address: &str) -> Result<()> {
        self.record(DriverCall::StripStaleReference {
            id: id.to_string(),
            address: resource_address.to_string(),
        });
        match &self.script().strip_error {
            Some(message) => Err(DriverError::Command {
                command: format!("state rm {resource_address}"),
                output: message.clone(),
            }),
            None => Ok(()),
        }
    }
}
