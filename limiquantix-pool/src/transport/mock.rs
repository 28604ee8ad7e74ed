//! In-memory pool endpoint for testing and development.
//!
//! Simulates a pool of hosts with one master, a VM inventory, async tasks and
//! sessions. Faults can be queued per method to drive the retry, redirect and
//! reauthentication paths, and every login/call is recorded so tests can
//! assert on exactly what reached the "remote" side.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{PoolTransport, RpcResult};
use crate::error::{RpcFault, HANDLE_INVALID};
use crate::types::SessionRef;

/// Wildcard key for [`MockPoolTransport::inject_fault`].
pub const ANY_METHOD: &str = "*";

/// Scripted behaviour for tasks created by `Async.*` calls.
#[derive(Debug, Clone)]
pub enum TaskScript {
    /// Report `pending` for `polls` status queries, then `success`.
    Succeed { polls: u32, result: String },
    /// Report `pending` for `polls` status queries, then `failure`.
    Fail { polls: u32, error_info: Vec<String> },
    /// Never leave `pending`.
    Hang,
    /// Handle becomes invalid after `polls` status queries.
    Vanish { polls: u32 },
}

impl Default for TaskScript {
    fn default() -> Self {
        Self::Succeed { polls: 0, result: String::new() }
    }
}

/// One recorded login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAttempt {
    pub address: String,
    pub username: String,
    pub password: String,
}

struct MockHost {
    uuid: String,
    reference: String,
    address: String,
}

struct MockVm {
    reference: String,
    uuid: String,
    host: Option<String>,
    power_state: String,
    is_template: bool,
    is_snapshot: bool,
    is_control_domain: bool,
}

struct MockTask {
    method: String,
    script: TaskScript,
    polls: u32,
    cancel_requested: bool,
}

#[derive(Default)]
struct MockState {
    username: String,
    password: String,
    master_address: String,
    hosts: BTreeMap<String, MockHost>,
    vms: BTreeMap<String, MockVm>,
    sessions: HashSet<String>,
    tasks: HashMap<String, MockTask>,
    task_scripts: HashMap<String, TaskScript>,
    faults: HashMap<String, VecDeque<RpcFault>>,
    login_faults: VecDeque<RpcFault>,
    point_states: HashMap<String, VecDeque<String>>,
    plugin_responses: HashMap<(String, String), String>,
    login_log: Vec<LoginAttempt>,
    call_log: Vec<String>,
    destroyed: HashMap<String, u32>,
    cancelled: HashMap<String, u32>,
    last_task: Option<String>,
    counter: u64,
}

impl MockState {
    fn next_ref(&mut self, kind: &str) -> String {
        self.counter += 1;
        format!("OpaqueRef:{}-{}", kind, self.counter)
    }

    fn host_by_ref(&self, reference: &str) -> Option<&MockHost> {
        self.hosts.values().find(|h| h.reference == reference)
    }

    fn host_ref_for_uuid(&self, uuid: &str) -> Option<String> {
        self.hosts.values().find(|h| h.uuid == uuid).map(|h| h.reference.clone())
    }

    fn vm_by_ref(&self, reference: &str) -> Option<(&String, &MockVm)> {
        self.vms.iter().find(|(_, vm)| vm.reference == reference)
    }

    fn take_fault(&mut self, method: &str) -> Option<RpcFault> {
        for key in [method, ANY_METHOD] {
            if let Some(queue) = self.faults.get_mut(key) {
                if let Some(fault) = queue.pop_front() {
                    return Some(fault);
                }
            }
        }
        None
    }
}

/// In-memory simulated pool endpoint.
pub struct MockPoolTransport {
    state: Mutex<MockState>,
}

impl MockPoolTransport {
    /// Create a pool whose master listens on `master_address` and accepts
    /// exactly `username`/`password`.
    pub fn new(
        master_address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let master_address = master_address.into();
        info!(master = %master_address, "Creating mock pool endpoint");

        let mock = Self {
            state: Mutex::new(MockState {
                username: username.into(),
                password: password.into(),
                master_address: master_address.clone(),
                ..Default::default()
            }),
        };
        mock.add_host(&master_address);
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not cascade into unrelated assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Add a member host reachable at `address`. Returns its UUID.
    pub fn add_host(&self, address: &str) -> String {
        let mut state = self.state();
        if let Some(host) = state.hosts.get(address) {
            return host.uuid.clone();
        }
        let uuid = Uuid::new_v4().to_string();
        let reference = format!("OpaqueRef:{}", uuid);
        state.hosts.insert(address.to_string(), MockHost {
            uuid: uuid.clone(),
            reference,
            address: address.to_string(),
        });
        uuid
    }

    /// UUID of the host at `address`.
    pub fn host_uuid(&self, address: &str) -> Option<String> {
        self.state().hosts.get(address).map(|h| h.uuid.clone())
    }

    /// Move the master role to another (already added) host.
    pub fn set_master(&self, address: &str) {
        let mut state = self.state();
        debug!(master = %address, "Mock pool master changed");
        state.master_address = address.to_string();
    }

    /// Change the accepted password.
    pub fn set_password(&self, password: &str) {
        self.state().password = password.to_string();
    }

    // =========================================================================
    // VM inventory
    // =========================================================================

    /// Add a VM resident on the host with UUID `host_uuid`. Returns its UUID.
    pub fn add_vm(&self, name: &str, host_uuid: Option<&str>, power_state: &str) -> String {
        let mut state = self.state();
        let uuid = Uuid::new_v4().to_string();
        let reference = state.next_ref("vm");
        state.vms.insert(name.to_string(), MockVm {
            reference,
            uuid: uuid.clone(),
            host: host_uuid.map(str::to_string),
            power_state: power_state.to_string(),
            is_template: false,
            is_snapshot: false,
            is_control_domain: false,
        });
        uuid
    }

    /// Add a template (never reported by scans).
    pub fn add_template(&self, name: &str) {
        self.add_vm(name, None, "Halted");
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.is_template = true;
        }
    }

    /// Add a snapshot pseudo-VM.
    pub fn add_snapshot(&self, name: &str) {
        self.add_vm(name, None, "Halted");
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.is_snapshot = true;
        }
    }

    /// Add a control domain on a host.
    pub fn add_control_domain(&self, name: &str, host_uuid: &str) {
        self.add_vm(name, Some(host_uuid), "Running");
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.is_control_domain = true;
        }
    }

    pub fn set_vm_power_state(&self, name: &str, power_state: &str) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.power_state = power_state.to_string();
        }
    }

    pub fn set_vm_host(&self, name: &str, host_uuid: Option<&str>) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.host = host_uuid.map(str::to_string);
        }
    }

    pub fn remove_vm(&self, name: &str) {
        self.state().vms.remove(name);
    }

    /// Answers for successive `VM.get_power_state` queries on `name`,
    /// overriding the inventory until exhausted.
    pub fn set_point_power_states(&self, name: &str, states: &[&str]) {
        self.state().point_states.insert(
            name.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    // =========================================================================
    // Faults, tasks, plugins
    // =========================================================================

    /// Queue a fault for the next call to `method` ([`ANY_METHOD`] matches all).
    pub fn inject_fault(&self, method: &str, fault: RpcFault) {
        self.state()
            .faults
            .entry(method.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Queue a fault for the next login attempt.
    pub fn inject_login_fault(&self, fault: RpcFault) {
        self.state().login_faults.push_back(fault);
    }

    /// Invalidate every session issued so far.
    pub fn invalidate_sessions(&self) {
        self.state().sessions.clear();
    }

    /// Script tasks created by `Async.{method}`; `method` excludes the prefix.
    pub fn set_task_script(&self, method: &str, script: TaskScript) {
        self.state().task_scripts.insert(method.to_string(), script);
    }

    pub fn set_plugin_response(&self, plugin: &str, function: &str, response: &str) {
        self.state().plugin_responses.insert(
            (plugin.to_string(), function.to_string()),
            response.to_string(),
        );
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    pub fn login_attempts(&self) -> Vec<LoginAttempt> {
        self.state().login_log.clone()
    }

    /// Number of calls made to `method`, including failed ones.
    pub fn call_count(&self, method: &str) -> usize {
        self.state().call_log.iter().filter(|m| m.as_str() == method).count()
    }

    pub fn destroy_count(&self, task: &str) -> u32 {
        self.state().destroyed.get(task).copied().unwrap_or(0)
    }

    pub fn cancel_count(&self, task: &str) -> u32 {
        self.state().cancelled.get(task).copied().unwrap_or(0)
    }

    /// Most recently created task reference.
    pub fn last_task(&self) -> Option<String> {
        self.state().last_task.clone()
    }

    /// Tasks created but not yet destroyed.
    pub fn live_task_count(&self) -> usize {
        self.state().tasks.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.state().sessions.len()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn dispatch(state: &mut MockState, method: &str, args: &[Value]) -> RpcResult<Value> {
        if let Some(inner) = method.strip_prefix("Async.") {
            let script = state.task_scripts.get(inner).cloned().unwrap_or_default();
            let reference = state.next_ref("task");
            state.tasks.insert(reference.clone(), MockTask {
                method: inner.to_string(),
                script,
                polls: 0,
                cancel_requested: false,
            });
            state.last_task = Some(reference.clone());
            return Ok(json!(reference));
        }

        match method {
            "session.get_this_host" => {
                let master = state.master_address.clone();
                let host = state.hosts.get(&master).ok_or_else(|| internal("master host missing"))?;
                Ok(json!(host.reference))
            }
            "pool.get_all" => Ok(json!(["OpaqueRef:pool-0"])),
            "pool.get_master" => {
                let master = state.master_address.clone();
                let host = state.hosts.get(&master).ok_or_else(|| internal("master host missing"))?;
                Ok(json!(host.reference))
            }
            "host.get_uuid" => {
                let reference = string_arg(args, 0)?;
                state
                    .host_by_ref(&reference)
                    .map(|h| json!(h.uuid))
                    .ok_or_else(|| RpcFault::api(HANDLE_INVALID, vec!["host".into(), reference]))
            }
            "host.get_all_records" => {
                let records: Map<String, Value> = state
                    .hosts
                    .values()
                    .map(|h| {
                        (h.reference.clone(), json!({
                            "uuid": h.uuid,
                            "address": h.address,
                            "name_label": h.address,
                        }))
                    })
                    .collect();
                Ok(Value::Object(records))
            }
            "VM.get_all_records" => {
                let mut records = Map::new();
                for (name, vm) in &state.vms {
                    let resident_on = vm
                        .host
                        .as_deref()
                        .and_then(|uuid| state.host_ref_for_uuid(uuid))
                        .unwrap_or_else(|| "OpaqueRef:NULL".to_string());
                    records.insert(vm.reference.clone(), json!({
                        "uuid": vm.uuid,
                        "name_label": name,
                        "power_state": vm.power_state,
                        "resident_on": resident_on,
                        "is_a_template": vm.is_template,
                        "is_a_snapshot": vm.is_snapshot,
                        "is_control_domain": vm.is_control_domain,
                    }));
                }
                Ok(Value::Object(records))
            }
            "VM.get_by_name_label" => {
                let name = string_arg(args, 0)?;
                let refs: Vec<&str> = state
                    .vms
                    .get(&name)
                    .map(|vm| vec![vm.reference.as_str()])
                    .unwrap_or_default();
                Ok(json!(refs))
            }
            "VM.get_power_state" => {
                let reference = string_arg(args, 0)?;
                let (name, power) = match state.vm_by_ref(&reference) {
                    Some((name, vm)) => (name.clone(), vm.power_state.clone()),
                    None => return Err(RpcFault::api(HANDLE_INVALID, vec!["VM".into(), reference])),
                };
                let overridden = state.point_states.get_mut(&name).and_then(VecDeque::pop_front);
                Ok(json!(overridden.unwrap_or(power)))
            }
            "task.get_status" => {
                let reference = string_arg(args, 0)?;
                let task = state
                    .tasks
                    .get_mut(&reference)
                    .ok_or_else(|| RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference.clone()]))?;
                task.polls += 1;
                let seen = task.polls;
                let status = match task.script {
                    TaskScript::Succeed { polls, .. } if seen > polls => Some("success"),
                    TaskScript::Fail { polls, .. } if seen > polls => Some("failure"),
                    TaskScript::Vanish { polls } if seen > polls => None,
                    _ if task.cancel_requested => Some("cancelling"),
                    _ => Some("pending"),
                };
                match status {
                    Some(status) => Ok(json!(status)),
                    None => {
                        state.tasks.remove(&reference);
                        Err(RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference]))
                    }
                }
            }
            "task.get_result" => {
                let reference = string_arg(args, 0)?;
                match state.tasks.get(&reference).map(|t| &t.script) {
                    Some(TaskScript::Succeed { result, .. }) => Ok(json!(result)),
                    Some(_) => Ok(json!("")),
                    None => Err(RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference])),
                }
            }
            "task.get_error_info" => {
                let reference = string_arg(args, 0)?;
                match state.tasks.get(&reference) {
                    Some(MockTask { script: TaskScript::Fail { error_info, .. }, .. }) => {
                        Ok(json!(error_info))
                    }
                    Some(_) => Ok(json!([])),
                    None => Err(RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference])),
                }
            }
            "task.cancel" => {
                let reference = string_arg(args, 0)?;
                *state.cancelled.entry(reference.clone()).or_default() += 1;
                match state.tasks.get_mut(&reference) {
                    Some(task) => {
                        task.cancel_requested = true;
                        Ok(Value::Null)
                    }
                    None => Err(RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference])),
                }
            }
            "task.destroy" => {
                let reference = string_arg(args, 0)?;
                *state.destroyed.entry(reference.clone()).or_default() += 1;
                match state.tasks.remove(&reference) {
                    Some(task) => {
                        debug!(task = %reference, method = %task.method, "Mock task destroyed");
                        Ok(Value::Null)
                    }
                    None => Err(RpcFault::api(HANDLE_INVALID, vec!["task".into(), reference])),
                }
            }
            "host.call_plugin" => {
                let host = string_arg(args, 0)?;
                if state.host_by_ref(&host).is_none() {
                    return Err(RpcFault::api(HANDLE_INVALID, vec!["host".into(), host]));
                }
                let plugin = string_arg(args, 1)?;
                let function = string_arg(args, 2)?;
                state
                    .plugin_responses
                    .get(&(plugin.clone(), function.clone()))
                    .map(|r| json!(r))
                    .ok_or_else(|| RpcFault::api("XENAPI_MISSING_PLUGIN", vec![plugin, function]))
            }
            other => Err(RpcFault::Client(format!("MESSAGE_METHOD_UNKNOWN {}", other))),
        }
    }
}

#[async_trait]
impl PoolTransport for MockPoolTransport {
    async fn login(
        &self,
        address: &str,
        username: &str,
        password: &str,
        _api_version: &str,
    ) -> RpcResult<SessionRef> {
        let mut state = self.state();
        state.login_log.push(LoginAttempt {
            address: address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });

        if let Some(fault) = state.login_faults.pop_front() {
            return Err(fault);
        }
        if !state.hosts.contains_key(address) {
            return Err(RpcFault::Transient(format!("connection refused: {}", address)));
        }
        if address != state.master_address {
            return Err(RpcFault::HostIsSlave(state.master_address.clone()));
        }
        if username != state.username || password != state.password {
            return Err(RpcFault::AuthenticationFailed);
        }

        let session = state.next_ref("session");
        state.sessions.insert(session.clone());
        Ok(SessionRef(session))
    }

    async fn logout(&self, _address: &str, session: &SessionRef) -> RpcResult<()> {
        self.state().sessions.remove(session.as_str());
        Ok(())
    }

    async fn call(
        &self,
        address: &str,
        session: &SessionRef,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value> {
        let mut state = self.state();
        state.call_log.push(method.to_string());

        if let Some(fault) = state.take_fault(method) {
            if fault == RpcFault::SessionInvalid {
                state.sessions.remove(session.as_str());
            }
            return Err(fault);
        }
        if !state.hosts.contains_key(address) {
            return Err(RpcFault::Transient(format!("connection refused: {}", address)));
        }
        if address != state.master_address {
            return Err(RpcFault::HostIsSlave(state.master_address.clone()));
        }
        if !state.sessions.contains(session.as_str()) {
            return Err(RpcFault::SessionInvalid);
        }

        Self::dispatch(&mut state, method, &args)
    }
}

fn string_arg(args: &[Value], index: usize) -> RpcResult<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcFault::Client(format!("MESSAGE_PARAMETER_COUNT_MISMATCH at {}", index)))
}

fn internal(reason: &str) -> RpcFault {
    RpcFault::api("INTERNAL_ERROR", vec![reason.to_string()])
}
