//! Scripted fakes shared by the starter and lifecycle test suites.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::gh::{GhApiError, ProviderApi, ProviderRunner, WorkflowRunState};
use crate::shoes::{AddResult, RunnerSpec, Shoes, ShoesError};
use crate::types::Scope;

/// A scripted [`ProviderApi`].
///
/// Registration tokens succeed with `"REGTOKEN"` unless failures are
/// queued; runner listings come from the `runners` map; removals are
/// recorded.
#[derive(Default)]
pub struct FakeProvider {
    pub runners: Mutex<HashMap<String, Vec<ProviderRunner>>>,
    /// Scopes whose `list_runners` calls fail with a transient error.
    pub broken_listings: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<(String, u64)>>,
    pub run_states: Mutex<HashMap<u64, WorkflowRunState>>,
    /// Scripted outcomes for `registration_token`, drained in order.
    pub token_script: Mutex<VecDeque<Result<String, ScriptedError>>>,
    pub token_calls: AtomicU64,
}

/// Cloneable stand-ins for [`GhApiError`] kinds in scripts.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedError {
    Transient,
    Permanent,
    NotInstalled,
}

impl ScriptedError {
    fn materialise(self) -> GhApiError {
        match self {
            ScriptedError::Transient => GhApiError::transient("scripted transient failure"),
            ScriptedError::Permanent => GhApiError::permanent("scripted permanent failure"),
            ScriptedError::NotInstalled => GhApiError::not_installed("scripted"),
        }
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_token(&self, outcome: Result<String, ScriptedError>) {
        self.token_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_runners(&self, scope: &str, runners: Vec<ProviderRunner>) {
        self.runners
            .lock()
            .unwrap()
            .insert(scope.to_string(), runners);
    }

    pub fn set_run_state(&self, run_id: u64, state: WorkflowRunState) {
        self.run_states.lock().unwrap().insert(run_id, state);
    }

    pub fn break_listing(&self, scope: &str) {
        self.broken_listings.lock().unwrap().push(scope.to_string());
    }
}

#[async_trait]
impl ProviderApi for FakeProvider {
    async fn registration_token(&self, _scope: &Scope) -> Result<String, GhApiError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        match self.token_script.lock().unwrap().pop_front() {
            None => Ok("REGTOKEN".to_string()),
            Some(Ok(token)) => Ok(token),
            Some(Err(scripted)) => Err(scripted.materialise()),
        }
    }

    async fn list_runners(&self, scope: &Scope) -> Result<Vec<ProviderRunner>, GhApiError> {
        if self
            .broken_listings
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == scope.as_str())
        {
            return Err(GhApiError::transient("scripted listing failure"));
        }
        Ok(self
            .runners
            .lock()
            .unwrap()
            .get(scope.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), GhApiError> {
        self.removed
            .lock()
            .unwrap()
            .push((scope.as_str().to_string(), runner_id));
        Ok(())
    }

    async fn workflow_run_state(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: u64,
    ) -> Result<WorkflowRunState, GhApiError> {
        self.run_states
            .lock()
            .unwrap()
            .get(&run_id)
            .copied()
            .ok_or_else(|| GhApiError::not_found(format!("run {run_id}")))
    }
}

/// A scripted [`Shoes`] backend.
///
/// `add` succeeds with sequential cloud ids (`i-001`, `i-002`, ...)
/// unless outcomes are queued; every call is recorded.
#[derive(Default)]
pub struct FakeShoes {
    pub added: Mutex<Vec<RunnerSpec>>,
    pub deleted: Mutex<Vec<String>>,
    pub add_script: Mutex<VecDeque<Result<AddResult, ShoesError>>>,
    pub delete_script: Mutex<VecDeque<Result<(), ShoesError>>>,
    next_instance: AtomicU64,
}

impl FakeShoes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_add(&self, outcome: Result<AddResult, ShoesError>) {
        self.add_script.lock().unwrap().push_back(outcome);
    }

    pub fn script_delete(&self, outcome: Result<(), ShoesError>) {
        self.delete_script.lock().unwrap().push_back(outcome);
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Shoes for FakeShoes {
    async fn add(&self, spec: &RunnerSpec) -> Result<AddResult, ShoesError> {
        let scripted = self.add_script.lock().unwrap().pop_front();
        let result = match scripted {
            Some(outcome) => outcome,
            None => {
                let n = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(AddResult {
                    cloud_id: format!("i-{n:03}"),
                    ip_address: Some("192.0.2.10".to_string()),
                    shoes_type: "shoes-fake".to_string(),
                })
            }
        };
        if result.is_ok() {
            self.added.lock().unwrap().push(spec.clone());
        }
        result
    }

    async fn delete(&self, cloud_id: &str) -> Result<(), ShoesError> {
        let scripted = self.delete_script.lock().unwrap().pop_front();
        let result = scripted.unwrap_or(Ok(()));
        if result.is_ok() {
            self.deleted.lock().unwrap().push(cloud_id.to_string());
        }
        result
    }
}
