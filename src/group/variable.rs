//! Group-scoped variables
//!
//! Each member keeps its own copy of every variable. An update bumps the
//! version, applies locally and is pushed to every other member. Concurrent
//! updates resolve by `(version, origin worker id)`, higher wins, so every
//! member converges on the same value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::peer::WorkerId;

use super::channel::{Channel, Confirm, GroupOutcome};
use super::frame::RequestKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub value: Value,
    pub version: u64,
    pub origin: WorkerId,
}

impl VariableState {
    pub fn supersedes(&self, other: &VariableState) -> bool {
        (self.version, self.origin) > (other.version, other.origin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariableUpdate {
    name: String,
    state: VariableState,
}

impl Channel {
    /// Current local value of a variable
    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.inner
            .variables
            .lock()
            .get(name)
            .map(|state| state.value.clone())
    }

    /// Current local value with its version
    pub fn variable(&self, name: &str) -> Option<VariableState> {
        self.inner.variables.lock().get(name).cloned()
    }

    /// Set a variable and push it to every other member.
    ///
    /// The new value is visible to local reads right away; the outcome lists
    /// the members that stored it.
    pub async fn update_value(&self, name: &str, value: Value) -> Result<GroupOutcome> {
        let state = {
            let mut variables = self.inner.variables.lock();
            let version = variables.get(name).map(|s| s.version).unwrap_or(0) + 1;
            let state = VariableState {
                value,
                version,
                origin: self.my_worker_id(),
            };
            variables.insert(name.to_string(), state.clone());
            state
        };

        let update = VariableUpdate {
            name: name.to_string(),
            state,
        };
        let payload = serde_json::to_value(&update)?;
        let targets = self.remote_members();
        let outcome = self
            .fan_out(&targets, RequestKind::Variable, payload, |_, result| match result {
                Ok(answer) => {
                    // A member may already hold a newer write; adopt it
                    if let Ok(theirs) = serde_json::from_value::<VariableState>(answer) {
                        self.store_if_newer(name, theirs);
                    }
                    Confirm::Finished
                }
                Err(_) => Confirm::Failed,
            })
            .await;
        Ok(outcome)
    }

    fn store_if_newer(&self, name: &str, candidate: VariableState) -> VariableState {
        let mut variables = self.inner.variables.lock();
        match variables.get(name) {
            Some(current) if !candidate.supersedes(current) => current.clone(),
            _ => {
                variables.insert(name.to_string(), candidate.clone());
                candidate
            }
        }
    }

    /// Apply an update from another member; answers with the state now held
    pub(crate) fn serve_variable(&self, payload: Value) -> Result<Value> {
        let update: VariableUpdate = serde_json::from_value(payload)?;
        debug!(
            channel = %self.id(),
            name = %update.name,
            version = update.state.version,
            origin = update.state.origin,
            "Variable update"
        );
        let held = self.store_if_newer(&update.name, update.state);
        Ok(serde_json::to_value(held)?)
    }
}
