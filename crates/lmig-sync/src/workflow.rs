//! Document workflow gate: a locked target row refuses new writes.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} {target_id} is locked for `{verb}` (workflow state `{state}`)")]
pub struct WorkflowLocked {
    pub entity_type: String,
    pub target_id: Uuid,
    pub verb: String,
    pub state: String,
}

/// Precondition consulted by the load stage before a target row is mutated.
pub trait EditWindowCheck: Send + Sync {
    fn check_edit_window(
        &self,
        entity_type: &str,
        target_id: Uuid,
        verb: &str,
    ) -> Result<(), WorkflowLocked>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenEditWindow;

impl EditWindowCheck for OpenEditWindow {
    fn check_edit_window(&self, _: &str, _: Uuid, _: &str) -> Result<(), WorkflowLocked> {
        Ok(())
    }
}

/// Fixed set of target rows sitting in a non-editable workflow state.
#[derive(Debug, Clone, Default)]
pub struct LockedDocuments {
    locked: HashMap<(String, Uuid), String>,
    exempt_verbs: BTreeSet<String>,
}

impl LockedDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(mut self, entity_type: &str, target_id: Uuid, state: &str) -> Self {
        self.locked
            .insert((entity_type.to_string(), target_id), state.to_string());
        self
    }

    /// Verbs that may touch a locked row anyway, e.g. `annotate`.
    pub fn exempt_verb(mut self, verb: &str) -> Self {
        self.exempt_verbs.insert(verb.to_string());
        self
    }
}

impl EditWindowCheck for LockedDocuments {
    fn check_edit_window(
        &self,
        entity_type: &str,
        target_id: Uuid,
        verb: &str,
    ) -> Result<(), WorkflowLocked> {
        if self.exempt_verbs.contains(verb) {
            return Ok(());
        }
        match self.locked.get(&(entity_type.to_string(), target_id)) {
            Some(state) => Err(WorkflowLocked {
                entity_type: entity_type.to_string(),
                target_id,
                verb: verb.to_string(),
                state: state.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_rows_reject_all_but_exempt_verbs() {
        let id = Uuid::new_v4();
        let gate = LockedDocuments::new()
            .lock("invoice", id, "approved")
            .exempt_verb("annotate");

        let err = gate.check_edit_window("invoice", id, "migrate").unwrap_err();
        assert_eq!(err.state, "approved");
        assert!(err.to_string().contains("approved"));
        assert!(gate.check_edit_window("invoice", id, "annotate").is_ok());
        assert!(gate.check_edit_window("invoice", Uuid::new_v4(), "migrate").is_ok());
        assert!(gate.check_edit_window("customer", id, "migrate").is_ok());
        assert!(OpenEditWindow.check_edit_window("invoice", id, "migrate").is_ok());
    }
}
