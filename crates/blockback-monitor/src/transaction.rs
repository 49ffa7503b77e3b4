//! Atomic multi-action batches.
//!
//! A transaction is a sequence of `{type, data}` actions submitted as one
//! `transaction` command; the protocol guarantees all-or-nothing commit.
//! Building an action normalizes its field names against the resolved form
//! of the verb: stable verbs take unmarked fields (marked spellings are
//! stripped, null values dropped), experimental verbs take the marked
//! spelling of the fields the registry lists.

use crate::command::{CommandForm, ResolvedCommand};
use crate::error::{MonitorError, Result};
use crate::Monitor;
use serde::Serialize;
use serde_json::{Map, Value};

/// One action inside an atomic batch.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionAction {
    /// Concrete verb, as resolved by the negotiator.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Normalized argument object.
    pub data: Map<String, Value>,
}

impl TransactionAction {
    /// Builds an action for a resolved command, normalizing field names to
    /// match the verb's form.
    #[must_use]
    pub fn build(command: &ResolvedCommand, data: Map<String, Value>) -> Self {
        let data = match command.form {
            CommandForm::Stable => normalize_stable(&command.prefix, data),
            CommandForm::Experimental => {
                normalize_experimental(&command.prefix, command.experimental_fields, data)
            }
        };
        Self {
            action_type: command.verb.clone(),
            data,
        }
    }

    /// Builds an action from a typed request body.
    ///
    /// Fails if the request does not serialize to an object.
    pub fn from_request<T: Serialize>(command: &ResolvedCommand, request: &T) -> Result<Self> {
        let value =
            serde_json::to_value(request).map_err(|e| MonitorError::protocol(e.to_string()))?;
        let Value::Object(data) = value else {
            return Err(MonitorError::protocol(format!(
                "transaction action for '{}' must be an object",
                command.verb
            )));
        };
        Ok(Self::build(command, data))
    }
}

/// Stable verbs take unmarked field names: drop null values and strip the
/// experimental marker from any marked keys.
fn normalize_stable(prefix: &str, data: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(data.len());
    for (key, value) in data {
        if value.is_null() {
            continue;
        }
        match key.strip_prefix(prefix) {
            Some(stripped) => out.insert(stripped.to_string(), value),
            None => out.insert(key, value),
        };
    }
    out
}

/// Experimental verbs take the marked spelling of the registered optional
/// fields.
fn normalize_experimental(
    prefix: &str,
    fields: &[&str],
    data: Map<String, Value>,
) -> Map<String, Value> {
    let mut out = Map::with_capacity(data.len());
    for (key, value) in data {
        if fields.contains(&key.as_str()) {
            out.insert(format!("{prefix}{key}"), value);
        } else {
            out.insert(key, value);
        }
    }
    out
}

/// An atomic batch of actions.
#[derive(Debug, Default)]
pub struct Transaction {
    actions: Vec<TransactionAction>,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action.
    pub fn push(&mut self, action: TransactionAction) {
        self.actions.push(action);
    }

    /// Number of accumulated actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true when no actions have been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Submits the batch as one atomic `transaction` command.
    pub async fn submit(self, monitor: &dyn Monitor) -> Result<()> {
        let actions =
            serde_json::to_value(&self.actions).map_err(|e| MonitorError::protocol(e.to_string()))?;
        let mut args = Map::new();
        args.insert("actions".to_string(), actions);
        monitor.send("transaction", Value::Object(args)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stable(verb: &str) -> ResolvedCommand {
        ResolvedCommand {
            verb: verb.to_string(),
            form: CommandForm::Stable,
            prefix: "x-".to_string(),
            experimental_fields: &[],
        }
    }

    fn experimental(verb: &str, fields: &'static [&'static str]) -> ResolvedCommand {
        ResolvedCommand {
            verb: format!("x-{verb}"),
            form: CommandForm::Experimental,
            prefix: "x-".to_string(),
            experimental_fields: fields,
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn test_stable_action_strips_marked_keys_and_nulls() {
        let cmd = stable("block-dirty-bitmap-add");
        let data = object(serde_json::json!({
            "node": "d0",
            "name": "b1",
            "x-disabled": true,
            "persistent": null,
        }));
        let action = TransactionAction::build(&cmd, data);
        assert_eq!(action.action_type, "block-dirty-bitmap-add");
        assert_eq!(action.data["disabled"], true);
        assert!(!action.data.contains_key("x-disabled"));
        assert!(!action.data.contains_key("persistent"));
    }

    #[test]
    fn test_experimental_action_promotes_registered_fields() {
        let cmd = experimental("block-dirty-bitmap-add", &["disabled"]);
        let data = object(serde_json::json!({
            "node": "d0",
            "name": "b1",
            "disabled": true,
        }));
        let action = TransactionAction::build(&cmd, data);
        assert_eq!(action.action_type, "x-block-dirty-bitmap-add");
        assert_eq!(action.data["x-disabled"], true);
        assert!(!action.data.contains_key("disabled"));
        assert_eq!(action.data["node"], "d0");
    }

    #[test]
    fn test_action_serializes_with_type_and_data() {
        let cmd = stable("blockdev-backup");
        let data = object(serde_json::json!({"device": "d0", "target": "t0", "sync": "full"}));
        let action = TransactionAction::build(&cmd, data);
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "blockdev-backup");
        assert_eq!(value["data"]["sync"], "full");
    }

    #[test]
    fn test_from_request_rejects_non_object() {
        let cmd = stable("blockdev-backup");
        let err = TransactionAction::from_request(&cmd, &"scalar").unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }
}
