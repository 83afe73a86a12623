//! Per-device state registry.
//! Routes inbound payloads to every registered state, fans writes out by
//! state name, and drains the command and clear queues for the transport
//! and presentation collaborators.

use crate::state::{AnyState, ClearEvent, CommandId, QueuedCommand};
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A device's named capability states.
///
/// Created once from discovery metadata and kept for the device's lifetime;
/// the device identity itself is an opaque handle to this engine.
pub struct Device {
    id: String,
    states: BTreeMap<String, Box<dyn AnyState>>,
    aliases: HashMap<String, String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a state under its own name.
    pub fn add_state(&mut self, state: Box<dyn AnyState>) -> &mut Self {
        let name = state.name().to_string();
        if self.states.insert(name.clone(), state).is_some() {
            warn!("Device {}: state '{}' replaced", self.id, name);
        }
        self
    }

    /// Expose an existing state under an additional name.
    pub fn alias_state(&mut self, alias: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.aliases.insert(alias.into(), name.into());
        self
    }

    fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn state(&self, name: &str) -> Option<&dyn AnyState> {
        self.states.get(self.canonical(name)).map(|state| &**state)
    }

    pub fn state_mut(&mut self, name: &str) -> Option<&mut (dyn AnyState + 'static)> {
        let canonical = self.canonical(name).to_string();
        self.states.get_mut(&canonical).map(move |state| &mut **state)
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.states.keys().map(String::as_str).collect()
    }

    /// Write a value to a named state. Unknown names and rejected writes
    /// both yield an empty id list.
    pub fn set_state(&mut self, name: &str, next: &Value) -> Vec<CommandId> {
        match self.state_mut(name) {
            Some(state) => state.set_state_json(next),
            None => {
                debug!("Device {}: write to unknown state '{}'", self.id, name);
                Vec::new()
            }
        }
    }

    /// Rewind a named state's value locally.
    pub fn previous_state(&mut self, name: &str, n: usize) -> Vec<CommandId> {
        self.state_mut(name)
            .map(|state| state.previous_state(n))
            .unwrap_or_default()
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.state(name).map(|state| state.value_json())
    }

    /// Hand one flattened payload to every state and return the names whose
    /// value changed.
    pub fn parse(&mut self, payload: &Value) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, state) in self.states.iter_mut() {
            let before = state.value_json();
            state.parse(payload);
            if state.value_json() != before {
                changed.push(name.clone());
            }
        }
        changed
    }

    /// Collect every queued command across all states, oldest first per
    /// state.
    pub fn drain_commands(&mut self) -> Vec<QueuedCommand> {
        self.states
            .values_mut()
            .flat_map(|state| state.drain_commands())
            .collect()
    }

    /// Collect every emitted clear event across all states.
    pub fn drain_clear_events(&mut self) -> Vec<ClearEvent> {
        self.states
            .values_mut()
            .flat_map(|state| state.drain_clear_events())
            .collect()
    }

    /// Route a command expiry to whichever state still holds it pending.
    pub fn expire_command(&mut self, command_id: CommandId) -> bool {
        self.states
            .values_mut()
            .any(|state| state.expire_command(command_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StateCatalog;
    use crate::states::{BrightnessState, HumidityState, PowerState};
    use serde_json::json;

    fn catalog() -> StateCatalog {
        StateCatalog::from_value(json!({
            "states": [
                {
                    "state_name": "power",
                    "op_type": "0xAA",
                    "status_opcode": "0x01",
                    "command_opcode": "0x33",
                },
                {
                    "state_name": "brightness",
                    "op_type": "0xAA",
                    "status_opcode": "0x04",
                    "command_opcode": "0x33",
                    "range": {"min": 0, "max": 100},
                },
            ]
        }))
        .unwrap()
    }

    fn device() -> Device {
        let catalog = catalog();
        let mut device = Device::new("device-42");
        device
            .add_state(Box::new(PowerState::from_catalog(&catalog).unwrap()))
            .add_state(Box::new(BrightnessState::from_catalog(&catalog).unwrap()))
            .add_state(Box::new(HumidityState::sensor()))
            .alias_state("isOn", "power");
        device
    }

    #[test]
    fn writes_route_by_name_and_alias() {
        let mut device = device();
        assert_eq!(device.set_state("power", &json!(true)).len(), 1);
        assert_eq!(device.set_state("isOn", &json!(false)).len(), 1);
        assert!(device.set_state("nope", &json!(true)).is_empty());

        let commands = device.drain_commands();
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn parse_reports_changed_state_names() {
        let mut device = device();
        let changed = device.parse(&json!({
            "cmd": "status",
            "state": {"power": true, "brightness": 40, "humidity": 55.0},
        }));
        assert_eq!(changed, vec!["brightness", "humidity", "power"]);
        assert_eq!(device.value("power"), Some(json!(true)));
        assert_eq!(device.value("brightness"), Some(json!(40)));

        let unchanged = device.parse(&json!({
            "cmd": "status",
            "state": {"power": true},
        }));
        assert!(unchanged.is_empty());
    }

    #[test]
    fn expiry_routes_to_owning_state() {
        let mut device = device();
        let ids = device.set_state("power", &json!(true));
        device.drain_commands();

        assert!(device.expire_command(ids[0]));
        assert!(!device.expire_command(ids[0]));

        let cleared = device.drain_clear_events();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].state, "power");
    }

    #[test]
    fn op_reports_reach_the_addressed_state_only() {
        let mut device = device();
        device.parse(&json!({"op": {"command": [[0xAA, 0x04, 0x21]]}}));
        assert_eq!(device.value("brightness"), Some(json!(0x21)));
        assert_eq!(device.value("power"), Some(json!(null)));
    }
}
