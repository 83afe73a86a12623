//! Device state containers and report correlation.
//! Holds the bounded value history, translates writes into queued transport
//! commands, and matches inbound reports against pending command
//! expectations using partial structural comparison.

use crate::catalog::CatalogEntry;
use crate::error::Result;
use crate::opcodes::{as_opcode, ble_command_to_base64, iot_payload_to_base64};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Identifier correlating queued commands, pending expectations, and clear
/// events.
pub type CommandId = Uuid;

/// Number of previous values retained per state.
pub const DEFAULT_HISTORY_CAPACITY: usize = 5;

/// A LIFO stack with a fixed capacity.
///
/// Pushing beyond capacity discards the oldest retained entry.
#[derive(Debug, Clone)]
pub struct BoundedStack<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedStack<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_back();
        }
        self.items.push_front(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// A fully-formed command ready for the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub command_id: CommandId,
    pub name: String,
    /// Canonical `0xHH` opcode string
    pub opcode: String,
    /// Uppercase hex payload (identifier and value bytes, unframed)
    pub payload_hex: String,
    /// Assembled, checksummed frame for the short-range transport
    pub ble_base64: String,
    /// Raw payload encoding for the cloud transport
    pub iot_base64: String,
}

/// A command produced by a state translation, before an id is stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDraft {
    pub name: String,
    pub opcode: String,
    pub payload_hex: String,
    pub ble_base64: String,
    pub iot_base64: String,
}

impl CommandDraft {
    /// Build a draft from an opcode byte and payload, producing both
    /// transport encodings.
    pub fn new(name: impl Into<String>, opcode: u8, payload: &[u8]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            opcode: as_opcode(opcode)?,
            payload_hex: hex::encode_upper(payload),
            ble_base64: ble_command_to_base64(&[opcode], payload)?,
            iot_base64: iot_payload_to_base64(payload),
        })
    }

    pub(crate) fn stamped(self, command_id: CommandId) -> QueuedCommand {
        QueuedCommand {
            command_id,
            name: self.name,
            opcode: self.opcode,
            payload_hex: self.payload_hex,
            ble_base64: self.ble_base64,
            iot_base64: self.iot_base64,
        }
    }
}

/// Notification emitted exactly once when a pending command reaches its
/// terminal state, whether acknowledged or expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearEvent {
    pub command_id: CommandId,
    pub state: String,
    pub value: Value,
}

/// The result of translating a desired value into transport commands.
///
/// A translation may fan out to multiple physical commands sharing one
/// command id, and may register several expectations; a report matching any
/// single expectation clears the whole command.
#[derive(Debug, Clone)]
pub struct CommandMapping {
    pub commands: Vec<CommandDraft>,
    pub expectations: Vec<Value>,
}

impl CommandMapping {
    pub fn new(command: CommandDraft, expectations: Vec<Value>) -> Self {
        Self {
            commands: vec![command],
            expectations,
        }
    }
}

/// Opcode family and identifier sequence used to select report frames.
///
/// Negative identifier entries are wildcards: the observed byte must exist
/// but may hold any value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpIdentifier {
    pub op_type: Option<u8>,
    pub identifier: Vec<i16>,
}

impl OpIdentifier {
    pub fn new(op_type: u8, identifier: impl Into<Vec<i16>>) -> Self {
        Self {
            op_type: Some(op_type),
            identifier: identifier.into(),
        }
    }

    /// Build the report filter for a catalog entry: its report opcode
    /// family plus the status identifier byte.
    pub fn from_catalog(entry: &CatalogEntry) -> Result<Self> {
        Ok(Self::new(
            entry.op_type_byte()?,
            vec![entry.status_opcode_byte()? as i16],
        ))
    }
}

/// How a state interprets inbound payloads.
///
/// `with_state` keeps structured-report parsing active alongside the opcode
/// paths, mirroring states that are reported over both channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStrategy {
    /// Write-only or externally driven; inbound payloads are ignored
    None,
    /// Structured (REST-style) payloads only
    StateOnly,
    /// Individual opcode report frames
    OpCode { ident: OpIdentifier, with_state: bool },
    /// All matching frames handed over as one aggregated payload
    MultiOp { ident: OpIdentifier, with_state: bool },
}

/// Typed decode/encode hooks supplied by each concrete state.
///
/// Every hook defaults to "not handled"; a state implements only the
/// directions it supports. `to_command` returning `None` is the rejected
/// write path: `set_state` then queues nothing and returns no ids.
pub trait StateLogic: Send {
    type Value: Clone + PartialEq + Send + Serialize + DeserializeOwned;

    fn to_command(&self, _next: &Self::Value) -> Option<CommandMapping> {
        None
    }

    fn parse_state(&self, _data: &Value) -> Option<Self::Value> {
        None
    }

    fn parse_op_command(&self, _frame: &[u8]) -> Option<Self::Value> {
        None
    }

    fn parse_multi_op(&self, _frames: &[Vec<u8>]) -> Option<Self::Value> {
        None
    }
}

/// Recursively compare a partial expectation against an observed value.
///
/// `Null` always matches. A mapping matches when every expected key is
/// present with a recursively matching value. A sequence matches a prefix of
/// the observed sequence elementwise. Everything else compares by equality.
pub fn partial_match(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Null => true,
        Value::Object(fields) => match actual.as_object() {
            Some(observed) => fields.iter().all(|(key, value)| {
                observed
                    .get(key)
                    .is_some_and(|actual_value| partial_match(value, actual_value))
            }),
            None => false,
        },
        Value::Array(items) => match actual.as_array() {
            Some(observed) => {
                observed.len() >= items.len()
                    && items
                        .iter()
                        .zip(observed.iter())
                        .all(|(exp, act)| partial_match(exp, act))
            }
            None => false,
        },
        _ => expected == actual,
    }
}

/// Decode the `op.command` rows of an inbound payload into byte frames.
/// Malformed rows are skipped.
pub(crate) fn frames_from_payload(data: &Value) -> Vec<Vec<u8>> {
    let Some(rows) = data
        .get("op")
        .and_then(|op| op.get("command"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    rows.iter().filter_map(row_to_bytes).collect()
}

fn row_to_bytes(row: &Value) -> Option<Vec<u8>> {
    row.as_array()?
        .iter()
        .map(|value| value.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// Keep the report frames addressed to the given opcode family and
/// identifier sequence. Surviving frames are returned whole.
pub fn filter_op_commands(frames: &[Vec<u8>], ident: &OpIdentifier) -> Vec<Vec<u8>> {
    let Some(op_type) = ident.op_type else {
        return frames.to_vec();
    };
    frames
        .iter()
        .filter(|frame| {
            frame.first() == Some(&op_type)
                && ident
                    .identifier
                    .iter()
                    .enumerate()
                    .all(|(idx, want)| match frame.get(1 + idx) {
                        Some(byte) => *want < 0 || i16::from(*byte) == *want,
                        None => false,
                    })
        })
        .cloned()
        .collect()
}

/// Match an expected opcode row (with `Null` wildcards) against the prefix
/// of an observed frame.
pub(crate) fn op_row_matches(expected: &[Value], frame: &[u8]) -> bool {
    expected
        .iter()
        .enumerate()
        .all(|(idx, want)| match frame.get(idx) {
            Some(byte) => want.is_null() || want.as_u64() == Some(u64::from(*byte)),
            None => false,
        })
}

/// Extract the expected opcode row from an op-shaped expectation.
pub(crate) fn expected_op_row(expectation: &Value) -> Option<&Vec<Value>> {
    expectation
        .get("op")?
        .get("command")?
        .as_array()?
        .first()?
        .as_array()
}

/// Does any shape of this expectation match the inbound message?
pub(crate) fn expectation_matches(expectation: &Value, message: &Value) -> bool {
    if let (Some(expected), Some(observed)) = (expectation.get("state"), message.get("state"))
        && partial_match(expected, observed)
    {
        return true;
    }
    if let Some(row) = expected_op_row(expectation) {
        return frames_from_payload(message)
            .iter()
            .any(|frame| op_row_matches(row, frame));
    }
    false
}

/// A named, typed device capability.
///
/// Owns the current value, a capped undo history, the FIFO command and clear
/// queues consumed by collaborators, and the pending-expectation map used to
/// correlate reports back to writes.
pub struct DeviceState<L: StateLogic> {
    name: String,
    logic: L,
    strategy: ParseStrategy,
    value: Option<L::Value>,
    history: BoundedStack<Option<L::Value>>,
    command_queue: VecDeque<QueuedCommand>,
    clear_queue: VecDeque<ClearEvent>,
    pending: HashMap<CommandId, Vec<Value>>,
}

impl<L: StateLogic> DeviceState<L> {
    pub fn new(name: impl Into<String>, strategy: ParseStrategy, logic: L) -> Self {
        Self::with_initial(name, strategy, logic, None)
    }

    pub fn with_initial(
        name: impl Into<String>,
        strategy: ParseStrategy,
        logic: L,
        initial: Option<L::Value>,
    ) -> Self {
        let mut history = BoundedStack::new(DEFAULT_HISTORY_CAPACITY);
        history.push(initial.clone());
        Self {
            name: name.into(),
            logic,
            strategy,
            value: initial,
            history,
            command_queue: VecDeque::new(),
            clear_queue: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&L::Value> {
        self.value.as_ref()
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn value_json(&self) -> Value {
        serde_json::to_value(&self.value).unwrap_or(Value::Null)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self, command_id: CommandId) -> bool {
        self.pending.contains_key(&command_id)
    }

    pub fn queued_len(&self) -> usize {
        self.command_queue.len()
    }

    /// Record a new current value, retaining the previous one in history.
    pub fn update_value(&mut self, next: Option<L::Value>) {
        if self.history.peek() != Some(&self.value) {
            self.history.push(self.value.clone());
        }
        self.value = next;
    }

    /// Translate a desired value into queued commands.
    ///
    /// A rejected write (no translation) returns an empty list and queues
    /// nothing. Otherwise the translation's commands are stamped with one
    /// fresh command id, its expectations are registered, and the id is
    /// returned.
    pub fn set_state(&mut self, next: L::Value) -> Vec<CommandId> {
        let Some(mapping) = self.logic.to_command(&next) else {
            debug!("state {}: write rejected", self.name);
            return Vec::new();
        };
        if mapping.commands.is_empty() {
            return Vec::new();
        }
        let command_id = Uuid::new_v4();
        self.pending.insert(command_id, mapping.expectations);
        for draft in mapping.commands {
            self.command_queue.push_back(draft.stamped(command_id));
        }
        debug!("state {}: queued command {}", self.name, command_id);
        vec![command_id]
    }

    /// Rewind to an earlier value.
    ///
    /// Pops up to `n` history entries, converging on the oldest retained
    /// entry when over-popped, and republishes that value locally. No device
    /// commands are generated; the returned id list is always empty.
    pub fn previous_state(&mut self, n: usize) -> Vec<CommandId> {
        let mut restored = None;
        for _ in 0..n {
            match self.history.pop() {
                Some(entry) => restored = Some(entry),
                None => break,
            }
        }
        if let Some(entry) = restored {
            self.value = entry;
        }
        Vec::new()
    }

    /// Interpret an inbound payload according to this state's strategy.
    ///
    /// Malformed or absent sections are ignored without error; commands that
    /// never see a matching report stay pending until expired.
    pub fn parse(&mut self, data: &Value) {
        match self.strategy.clone() {
            ParseStrategy::None => {}
            ParseStrategy::StateOnly => self.parse_state_payload(data),
            ParseStrategy::OpCode { ident, with_state } => {
                self.parse_op_payload(data, &ident);
                if with_state {
                    self.parse_state_payload(data);
                }
            }
            ParseStrategy::MultiOp { ident, with_state } => {
                self.parse_multi_payload(data, &ident);
                if with_state {
                    self.parse_state_payload(data);
                }
            }
        }
    }

    /// Drop a pending command without a matching report, emitting the same
    /// single clear event an acknowledgement would.
    pub fn expire_command(&mut self, command_id: CommandId) -> bool {
        if self.pending.contains_key(&command_id) {
            self.clear_pending(command_id);
            true
        } else {
            false
        }
    }

    /// Remove and return every queued command, oldest first.
    pub fn drain_commands(&mut self) -> Vec<QueuedCommand> {
        self.command_queue.drain(..).collect()
    }

    /// Remove and return every emitted clear event, oldest first.
    pub fn drain_clear_events(&mut self) -> Vec<ClearEvent> {
        self.clear_queue.drain(..).collect()
    }

    fn parse_state_payload(&mut self, data: &Value) {
        if let Some(cmd) = data.get("cmd").and_then(Value::as_str)
            && cmd != "status"
        {
            return;
        }
        let matched = self.find_matching_pending(data);
        if let Some(next) = self.logic.parse_state(data) {
            self.update_value(Some(next));
        }
        if let Some(command_id) = matched {
            self.clear_pending(command_id);
        }
    }

    fn parse_op_payload(&mut self, data: &Value, ident: &OpIdentifier) {
        let frames = frames_from_payload(data);
        if frames.is_empty() {
            return;
        }
        for frame in filter_op_commands(&frames, ident) {
            let matched = self.find_op_matching_pending(&frame);
            if let Some(next) = self.logic.parse_op_command(&frame) {
                self.update_value(Some(next));
            }
            for command_id in matched {
                self.clear_pending(command_id);
            }
        }
    }

    fn parse_multi_payload(&mut self, data: &Value, ident: &OpIdentifier) {
        let frames = frames_from_payload(data);
        if frames.is_empty() {
            return;
        }
        let filtered = filter_op_commands(&frames, ident);
        if filtered.is_empty() {
            return;
        }
        let matched: Vec<CommandId> = filtered
            .iter()
            .flat_map(|frame| self.find_op_matching_pending(frame))
            .collect();
        if let Some(next) = self.logic.parse_multi_op(&filtered) {
            self.update_value(Some(next));
        }
        for command_id in matched {
            self.clear_pending(command_id);
        }
    }

    fn find_matching_pending(&self, message: &Value) -> Option<CommandId> {
        self.pending
            .iter()
            .find(|(_, expectations)| {
                expectations
                    .iter()
                    .any(|expectation| expectation_matches(expectation, message))
            })
            .map(|(command_id, _)| *command_id)
    }

    fn find_op_matching_pending(&self, frame: &[u8]) -> Vec<CommandId> {
        self.pending
            .iter()
            .filter(|(_, expectations)| {
                expectations.iter().any(|expectation| {
                    expected_op_row(expectation)
                        .is_some_and(|row| op_row_matches(row, frame))
                })
            })
            .map(|(command_id, _)| *command_id)
            .collect()
    }

    fn clear_pending(&mut self, command_id: CommandId) {
        if self.pending.remove(&command_id).is_some() {
            debug!("state {}: cleared command {}", self.name, command_id);
            self.clear_queue.push_back(ClearEvent {
                command_id,
                state: self.name.clone(),
                value: self.value_json(),
            });
        }
    }
}

/// Object-safe facade over [`DeviceState`] for heterogeneous registries.
pub trait AnyState: Send {
    fn name(&self) -> &str;
    fn parse(&mut self, data: &Value);
    fn set_state_json(&mut self, next: &Value) -> Vec<CommandId>;
    fn previous_state(&mut self, n: usize) -> Vec<CommandId>;
    fn value_json(&self) -> Value;
    fn drain_commands(&mut self) -> Vec<QueuedCommand>;
    fn drain_clear_events(&mut self) -> Vec<ClearEvent>;
    fn expire_command(&mut self, command_id: CommandId) -> bool;
}

impl<L: StateLogic> AnyState for DeviceState<L> {
    fn name(&self) -> &str {
        DeviceState::name(self)
    }

    fn parse(&mut self, data: &Value) {
        DeviceState::parse(self, data);
    }

    fn set_state_json(&mut self, next: &Value) -> Vec<CommandId> {
        match serde_json::from_value::<L::Value>(next.clone()) {
            Ok(value) => self.set_state(value),
            Err(err) => {
                debug!("state {}: unparseable write: {}", self.name, err);
                Vec::new()
            }
        }
    }

    fn previous_state(&mut self, n: usize) -> Vec<CommandId> {
        DeviceState::previous_state(self, n)
    }

    fn value_json(&self) -> Value {
        DeviceState::value_json(self)
    }

    fn drain_commands(&mut self) -> Vec<QueuedCommand> {
        DeviceState::drain_commands(self)
    }

    fn drain_clear_events(&mut self) -> Vec<ClearEvent> {
        DeviceState::drain_clear_events(self)
    }

    fn expire_command(&mut self, command_id: CommandId) -> bool {
        DeviceState::expire_command(self, command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RecordingLogic {
        commandable: bool,
    }

    impl StateLogic for RecordingLogic {
        type Value = Value;

        fn to_command(&self, next: &Value) -> Option<CommandMapping> {
            if !self.commandable {
                return None;
            }
            let draft = CommandDraft::new("set_power", 0x33, &[0x01, 0x01]).ok()?;
            Some(CommandMapping::new(
                draft,
                vec![json!({"state": next.clone()})],
            ))
        }

        fn parse_state(&self, data: &Value) -> Option<Value> {
            data.get("state").cloned()
        }
    }

    struct OpLogic;

    impl StateLogic for OpLogic {
        type Value = Vec<u8>;

        fn to_command(&self, _next: &Vec<u8>) -> Option<CommandMapping> {
            let draft = CommandDraft::new("set_mode", 0x33, &[0x01, 0x02]).ok()?;
            Some(CommandMapping::new(
                draft,
                vec![json!({"op": {"command": [[0x33, 0x01, null]]}})],
            ))
        }

        fn parse_op_command(&self, frame: &[u8]) -> Option<Vec<u8>> {
            Some(frame.to_vec())
        }
    }

    struct MultiLogic;

    impl StateLogic for MultiLogic {
        type Value = usize;

        fn parse_multi_op(&self, frames: &[Vec<u8>]) -> Option<usize> {
            Some(frames.len())
        }
    }

    fn op_ident(op_type: u8, identifier: &[i16]) -> OpIdentifier {
        OpIdentifier::new(op_type, identifier.to_vec())
    }

    #[test]
    fn bounded_stack_discards_oldest_beyond_capacity() {
        let mut stack = BoundedStack::new(3);
        for n in 0..5 {
            stack.push(n);
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(4));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn partial_match_maps_sequences_and_wildcards() {
        assert!(partial_match(&Value::Null, &json!({"x": 1})));
        assert!(partial_match(
            &json!({"a": {"b": 2}}),
            &json!({"a": {"b": 2, "c": 3}, "d": 4})
        ));
        assert!(!partial_match(&json!({"a": 1}), &json!({"b": 1})));
        assert!(partial_match(&json!([1, null, 3]), &json!([1, 9, 3, 4])));
        assert!(!partial_match(&json!([1, 2, 3]), &json!([1, 2])));
        assert!(!partial_match(&json!([1]), &json!("not a list")));
    }

    #[test]
    fn filter_keeps_whole_frames_matching_type_and_identifier() {
        let frames = vec![
            vec![0x33, 0x01, 0xFF],
            vec![0x33, 0x02, 0x00],
            vec![0xAA, 0x01, 0x07],
        ];
        let filtered = filter_op_commands(&frames, &op_ident(0x33, &[0x01]));
        assert_eq!(filtered, vec![vec![0x33, 0x01, 0xFF]]);

        let wildcard = filter_op_commands(&frames, &op_ident(0x33, &[-1]));
        assert_eq!(wildcard.len(), 2);

        let untyped = filter_op_commands(&frames, &OpIdentifier::default());
        assert_eq!(untyped.len(), 3);
    }

    #[test]
    fn filter_requires_identifier_bytes_to_exist() {
        let frames = vec![vec![0x33]];
        assert!(filter_op_commands(&frames, &op_ident(0x33, &[-1])).is_empty());
    }

    #[test]
    fn set_state_tracks_pending_and_clears_on_status_match() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );

        let ids = state.set_state(json!({"power": "on"}));
        assert_eq!(ids.len(), 1);

        let queued = state.drain_commands();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].command_id, ids[0]);
        assert_eq!(queued[0].name, "set_power");
        assert_eq!(queued[0].opcode, "0x33");

        state.parse(&json!({"cmd": "status", "state": {"power": "on"}}));

        let cleared = state.drain_clear_events();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].command_id, ids[0]);
        assert_eq!(cleared[0].state, "power");
        assert_eq!(state.pending_len(), 0);
    }

    struct FanOutLogic;

    impl StateLogic for FanOutLogic {
        type Value = u8;

        fn to_command(&self, next: &u8) -> Option<CommandMapping> {
            let first = CommandDraft::new("step_one", 0x33, &[0x0A, *next]).ok()?;
            let second = CommandDraft::new("step_two", 0x33, &[0x0B, *next]).ok()?;
            Some(CommandMapping {
                commands: vec![first, second],
                expectations: vec![json!({"state": {"level": next}})],
            })
        }
    }

    #[test]
    fn fan_out_commands_share_one_id() {
        let mut state = DeviceState::new("level", ParseStrategy::StateOnly, FanOutLogic);

        let ids = state.set_state(7);
        assert_eq!(ids.len(), 1);

        let queued = state.drain_commands();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|command| command.command_id == ids[0]));
        assert_eq!(queued[0].name, "step_one");
        assert_eq!(queued[1].name, "step_two");
    }

    #[test]
    fn matching_report_clears_exactly_once() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        let ids = state.set_state(json!({"power": "on"}));

        state.parse(&json!({"cmd": "status", "state": {"power": "on"}}));
        state.parse(&json!({"cmd": "status", "state": {"power": "on"}}));

        assert_eq!(state.drain_clear_events().len(), 1);
        assert!(!state.has_pending(ids[0]));
    }

    #[test]
    fn non_status_cmd_skips_structured_parsing() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        state.parse(&json!({"cmd": "ptReal", "state": {"power": "on"}}));
        assert_eq!(state.value_json(), Value::Null);
    }

    #[test]
    fn rejected_write_returns_empty_and_queues_nothing() {
        let mut state = DeviceState::new(
            "sensor",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: false },
        );
        assert!(state.set_state(json!({"x": 1})).is_empty());
        assert_eq!(state.queued_len(), 0);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn op_parsing_clears_matching_pending() {
        let mut state = DeviceState::new(
            "mode",
            ParseStrategy::OpCode {
                ident: op_ident(0x33, &[0x01]),
                with_state: false,
            },
            OpLogic,
        );

        let ids = state.set_state(Vec::new());
        assert_eq!(state.drain_commands()[0].command_id, ids[0]);

        state.parse(&json!({"op": {"command": [[0x33, 0x01, 0xFF]]}}));

        assert_eq!(state.value(), Some(&vec![0x33, 0x01, 0xFF]));
        let cleared = state.drain_clear_events();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].command_id, ids[0]);
    }

    #[test]
    fn op_parsing_ignores_frames_for_other_identifiers() {
        let mut state = DeviceState::new(
            "mode",
            ParseStrategy::OpCode {
                ident: op_ident(0x33, &[0x01]),
                with_state: false,
            },
            OpLogic,
        );
        let ids = state.set_state(Vec::new());
        state.drain_commands();

        state.parse(&json!({"op": {"command": [[0x33, 0x02, 0xFF]]}}));

        assert!(state.value().is_none());
        assert!(state.has_pending(ids[0]));
        assert!(state.drain_clear_events().is_empty());
    }

    #[test]
    fn multi_op_parsing_batches_filtered_frames() {
        let mut state = DeviceState::new(
            "status",
            ParseStrategy::MultiOp {
                ident: op_ident(0xAA, &[-1]),
                with_state: false,
            },
            MultiLogic,
        );

        state.parse(&json!({"op": {"command": [
            [0xAA, 0x01, 0x02],
            [0xAA, 0x03, 0x04],
            [0x33, 0x05, 0x06],
        ]}}));

        assert_eq!(state.value(), Some(&2));
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let mut state = DeviceState::new(
            "mode",
            ParseStrategy::OpCode {
                ident: op_ident(0x33, &[0x01]),
                with_state: false,
            },
            OpLogic,
        );
        state.parse(&json!({"op": {"command": "nope"}}));
        state.parse(&json!({"op": {"command": [[300, -4]]}}));
        state.parse(&json!({"unrelated": true}));
        assert!(state.value().is_none());
    }

    #[test]
    fn history_rewind_is_bounded() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        for n in 0..(DEFAULT_HISTORY_CAPACITY + 3) {
            state.update_value(Some(json!(n)));
        }
        // Rewinding past the oldest retained entry converges on it.
        state.previous_state(DEFAULT_HISTORY_CAPACITY + 3);
        assert_eq!(state.value_json(), json!(2));
    }

    #[test]
    fn previous_state_reverts_to_prior_value() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        state.update_value(Some(json!("on")));
        state.update_value(Some(json!("dim")));
        state.update_value(Some(json!("boost")));

        assert_eq!(state.value_json(), json!("boost"));
        state.previous_state(1);
        assert_eq!(state.value_json(), json!("dim"));
    }

    #[test]
    fn expire_emits_single_clear_event() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        let ids = state.set_state(json!({"power": "on"}));

        assert!(state.expire_command(ids[0]));
        assert!(!state.expire_command(ids[0]));
        assert_eq!(state.drain_clear_events().len(), 1);
    }

    #[test]
    fn set_state_json_round_trips_through_serde() {
        let mut state = DeviceState::new(
            "power",
            ParseStrategy::StateOnly,
            RecordingLogic { commandable: true },
        );
        let dynamic: &mut dyn AnyState = &mut state;
        let ids = dynamic.set_state_json(&json!({"power": "on"}));
        assert_eq!(ids.len(), 1);
    }
}
