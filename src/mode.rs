//! Composite mode state machine.
//! A mode state owns a set of mutually exclusive delegate states, tracks
//! which one is active from reported identifier sequences, and translates
//! mode changes into catalog-driven opcode commands.

use crate::catalog::CatalogEntry;
use crate::error::Result;
use crate::opcodes::REPORT_OPCODE;
use crate::state::{
    AnyState, BoundedStack, ClearEvent, CommandDraft, CommandId, DEFAULT_HISTORY_CAPACITY,
    OpIdentifier, QueuedCommand, expectation_matches, expected_op_row, filter_op_commands,
    frames_from_payload, op_row_matches,
};
use log::debug;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use uuid::Uuid;

/// Identifies one of the mutually exclusive modes a composite state can be
/// in. Implemented by a small per-device enum.
pub trait ModeRole: Copy + Eq + Hash + Send + 'static {
    fn as_str(&self) -> &'static str;
}

/// One delegate registered on a [`ModeState`], keyed by role and the
/// identifier tail that selects it in reports.
pub struct ModeDelegate<R: ModeRole> {
    pub role: R,
    pub identifier: Vec<u8>,
    pub state: Box<dyn AnyState>,
}

impl<R: ModeRole> ModeDelegate<R> {
    pub fn new(role: R, identifier: impl Into<Vec<u8>>, state: Box<dyn AnyState>) -> Self {
        Self {
            role,
            identifier: identifier.into(),
            state,
        }
    }
}

type Resolver<R> = Box<dyn Fn(&[u8], &[ModeDelegate<R>]) -> Option<R> + Send>;

/// Composite state whose value is the currently active delegate role.
///
/// The active role is derived from reported identifier sequences; mode
/// writes resolve a human-readable alias against the catalog command table
/// and queue a single framed command on the composite's own queue.
pub struct ModeState<R: ModeRole> {
    name: String,
    op_type: u8,
    identifier: Vec<u8>,
    inline: bool,
    delegates: Vec<ModeDelegate<R>>,
    aliases: HashMap<String, R>,
    commands: HashMap<String, Vec<u8>>,
    command_opcode: Option<u8>,
    status_opcode: Option<u8>,
    resolver: Option<Resolver<R>>,
    active_identifier: Option<Vec<u8>>,
    active: Option<R>,
    history: BoundedStack<Option<R>>,
    command_queue: VecDeque<QueuedCommand>,
    clear_queue: VecDeque<ClearEvent>,
    pending: HashMap<CommandId, Vec<Value>>,
}

/// Normalize a mode token: case- and separator-insensitive, with an
/// optional `_mode`/`-mode` suffix stripped.
fn normalize_token(token: &str) -> String {
    let mut text = token.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    if let Some(stripped) = text.strip_suffix("_mode") {
        text = stripped.to_string();
    }
    text
}

impl<R: ModeRole> ModeState<R> {
    pub fn new(name: impl Into<String>, op_type: u8, delegates: Vec<ModeDelegate<R>>) -> Self {
        let mut aliases = HashMap::new();
        for delegate in &delegates {
            aliases.insert(normalize_token(delegate.role.as_str()), delegate.role);
            aliases.insert(normalize_token(delegate.state.name()), delegate.role);
        }
        let mut history = BoundedStack::new(DEFAULT_HISTORY_CAPACITY);
        history.push(None);
        Self {
            name: name.into(),
            op_type,
            identifier: Vec::new(),
            inline: true,
            delegates,
            aliases,
            commands: HashMap::new(),
            command_opcode: None,
            status_opcode: None,
            resolver: None,
            active_identifier: None,
            active: None,
            history,
            command_queue: VecDeque::new(),
            clear_queue: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    /// Fix an identifier prefix that follows the opcode in report frames.
    pub fn with_identifier(mut self, identifier: impl Into<Vec<u8>>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Expect the active identifier nested under a leading `0x00` marker
    /// instead of spanning the whole opcode payload.
    pub fn nested(mut self) -> Self {
        self.inline = false;
        self
    }

    /// Attach the catalog command table that makes this mode commandable.
    pub fn with_catalog(mut self, entry: &CatalogEntry) -> Result<Self> {
        self.command_opcode = Some(entry.command_opcode_byte()?);
        self.status_opcode = Some(entry.status_opcode_byte()?);
        for label in entry.commands.keys() {
            if let Some(payload) = entry.command_payload(label) {
                self.commands.insert(normalize_token(label), payload);
            }
        }
        Ok(self)
    }

    /// Replace the default suffix-match resolution strategy.
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&[u8], &[ModeDelegate<R>]) -> Option<R> + Send + 'static,
    ) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn active_mode(&self) -> Option<R> {
        self.active
    }

    pub fn active_identifier(&self) -> Option<&[u8]> {
        self.active_identifier.as_deref()
    }

    pub fn delegate(&self, role: R) -> Option<&dyn AnyState> {
        self.delegates
            .iter()
            .find(|delegate| delegate.role == role)
            .map(|delegate| &*delegate.state)
    }

    pub fn delegate_mut(&mut self, role: R) -> Option<&mut (dyn AnyState + 'static)> {
        self.delegates
            .iter_mut()
            .find(|delegate| delegate.role == role)
            .map(move |delegate| &mut *delegate.state)
    }

    /// Resolve a human-readable mode token to a registered role.
    pub fn resolve_mode(&self, token: &str) -> Option<R> {
        self.aliases.get(&normalize_token(token)).copied()
    }

    /// Queue a mode change for a typed role.
    pub fn set_mode(&mut self, role: R) -> Vec<CommandId> {
        self.queue_mode_command(&normalize_token(role.as_str()))
    }

    /// Queue a mode change for a role alias or catalog label.
    pub fn set_state(&mut self, token: &str) -> Vec<CommandId> {
        self.queue_mode_command(&normalize_token(token))
    }

    /// Route a write to the currently active delegate. The resulting
    /// commands surface through [`drain_commands`](AnyState::drain_commands).
    pub fn set_active_state(&mut self, next: &Value) -> Vec<CommandId> {
        let Some(role) = self.active else {
            debug!("mode {}: no active delegate for write", self.name);
            return Vec::new();
        };
        self.delegate_mut(role)
            .map(|state| state.set_state_json(next))
            .unwrap_or_default()
    }

    fn queue_mode_command(&mut self, token: &str) -> Vec<CommandId> {
        let (Some(command_opcode), Some(status_opcode)) = (self.command_opcode, self.status_opcode)
        else {
            debug!("mode {}: not commandable", self.name);
            return Vec::new();
        };
        let tail = match self.commands.get(token) {
            Some(tail) => tail.clone(),
            // An alias may name the role while the table keys the label.
            None => match self
                .aliases
                .get(token)
                .map(|role| normalize_token(role.as_str()))
                .and_then(|label| self.commands.get(&label))
            {
                Some(tail) => tail.clone(),
                None => {
                    debug!("mode {}: no command payload for '{}'", self.name, token);
                    return Vec::new();
                }
            },
        };

        let mut payload = Vec::with_capacity(1 + tail.len());
        payload.push(status_opcode);
        payload.extend_from_slice(&tail);
        let Ok(draft) = CommandDraft::new(format!("{}_{}", self.name, token), command_opcode, &payload)
        else {
            return Vec::new();
        };

        let mut row = vec![json!(REPORT_OPCODE), json!(status_opcode)];
        row.extend(tail.iter().map(|byte| json!(byte)));
        let command_id = Uuid::new_v4();
        self.pending
            .insert(command_id, vec![json!({"op": {"command": [row]}})]);
        self.command_queue.push_back(draft.stamped(command_id));
        debug!("mode {}: queued mode command {}", self.name, command_id);
        vec![command_id]
    }

    fn resolve_active(&self) -> Option<R> {
        let active = self.active_identifier.as_deref()?;
        if let Some(resolver) = &self.resolver {
            return resolver(active, &self.delegates);
        }
        self.delegates
            .iter()
            .find(|delegate| {
                !delegate.identifier.is_empty() && active.ends_with(&delegate.identifier)
            })
            .map(|delegate| delegate.role)
    }

    fn set_active_identifier(&mut self, identifier: Vec<u8>) {
        self.active_identifier = Some(identifier);
        let next = self.resolve_active();
        if next != self.active {
            if self.history.peek() != Some(&self.active) {
                self.history.push(self.active);
            }
            self.active = next;
        }
    }

    fn parse_op_frame(&mut self, frame: &[u8]) {
        let mut remainder = &frame[(1 + self.identifier.len()).min(frame.len())..];
        if !self.inline {
            match remainder.split_first() {
                Some((&0x00, rest)) => remainder = rest,
                _ => return,
            }
        }
        // Frames may arrive zero-padded to the fixed frame size.
        let end = remainder
            .iter()
            .rposition(|byte| *byte != 0x00)
            .map_or(0, |idx| idx + 1);
        self.set_active_identifier(remainder[..end].to_vec());
    }

    fn find_op_matching_pending(&self, frame: &[u8]) -> Vec<CommandId> {
        self.pending
            .iter()
            .filter(|(_, expectations)| {
                expectations.iter().any(|expectation| {
                    expected_op_row(expectation).is_some_and(|row| op_row_matches(row, frame))
                })
            })
            .map(|(command_id, _)| *command_id)
            .collect()
    }

    fn clear_pending(&mut self, command_id: CommandId) {
        if self.pending.remove(&command_id).is_some() {
            debug!("mode {}: cleared command {}", self.name, command_id);
            let value = self.value_json();
            self.clear_queue.push_back(ClearEvent {
                command_id,
                state: self.name.clone(),
                value,
            });
        }
    }
}

impl<R: ModeRole> AnyState for ModeState<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&mut self, data: &Value) {
        let frames = frames_from_payload(data);
        if !frames.is_empty() {
            let ident = OpIdentifier::new(
                self.op_type,
                self.identifier
                    .iter()
                    .map(|byte| i16::from(*byte))
                    .collect::<Vec<_>>(),
            );
            for frame in filter_op_commands(&frames, &ident) {
                let matched = self.find_op_matching_pending(&frame);
                self.parse_op_frame(&frame);
                for command_id in matched {
                    self.clear_pending(command_id);
                }
            }
        }

        let status = data
            .get("cmd")
            .and_then(Value::as_str)
            .is_none_or(|cmd| cmd == "status");
        if status {
            let matched = self
                .pending
                .iter()
                .find(|(_, expectations)| {
                    expectations
                        .iter()
                        .any(|expectation| expectation_matches(expectation, data))
                })
                .map(|(command_id, _)| *command_id);
            if let Some(mode) = data
                .get("state")
                .and_then(|state| state.get("mode"))
                .and_then(Value::as_u64)
                && let Ok(byte) = u8::try_from(mode)
            {
                self.set_active_identifier(vec![byte]);
            }
            if let Some(command_id) = matched {
                self.clear_pending(command_id);
            }
        }

        for delegate in &mut self.delegates {
            delegate.state.parse(data);
        }
    }

    fn set_state_json(&mut self, next: &Value) -> Vec<CommandId> {
        match next.as_str() {
            Some(token) => self.set_state(token),
            None => Vec::new(),
        }
    }

    fn previous_state(&mut self, n: usize) -> Vec<CommandId> {
        let mut restored = None;
        for _ in 0..n {
            match self.history.pop() {
                Some(entry) => restored = Some(entry),
                None => break,
            }
        }
        if let Some(entry) = restored {
            self.active = entry;
        }
        Vec::new()
    }

    fn value_json(&self) -> Value {
        match self.active {
            Some(role) => Value::String(role.as_str().to_string()),
            None => Value::Null,
        }
    }

    fn drain_commands(&mut self) -> Vec<QueuedCommand> {
        let mut commands: Vec<QueuedCommand> = self.command_queue.drain(..).collect();
        for delegate in &mut self.delegates {
            commands.extend(delegate.state.drain_commands());
        }
        commands
    }

    fn drain_clear_events(&mut self) -> Vec<ClearEvent> {
        let mut events: Vec<ClearEvent> = self.clear_queue.drain(..).collect();
        for delegate in &mut self.delegates {
            events.extend(delegate.state.drain_clear_events());
        }
        events
    }

    fn expire_command(&mut self, command_id: CommandId) -> bool {
        if self.pending.contains_key(&command_id) {
            self.clear_pending(command_id);
            return true;
        }
        self.delegates
            .iter_mut()
            .any(|delegate| delegate.state.expire_command(command_id))
    }
}
