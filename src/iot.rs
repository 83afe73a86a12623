//! Cloud channel command lifecycle coordination.
//! Publishes generated commands as cloud envelopes, tracks per-command
//! expiry, normalizes nested inbound envelopes, and correlates
//! acknowledgements back to pending commands.

use crate::error::{GoveeError, Result};
use crate::state::{CommandId, QueuedCommand};
use futures_core::Stream;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;

/// Cloud channel configuration.
#[derive(Debug, Clone)]
pub struct IotConfig {
    /// Account-level topic echoed into every published envelope
    pub account_topic: String,
    /// How long a published command may stay unacknowledged
    pub command_ttl: Duration,
    /// Envelope command verb
    pub cmd: String,
    pub cmd_version: u32,
    pub command_type: u32,
}

impl IotConfig {
    pub fn new(account_topic: impl Into<String>) -> Self {
        Self {
            account_topic: account_topic.into(),
            command_ttl: Duration::from_secs(30),
            cmd: "ptReal".to_string(),
            cmd_version: 0,
            command_type: 1,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.command_ttl = ttl;
        self
    }
}

/// A published command awaiting acknowledgement or expiry.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: CommandId,
    pub device_id: String,
    pub payload: Value,
    pub expires_at: Instant,
}

/// A fully-built envelope handed to the transport collaborator.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub topic: String,
    pub envelope: Value,
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum IotEvent {
    /// A (flattened) inbound payload, for the parsing layer
    Update {
        device_id: Option<String>,
        payload: Value,
    },
    /// An inbound envelope acknowledged a pending command
    Acknowledged {
        command: PendingCommand,
        payload: Value,
    },
    /// A pending command's TTL elapsed without acknowledgement
    Expired(PendingCommand),
}

/// Generate a transaction identifier compatible with the upstream service.
fn new_transaction() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("u_{}", millis)
}

/// Flatten an inbound envelope that nests the real payload under `msg` or
/// `data` keys, possibly several levels deep.
///
/// Breadth-first: `state` sub-objects merge with deeper frames overriding,
/// the last `op` object wins, and every other key is first-seen-wins. The
/// result is the flat shape the parsing layer consumes, so states never see
/// transport-level nesting.
pub fn flatten_envelope(payload: &Value) -> Value {
    let Some(root) = payload.as_object() else {
        return payload.clone();
    };

    let mut frames: Vec<&Map<String, Value>> = Vec::new();
    let mut queue: VecDeque<&Map<String, Value>> = VecDeque::from([root]);
    while let Some(frame) = queue.pop_front() {
        frames.push(frame);
        for key in ["msg", "data"] {
            if let Some(nested) = frame.get(key).and_then(Value::as_object) {
                queue.push_back(nested);
            }
        }
    }

    let mut combined = Map::new();
    let mut state = Map::new();
    let mut op: Option<Value> = None;
    for frame in frames {
        for (key, value) in frame {
            match key.as_str() {
                "msg" | "data" => {}
                "state" => {
                    if let Some(fields) = value.as_object() {
                        for (field, field_value) in fields {
                            state.insert(field.clone(), field_value.clone());
                        }
                    }
                }
                "op" => {
                    if value.is_object() {
                        op = Some(value.clone());
                    }
                }
                _ => {
                    combined.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
    if !state.is_empty() {
        combined.insert("state".to_string(), Value::Object(state));
    }
    if let Some(op) = op {
        combined.insert("op".to_string(), op);
    }
    Value::Object(combined)
}

fn extract_device_id(payload: &Value) -> Option<String> {
    for key in ["device", "deviceId"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

fn extract_command_id(payload: &Value) -> Option<CommandId> {
    payload
        .get("commandId")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Synchronous pending-command bookkeeping.
///
/// Deadlines are computed from the `now` passed in, which keeps expiry
/// behavior deterministic for embedders driving their own clock.
pub struct CommandTracker {
    config: IotConfig,
    pending: HashMap<CommandId, PendingCommand>,
}

impl CommandTracker {
    pub fn new(config: IotConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Build the cloud envelope for a queued command and register its
    /// pending entry. The command's own id is echoed into the envelope.
    pub fn track(
        &mut self,
        device_id: &str,
        topic: &str,
        command: &QueuedCommand,
        now: Instant,
    ) -> (PendingCommand, OutboundEnvelope) {
        let data = serde_json::to_value(command).unwrap_or(Value::Null);
        let envelope = json!({
            "topic": topic,
            "msg": {
                "accountTopic": self.config.account_topic,
                "cmd": self.config.cmd,
                "cmdVersion": self.config.cmd_version,
                "data": data,
                "transaction": new_transaction(),
                "type": self.config.command_type,
                "commandId": command.command_id,
            },
        });
        let pending = PendingCommand {
            command_id: command.command_id,
            device_id: device_id.to_string(),
            payload: envelope.clone(),
            expires_at: now + self.config.command_ttl,
        };
        self.pending.insert(command.command_id, pending.clone());
        (
            pending,
            OutboundEnvelope {
                topic: topic.to_string(),
                envelope,
            },
        )
    }

    /// Drop and return the pending entry for an acknowledged command.
    /// Unknown or already-cleared ids are no-ops.
    pub fn acknowledge(&mut self, command_id: CommandId) -> Option<PendingCommand> {
        self.pending.remove(&command_id)
    }

    /// Remove and return every pending command due at `now`.
    pub fn expire_at(&mut self, now: Instant) -> Vec<PendingCommand> {
        let due: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.expires_at <= now)
            .map(|(command_id, _)| *command_id)
            .collect();
        due.iter()
            .filter_map(|command_id| self.pending.remove(command_id))
            .collect()
    }

    /// The soonest upcoming deadline among pending commands.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.expires_at)
            .min()
    }

    pub fn pending(&self) -> Vec<PendingCommand> {
        self.pending.values().cloned().collect()
    }

    pub fn is_pending(&self, command_id: CommandId) -> bool {
        self.pending.contains_key(&command_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

enum CoordinatorRequest {
    Publish {
        device_id: String,
        topic: String,
        command: QueuedCommand,
        resp_tx: oneshot::Sender<Result<CommandId>>,
    },
    Expire {
        resp_tx: oneshot::Sender<Vec<PendingCommand>>,
    },
    Pending {
        resp_tx: oneshot::Sender<Vec<PendingCommand>>,
    },
}

/// Handle to the background coordinator task.
///
/// Cheap to clone; all mutation happens inside the task, so callers never
/// need locks. Network-thread callbacks marshal inbound payloads onto the
/// task through [`inbound_sender`](Self::inbound_sender).
#[derive(Clone)]
pub struct IotCoordinator {
    tx: mpsc::Sender<CoordinatorRequest>,
    inbound_tx: mpsc::Sender<Value>,
    event_tx: broadcast::Sender<IotEvent>,
    cancel_token: CancellationToken,
}

impl IotCoordinator {
    /// Start the coordinator task.
    ///
    /// Returns the handle and the outbound envelope queue the transport
    /// collaborator must drain.
    pub fn new(config: IotConfig) -> (Self, mpsc::Receiver<OutboundEnvelope>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let coordinator = Self {
            tx,
            inbound_tx,
            event_tx: event_tx.clone(),
            cancel_token: cancel_token.clone(),
        };

        tokio::spawn(run_loop(
            CommandTracker::new(config),
            rx,
            inbound_rx,
            outbound_tx,
            event_tx,
            cancel_token,
        ));
        (coordinator, outbound_rx)
    }

    /// Publish a queued command over the cloud channel and track its expiry.
    pub async fn publish(
        &self,
        device_id: impl Into<String>,
        topic: impl Into<String>,
        command: QueuedCommand,
    ) -> Result<CommandId> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorRequest::Publish {
                device_id: device_id.into(),
                topic: topic.into(),
                command,
                resp_tx,
            })
            .await
            .map_err(|_| GoveeError::NotRunning)?;
        resp_rx.await.map_err(|_| GoveeError::NotRunning)?
    }

    /// Feed one raw inbound envelope into the coordinator.
    pub async fn handle_inbound(&self, payload: Value) -> Result<()> {
        self.inbound_tx
            .send(payload)
            .await
            .map_err(|_| GoveeError::NotRunning)
    }

    /// Sender for transport callbacks running on foreign threads; sending
    /// marshals the payload onto the coordinator task.
    pub fn inbound_sender(&self) -> mpsc::Sender<Value> {
        self.inbound_tx.clone()
    }

    /// Sweep and return every pending command whose TTL has elapsed.
    pub async fn expire_commands(&self) -> Result<Vec<PendingCommand>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorRequest::Expire { resp_tx })
            .await
            .map_err(|_| GoveeError::NotRunning)?;
        resp_rx.await.map_err(|_| GoveeError::NotRunning)
    }

    /// Snapshot of currently pending commands.
    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorRequest::Pending { resp_tx })
            .await
            .map_err(|_| GoveeError::NotRunning)?;
        resp_rx.await.map_err(|_| GoveeError::NotRunning)
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<IotEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a Stream of coordinator events.
    pub fn stream(&self) -> impl Stream<Item = IotEvent> + Send + 'static {
        let mut rx = self.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Stop the coordinator task, cancelling any armed expiry timer.
    /// Pending commands are dropped.
    pub fn stop(&self) {
        info!("Stopping IoT coordinator");
        self.cancel_token.cancel();
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        sleep_until(deadline).await;
    }
}

async fn run_loop(
    mut tracker: CommandTracker,
    mut rx: mpsc::Receiver<CoordinatorRequest>,
    mut inbound_rx: mpsc::Receiver<Value>,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    event_tx: broadcast::Sender<IotEvent>,
    cancel_token: CancellationToken,
) {
    debug!("IoT coordinator task started");
    loop {
        // Re-arm to the soonest upcoming deadline rather than a fixed tick.
        let deadline = tracker.next_deadline();
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            request = rx.recv() => {
                match request {
                    Some(request) => {
                        handle_request(&mut tracker, request, &outbound_tx, &event_tx).await;
                    }
                    None => break,
                }
            }
            payload = inbound_rx.recv() => {
                match payload {
                    Some(payload) => handle_inbound_payload(&mut tracker, payload, &event_tx),
                    None => break,
                }
            }
            _ = maybe_sleep(deadline), if deadline.is_some() => {
                sweep(&mut tracker, &event_tx);
            }
        }
    }
    debug!("IoT coordinator task exited");
}

async fn handle_request(
    tracker: &mut CommandTracker,
    request: CoordinatorRequest,
    outbound_tx: &mpsc::Sender<OutboundEnvelope>,
    event_tx: &broadcast::Sender<IotEvent>,
) {
    match request {
        CoordinatorRequest::Publish {
            device_id,
            topic,
            command,
            resp_tx,
        } => {
            let command_id = command.command_id;
            let (_, envelope) = tracker.track(&device_id, &topic, &command, Instant::now());
            let result = match outbound_tx.send(envelope).await {
                Ok(()) => {
                    debug!("Published command {} for device {}", command_id, device_id);
                    Ok(command_id)
                }
                Err(err) => {
                    // The transport collaborator is gone; do not keep the
                    // command pending.
                    tracker.acknowledge(command_id);
                    Err(GoveeError::Transport(err.to_string()))
                }
            };
            let _ = resp_tx.send(result);
        }
        CoordinatorRequest::Expire { resp_tx } => {
            let expired = sweep(tracker, event_tx);
            let _ = resp_tx.send(expired);
        }
        CoordinatorRequest::Pending { resp_tx } => {
            let _ = resp_tx.send(tracker.pending());
        }
    }
}

fn handle_inbound_payload(
    tracker: &mut CommandTracker,
    payload: Value,
    event_tx: &broadcast::Sender<IotEvent>,
) {
    let flattened = flatten_envelope(&payload);
    if let Some(command_id) = extract_command_id(&flattened) {
        match tracker.acknowledge(command_id) {
            Some(command) => {
                debug!("Command {} acknowledged", command_id);
                let _ = event_tx.send(IotEvent::Acknowledged {
                    command,
                    payload: flattened.clone(),
                });
            }
            None => debug!("Ignoring unknown command id {}", command_id),
        }
    }
    let _ = event_tx.send(IotEvent::Update {
        device_id: extract_device_id(&flattened),
        payload: flattened,
    });
}

fn sweep(tracker: &mut CommandTracker, event_tx: &broadcast::Sender<IotEvent>) -> Vec<PendingCommand> {
    let expired = tracker.expire_at(Instant::now());
    for command in &expired {
        warn!(
            "Command {} for device {} expired without acknowledgement",
            command.command_id, command.device_id
        );
        let _ = event_tx.send(IotEvent::Expired(command.clone()));
    }
    expired
}
