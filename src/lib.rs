//! # Rustgovee
//!
//! Asynchronous device command protocol engine for Govee-compatible
//! devices: typed state containers with bounded history, a checksummed
//! binary frame codec, report/command correlation with partial structural
//! matching, composite mode state machines, and a cloud channel command
//! lifecycle coordinator.
//!
//! Transports are collaborators: the engine queues fully-formed command
//! payloads and parses the raw payloads fed back in, but never opens
//! sockets itself.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustgovee::{Device, PowerState, StateCatalog};
//! use serde_json::json;
//!
//! let catalog = StateCatalog::from_str(r#"{"states": [{
//!     "state_name": "power",
//!     "op_type": "0xAA",
//!     "status_opcode": "0x01",
//!     "command_opcode": "0x33"
//! }]}"#).unwrap();
//!
//! let mut device = Device::new("DEVICE_ID");
//! device.add_state(Box::new(PowerState::from_catalog(&catalog).unwrap()));
//!
//! let command_ids = device.set_state("power", &json!(true));
//! let queued = device.drain_commands(); // handed to a transport
//! # let _ = (command_ids, queued);
//! ```
//!
pub mod catalog;
pub mod device;
pub mod error;
pub mod iot;
pub mod mode;
pub mod opcodes;
pub mod state;
pub mod states;

pub use catalog::{CatalogEntry, StateCatalog, ValueRange};
pub use device::Device;
pub use error::{GoveeError, Result};
pub use iot::{
    IotConfig, IotCoordinator, IotEvent, OutboundEnvelope, PendingCommand, flatten_envelope,
};
pub use mode::{ModeDelegate, ModeRole, ModeState};
pub use opcodes::{DEFAULT_FRAME_SIZE, REPORT_OPCODE, as_opcode, assemble_command};
pub use state::{
    AnyState, BoundedStack, ClearEvent, CommandDraft, CommandId, CommandMapping, DeviceState,
    OpIdentifier, ParseStrategy, QueuedCommand, StateLogic,
};
pub use states::{BrightnessState, ColorRgbState, HumidityState, PowerState, Rgb};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
