//! Concrete state logics backed by the catalog.
//! Covers the common typed capabilities: power, brightness, RGB color, and
//! a read-only humidity sensor.

use crate::catalog::{StateCatalog, ValueRange};
use crate::error::Result;
use crate::opcodes::REPORT_OPCODE;
use crate::state::{
    CommandDraft, CommandMapping, DeviceState, OpIdentifier, ParseStrategy, StateLogic,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Boolean power state.
pub struct PowerLogic {
    command_opcode: u8,
    status_opcode: u8,
}

pub type PowerState = DeviceState<PowerLogic>;

impl StateLogic for PowerLogic {
    type Value = bool;

    fn to_command(&self, next: &bool) -> Option<CommandMapping> {
        let byte = u8::from(*next);
        let draft =
            CommandDraft::new("turn", self.command_opcode, &[self.status_opcode, byte]).ok()?;
        Some(CommandMapping::new(
            draft,
            vec![
                json!({"state": {"power": next}}),
                json!({"op": {"command": [[REPORT_OPCODE, self.status_opcode, byte]]}}),
            ],
        ))
    }

    fn parse_state(&self, data: &Value) -> Option<bool> {
        let state = data.get("state")?;
        // Firmware revisions disagree on the flag's key.
        for key in ["power", "isOn", "onOff"] {
            match state.get(key) {
                Some(Value::Bool(flag)) => return Some(*flag),
                Some(Value::Number(n)) => match n.as_i64() {
                    Some(0) => return Some(false),
                    Some(1) => return Some(true),
                    _ => {}
                },
                _ => {}
            }
        }
        None
    }

    fn parse_op_command(&self, frame: &[u8]) -> Option<bool> {
        match *frame.get(2)? {
            0x00 => Some(false),
            0x01 => Some(true),
            _ => None,
        }
    }
}

impl DeviceState<PowerLogic> {
    pub fn from_catalog(catalog: &StateCatalog) -> Result<Self> {
        let entry = catalog.entry("power")?;
        let ident = OpIdentifier::from_catalog(entry)?;
        let logic = PowerLogic {
            command_opcode: entry.command_opcode_byte()?,
            status_opcode: entry.status_opcode_byte()?,
        };
        Ok(DeviceState::new(
            "power",
            ParseStrategy::OpCode {
                ident,
                with_state: true,
            },
            logic,
        ))
    }
}

/// Brightness percentage with catalog-declared bounds.
pub struct BrightnessLogic {
    command_opcode: u8,
    status_opcode: u8,
    range: ValueRange,
}

pub type BrightnessState = DeviceState<BrightnessLogic>;

impl StateLogic for BrightnessLogic {
    type Value = u8;

    fn to_command(&self, next: &u8) -> Option<CommandMapping> {
        if !self.range.contains(i64::from(*next)) {
            return None;
        }
        let draft = CommandDraft::new(
            "brightness",
            self.command_opcode,
            &[self.status_opcode, *next],
        )
        .ok()?;
        Some(CommandMapping::new(
            draft,
            vec![
                json!({"state": {"brightness": next}}),
                json!({"op": {"command": [[REPORT_OPCODE, self.status_opcode, *next]]}}),
            ],
        ))
    }

    fn parse_state(&self, data: &Value) -> Option<u8> {
        let brightness = data.get("state")?.get("brightness")?.as_i64()?;
        if self.range.contains(brightness) {
            u8::try_from(brightness).ok()
        } else {
            None
        }
    }

    fn parse_op_command(&self, frame: &[u8]) -> Option<u8> {
        let brightness = *frame.get(2)?;
        self.range.contains(i64::from(brightness)).then_some(brightness)
    }
}

impl DeviceState<BrightnessLogic> {
    pub fn from_catalog(catalog: &StateCatalog) -> Result<Self> {
        let entry = catalog.entry("brightness")?;
        let ident = OpIdentifier::from_catalog(entry)?;
        let logic = BrightnessLogic {
            command_opcode: entry.command_opcode_byte()?,
            status_opcode: entry.status_opcode_byte()?,
            range: entry.range.unwrap_or(ValueRange { min: 0, max: 100 }),
        };
        Ok(DeviceState::new(
            "brightness",
            ParseStrategy::OpCode {
                ident,
                with_state: true,
            },
            logic,
        ))
    }
}

/// An RGB color triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Whole-device RGB color state.
pub struct ColorRgbLogic {
    command_opcode: u8,
    status_opcode: u8,
}

pub type ColorRgbState = DeviceState<ColorRgbLogic>;

impl StateLogic for ColorRgbLogic {
    type Value = Rgb;

    fn to_command(&self, next: &Rgb) -> Option<CommandMapping> {
        let draft = CommandDraft::new(
            "color",
            self.command_opcode,
            &[self.status_opcode, next.red, next.green, next.blue],
        )
        .ok()?;
        Some(CommandMapping::new(
            draft,
            vec![
                json!({"state": {"color": next}}),
                json!({"op": {"command": [[
                    REPORT_OPCODE,
                    self.status_opcode,
                    next.red,
                    next.green,
                    next.blue,
                ]]}}),
            ],
        ))
    }

    fn parse_state(&self, data: &Value) -> Option<Rgb> {
        let color = data.get("state")?.get("color")?;
        serde_json::from_value(color.clone()).ok()
    }

    fn parse_op_command(&self, frame: &[u8]) -> Option<Rgb> {
        match frame {
            [_, _, red, green, blue, ..] => Some(Rgb {
                red: *red,
                green: *green,
                blue: *blue,
            }),
            _ => None,
        }
    }
}

impl DeviceState<ColorRgbLogic> {
    pub fn from_catalog(catalog: &StateCatalog) -> Result<Self> {
        let entry = catalog.entry("color_rgb")?;
        let ident = OpIdentifier::from_catalog(entry)?;
        let logic = ColorRgbLogic {
            command_opcode: entry.command_opcode_byte()?,
            status_opcode: entry.status_opcode_byte()?,
        };
        Ok(DeviceState::new(
            "color",
            ParseStrategy::OpCode {
                ident,
                with_state: true,
            },
            logic,
        ))
    }
}

/// Read-only relative humidity sensor; any write is a no-op.
pub struct HumidityLogic;

pub type HumidityState = DeviceState<HumidityLogic>;

impl StateLogic for HumidityLogic {
    type Value = f64;

    fn parse_state(&self, data: &Value) -> Option<f64> {
        let state = data.get("state")?;
        state
            .get("humidity")
            .or_else(|| state.get("currentHumidity"))?
            .as_f64()
    }
}

impl DeviceState<HumidityLogic> {
    pub fn sensor() -> Self {
        DeviceState::new("humidity", ParseStrategy::StateOnly, HumidityLogic)
    }
}
