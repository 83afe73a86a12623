//! State catalog definitions.
//! A read-only catalog maps state names to their opcode metadata, numeric
//! ranges, and command label/payload tables. The catalog is loaded once at
//! startup and passed by reference into state constructors.

use crate::error::{GoveeError, Result};
use crate::opcodes::hex_to_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;

/// Inclusive numeric bounds for a value-carrying state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

impl ValueRange {
    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// A single state definition sourced from the catalog data set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Canonical state name, e.g. `"power"`
    pub state_name: String,
    /// Opcode family of inbound reports for this state, e.g. `"0xAA"`
    pub op_type: String,
    /// Identifier byte distinguishing this state within report frames
    pub status_opcode: String,
    /// Opcode used for outbound write frames, e.g. `"0x33"`
    pub command_opcode: String,
    /// Command label to payload-hex table (mode tables, discrete commands)
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    /// Numeric bounds, when the state carries a bounded number
    #[serde(default)]
    pub range: Option<ValueRange>,
}

impl CatalogEntry {
    pub fn op_type_byte(&self) -> Result<u8> {
        single_byte(&self.op_type)
    }

    pub fn status_opcode_byte(&self) -> Result<u8> {
        single_byte(&self.status_opcode)
    }

    pub fn command_opcode_byte(&self) -> Result<u8> {
        single_byte(&self.command_opcode)
    }

    /// Decode the payload bytes registered for a command label.
    pub fn command_payload(&self, label: &str) -> Option<Vec<u8>> {
        let hex = self.commands.get(label)?;
        hex_to_bytes(hex).ok()
    }
}

fn single_byte(hex: &str) -> Result<u8> {
    let bytes = hex_to_bytes(hex)?;
    match bytes.as_slice() {
        [byte] => Ok(*byte),
        _ => Err(GoveeError::InvalidOpcode(hex.to_string())),
    }
}

/// Collection of parsed state definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCatalog {
    pub states: Vec<CatalogEntry>,
}

impl StateCatalog {
    /// Parse a catalog from JSON text.
    pub fn from_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a catalog from an already-deserialized JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Read and parse a catalog, e.g. from a file handle.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut buffered = String::new();
        reader.read_to_string(&mut buffered)?;
        Self::from_str(&buffered)
    }

    /// Look up a state entry by name.
    pub fn get(&self, state_name: &str) -> Option<&CatalogEntry> {
        self.states
            .iter()
            .find(|entry| entry.state_name == state_name)
    }

    /// Look up a state entry by name, failing when it is absent.
    pub fn entry(&self, state_name: &str) -> Result<&CatalogEntry> {
        self.get(state_name)
            .ok_or_else(|| GoveeError::CatalogMiss(state_name.to_string()))
    }
}
