//! Backend command model
//!
//! A command is a JSON object. Only `type` and `unit` matter to the gateway;
//! every field, including unknown ones, is passed through in its original
//! order.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

/// Known command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Aim,
    Fmw,
    App,
    Cdn,
    Cfg,
    Cts,
    Wfi,
    Scs,
    Uds,
    Frs,
    Img,
    Rsr,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Aim => "AIM",
            CommandType::Fmw => "FMW",
            CommandType::App => "APP",
            CommandType::Cdn => "CDN",
            CommandType::Cfg => "CFG",
            CommandType::Cts => "CTS",
            CommandType::Wfi => "WFI",
            CommandType::Scs => "SCS",
            CommandType::Uds => "UDS",
            CommandType::Frs => "FRS",
            CommandType::Img => "IMG",
            CommandType::Rsr => "RSR",
        }
    }

    /// Retaining commands expect a reply over the Backend socket, so the
    /// sending connection is recorded for their unit.
    pub fn is_retaining(&self) -> bool {
        matches!(self, CommandType::Scs | CommandType::Uds)
    }
}

impl FromStr for CommandType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AIM" => Ok(CommandType::Aim),
            "FMW" => Ok(CommandType::Fmw),
            "APP" => Ok(CommandType::App),
            "CDN" => Ok(CommandType::Cdn),
            "CFG" => Ok(CommandType::Cfg),
            "CTS" => Ok(CommandType::Cts),
            "WFI" => Ok(CommandType::Wfi),
            "SCS" => Ok(CommandType::Scs),
            "UDS" => Ok(CommandType::Uds),
            "FRS" => Ok(CommandType::Frs),
            "IMG" => Ok(CommandType::Img),
            "RSR" => Ok(CommandType::Rsr),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a command affects the connection registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention<'a> {
    /// Retaining command naming a unit: associate it with the sender
    Associate(&'a str),
    /// Retaining command without a unit: nothing to associate
    MissingUnit,
    /// Non-retaining command
    None,
}

/// A decoded Backend command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    fields: Map<String, Value>,
}

impl Command {
    /// Decode a single JSON object
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)?;
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode every JSON document in a chunk, in order
    ///
    /// Whitespace between documents is allowed. The chunk is accepted or
    /// rejected as a whole: one malformed document discards all of it.
    pub fn from_chunk(bytes: &[u8]) -> Result<Vec<Self>> {
        let text = std::str::from_utf8(bytes)?;

        let commands = serde_json::Deserializer::from_str(text)
            .into_iter::<Value>()
            .map(|value| Self::from_value(value?))
            .collect::<Result<Vec<_>>>()?;

        if commands.is_empty() {
            return Err(GatewayError::Protocol("empty message".to_string()));
        }
        Ok(commands)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(GatewayError::Protocol(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Raw `type` field, if it is a string
    pub fn type_name(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }

    /// Parsed `type` field; unknown types yield `None`
    pub fn kind(&self) -> Option<CommandType> {
        self.type_name().and_then(|t| t.parse().ok())
    }

    /// `unit` field; absent, non-string and empty values count as missing
    pub fn unit(&self) -> Option<&str> {
        self.fields
            .get("unit")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn camera(&self) -> Option<&str> {
        self.fields.get("camera").and_then(Value::as_str)
    }

    pub fn is_retaining(&self) -> bool {
        self.kind().is_some_and(|k| k.is_retaining())
    }

    pub fn retention(&self) -> Retention<'_> {
        if !self.is_retaining() {
            return Retention::None;
        }
        match self.unit() {
            Some(unit) => Retention::Associate(unit),
            None => Retention::MissingUnit,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize back to compact JSON with fields unchanged
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
