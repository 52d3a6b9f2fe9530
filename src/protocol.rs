//! Wire format shared with the ADR server.
//!
//! Inbound frames are JSON objects with optional `temps`, `instruments` and
//! `log` keys. Every other key is a top-level scalar merged into state.
//! Outbound frames are `{"command": <name>, ...args}`.

use anyhow::{anyhow, Result};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One sensor value as sent by the server.
///
/// The server writes NaN as `null`. Anything that is neither a number nor a
/// numeric string is kept verbatim so the gauge can still show it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(f64),
    Missing,
    Raw(String),
}

impl Reading {
    pub fn as_f64(&self) -> f64 {
        match self {
            Reading::Value(v) => *v,
            _ => f64::NAN,
        }
    }

    /// Finite numeric value, if any.
    pub fn finite(&self) -> Option<f64> {
        match self {
            Reading::Value(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for Reading {
    fn from(v: f64) -> Self {
        if v.is_nan() {
            Reading::Missing
        } else {
            Reading::Value(v)
        }
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(match raw {
            Value::Null => Reading::Missing,
            Value::Number(n) => n.as_f64().map(Reading::Value).unwrap_or(Reading::Missing),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(v) if v.is_nan() => Reading::Missing,
                Ok(v) => Reading::Value(v),
                Err(_) => Reading::Raw(s),
            },
            other => Reading::Raw(other.to_string()),
        })
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Value(v) if v.is_finite() => serializer.serialize_f64(*v),
            Reading::Value(_) | Reading::Missing => serializer.serialize_none(),
            Reading::Raw(s) => serializer.serialize_str(s),
        }
    }
}

/// A batch of temperature samples as parallel columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TempBatch {
    /// Seconds since the Unix epoch.
    #[serde(rename = "timeStamps", default)]
    pub timestamps: Vec<f64>,
    #[serde(rename = "t60K", default)]
    pub t60k: Vec<Reading>,
    #[serde(rename = "t03K", default)]
    pub t03k: Vec<Reading>,
    #[serde(rename = "tGGG", default)]
    pub tggg: Vec<Reading>,
    #[serde(rename = "tFAA", default)]
    pub tfaa: Vec<Reading>,
}

impl TempBatch {
    /// Number of complete rows. Ragged batches are cut to the shortest column.
    pub fn rows(&self) -> usize {
        [
            self.timestamps.len(),
            self.t60k.len(),
            self.t03k.len(),
            self.tggg.len(),
            self.tfaa.len(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    pub fn is_ragged(&self) -> bool {
        let n = self.timestamps.len();
        [self.t60k.len(), self.t03k.len(), self.tggg.len(), self.tfaa.len()]
            .iter()
            .any(|len| *len != n)
    }

    pub fn push_row(&mut self, ts: f64, values: [Reading; 4]) {
        let [t60k, t03k, tggg, tfaa] = values;
        self.timestamps.push(ts);
        self.t60k.push(t60k);
        self.t03k.push(t03k);
        self.tggg.push(tggg);
        self.tfaa.push(tfaa);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentFlags {
    /// The instrument's server process is running.
    #[serde(default)]
    pub server: bool,
    /// The device behind that server is connected.
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Seconds since the Unix epoch.
    pub datetime: f64,
    pub message: String,
    #[serde(default)]
    pub alert: bool,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundFrame {
    pub temps: Option<TempBatch>,
    pub instruments: Option<Vec<(String, InstrumentFlags)>>,
    pub log: Option<Vec<LogRecord>>,
    /// Everything else, merged into top-level state.
    pub scalars: Map<String, Value>,
}

pub fn parse_frame(text: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    frame_from_value(value)
}

pub fn frame_from_value(value: Value) -> Result<InboundFrame> {
    let mut fields = match value {
        Value::Object(map) => map,
        other => return Err(anyhow!("frame is not an object: {}", type_name(&other))),
    };

    let temps = match fields.remove("temps") {
        Some(v) => Some(serde_json::from_value::<TempBatch>(v)?),
        None => None,
    };
    let instruments = match fields.remove("instruments") {
        Some(Value::Object(map)) => {
            let mut out = Vec::with_capacity(map.len());
            for (name, flags) in map {
                out.push((name, serde_json::from_value::<InstrumentFlags>(flags)?));
            }
            Some(out)
        }
        Some(other) => return Err(anyhow!("instruments is not an object: {}", type_name(&other))),
        None => None,
    };
    let log = match fields.remove("log") {
        Some(v) => Some(serde_json::from_value::<Vec<LogRecord>>(v)?),
        None => None,
    };

    Ok(InboundFrame {
        temps,
        instruments,
        log,
        scalars: fields,
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outbound operator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "Open Heat Switch")]
    OpenHeatSwitch,
    #[serde(rename = "Close Heat Switch")]
    CloseHeatSwitch,
    #[serde(rename = "Mag Up")]
    MagUp,
    #[serde(rename = "Stop Magging Up")]
    StopMaggingUp,
    #[serde(rename = "Regulate")]
    Regulate { temp: f64 },
    #[serde(rename = "Stop Regulating")]
    StopRegulating,
    #[serde(rename = "Set Compressor State")]
    SetCompressorState { on: bool },
    #[serde(rename = "Refresh Instruments")]
    RefreshInstruments,
    #[serde(rename = "Add To Log")]
    AddToLog { text: String },
    #[serde(rename = "Get Temperature Data")]
    GetTemperatureData { minutes: u32 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenHeatSwitch => "Open Heat Switch",
            Command::CloseHeatSwitch => "Close Heat Switch",
            Command::MagUp => "Mag Up",
            Command::StopMaggingUp => "Stop Magging Up",
            Command::Regulate { .. } => "Regulate",
            Command::StopRegulating => "Stop Regulating",
            Command::SetCompressorState { .. } => "Set Compressor State",
            Command::RefreshInstruments => "Refresh Instruments",
            Command::AddToLog { .. } => "Add To Log",
            Command::GetTemperatureData { .. } => "Get Temperature Data",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
