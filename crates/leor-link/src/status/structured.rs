//! Structured sync record.
//!
//! ```text
//! {"type":"sync",
//!  "settings":{"ew":36,"eh":36,...},
//!  "display":{"type":"sh1106","addr":"0x3c"},
//!  "state":{"shuf":1},
//!  "shuffle":{"emin":2,"emax":5,"nmin":2,"nmax":5},
//!  "breathing":{"on":1,"i":0.08,"s":0.3},
//!  "power":{"lp":0},
//!  "gesture":{"gm":1,"rt":1500,"cf":70,"cd":2000,"map":[{"n":"patpat","a":"happy"}]}}
//! ```
//!
//! Every sub-record and every key is optional. Unknown keys are ignored,
//! and a known key holding a value of the wrong type is dropped on its
//! own without losing the rest of the record.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::protocol::constants::SYNC_RECORD_TYPE;
use crate::settings::{GestureMapping, SettingsPatch};

/// Decode a field, treating a value of the wrong shape as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            debug!(error = %e, "Ignoring malformed status field");
            Ok(None)
        }
    }
}

/// Decode a list, keeping only the entries that decode.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    Ok(Some(
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
    ))
}

/// Boolean sent either as JSON bool or as 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Toggle {
    Flag(bool),
    Level(i64),
}

impl Toggle {
    pub fn is_on(&self) -> bool {
        match self {
            Toggle::Flag(b) => *b,
            Toggle::Level(n) => *n == 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayRecord {
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub shuf: Option<Toggle>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ShuffleRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub emin: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub emax: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub nmin: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub nmax: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BreathingRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub on: Option<Toggle>,
    #[serde(default, deserialize_with = "lenient")]
    pub i: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PowerRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub lp: Option<Toggle>,
}

/// One `{n, a}` entry of a gesture mapping list.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntry {
    pub n: String,
    #[serde(default)]
    pub a: String,
}

impl From<MappingEntry> for GestureMapping {
    fn from(entry: MappingEntry) -> Self {
        GestureMapping {
            name: entry.n,
            action: entry.a,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GestureRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub gm: Option<Toggle>,
    #[serde(default, deserialize_with = "lenient")]
    pub rt: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub cf: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub cd: Option<f64>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub map: Option<Vec<MappingEntry>>,
}

/// Top-level status record.
#[derive(Debug, Default, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub settings: Option<BTreeMap<String, Value>>,
    #[serde(default, deserialize_with = "lenient")]
    pub display: Option<DisplayRecord>,
    #[serde(default, deserialize_with = "lenient")]
    pub state: Option<StateRecord>,
    #[serde(default, deserialize_with = "lenient")]
    pub shuffle: Option<ShuffleRecord>,
    #[serde(default, deserialize_with = "lenient")]
    pub breathing: Option<BreathingRecord>,
    #[serde(default, deserialize_with = "lenient")]
    pub power: Option<PowerRecord>,
    #[serde(default, deserialize_with = "lenient")]
    pub gesture: Option<GestureRecord>,
}

impl StatusRecord {
    pub fn is_sync(&self) -> bool {
        self.kind.as_deref() == Some(SYNC_RECORD_TYPE)
    }

    /// Collect the fields this record mentions.
    pub fn into_patch(self) -> SettingsPatch {
        let mut patch = SettingsPatch::default();

        if let Some(settings) = self.settings {
            for (key, value) in settings {
                if let Some(v) = value.as_f64() {
                    patch.appearance.insert(key, v);
                }
            }
        }
        if let Some(display) = self.display {
            patch.display_kind = display.kind;
            patch.display_addr = display.addr;
        }
        if let Some(state) = self.state {
            patch.shuffle_enabled = state.shuf.map(|t| t.is_on());
        }
        if let Some(shuffle) = self.shuffle {
            patch.shuffle_expr_min = shuffle.emin;
            patch.shuffle_expr_max = shuffle.emax;
            patch.shuffle_neutral_min = shuffle.nmin;
            patch.shuffle_neutral_max = shuffle.nmax;
        }
        if let Some(breathing) = self.breathing {
            patch.breathing_enabled = breathing.on.map(|t| t.is_on());
            patch.breathing_intensity = breathing.i;
            patch.breathing_speed = breathing.s;
        }
        if let Some(power) = self.power {
            patch.low_power = power.lp.map(|t| t.is_on());
        }
        if let Some(gesture) = self.gesture {
            patch.gesture_matching = gesture.gm.map(|t| t.is_on());
            patch.gesture_reaction_time = gesture.rt;
            patch.gesture_confidence = gesture.cf;
            patch.gesture_cooldown = gesture.cd;
            patch.gesture_mappings = gesture
                .map
                .map(|entries| entries.into_iter().map(GestureMapping::from).collect());
        }
        patch
    }
}

pub fn decode_record(bytes: &[u8]) -> Result<StatusRecord, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Decode a standalone `[{"n":..,"a":..},...]` list.
pub fn decode_mappings(bytes: &[u8]) -> Result<Vec<GestureMapping>, serde_json::Error> {
    let entries: Vec<MappingEntry> = serde_json::from_slice(bytes)?;
    Ok(entries.into_iter().map(GestureMapping::from).collect())
}
