//! Device settings mirror.
//!
//! The engine never owns the UI's settings store; it hands decoded
//! [`SettingsPatch`]es to a [`SettingsSink`]. [`SettingsStore`] is the
//! in-memory sink used by the CLI and the tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Eye/mouth appearance parameters, keyed on the wire by two-letter names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    pub ew: f64,
    pub eh: f64,
    pub es: f64,
    pub er: f64,
    pub mw: f64,
    pub lt: f64,
    pub vt: f64,
    pub bi: f64,
    /// Gaze speed.
    pub gs: f64,
    /// Openness speed.
    pub os: f64,
    /// Squish speed.
    pub ss: f64,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            ew: 36.0,
            eh: 36.0,
            es: 10.0,
            er: 8.0,
            mw: 20.0,
            lt: 1000.0,
            vt: 2000.0,
            bi: 3.0,
            gs: 6.0,
            os: 12.0,
            ss: 10.0,
        }
    }
}

impl Appearance {
    /// Set a parameter by wire key. Returns false for unknown keys.
    pub fn set(&mut self, key: &str, value: f64) -> bool {
        let slot = match key {
            "ew" => &mut self.ew,
            "eh" => &mut self.eh,
            "es" => &mut self.es,
            "er" => &mut self.er,
            "mw" => &mut self.mw,
            "lt" => &mut self.lt,
            "vt" => &mut self.vt,
            "bi" => &mut self.bi,
            "gs" => &mut self.gs,
            "os" => &mut self.os,
            "ss" => &mut self.ss,
            _ => return false,
        };
        *slot = value;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Controller model, `sh1106` or `ssd1306`.
    #[serde(rename = "type")]
    pub kind: String,
    /// I2C address as reported, e.g. `0x3c`.
    pub addr: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            kind: "sh1106".into(),
            addr: "0x3c".into(),
        }
    }
}

/// Gesture name to expression action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureMapping {
    pub name: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureSettings {
    pub matching: bool,
    pub reaction_time: f64,
    pub confidence: f64,
    pub cooldown: f64,
    pub mappings: Vec<GestureMapping>,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            matching: false,
            reaction_time: 1500.0,
            confidence: 70.0,
            cooldown: 2000.0,
            mappings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleSettings {
    pub enabled: bool,
    pub expr_min: u32,
    pub expr_max: u32,
    pub neutral_min: u32,
    pub neutral_max: u32,
}

impl Default for ShuffleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expr_min: 2,
            expr_max: 5,
            neutral_min: 2,
            neutral_max: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathingSettings {
    pub enabled: bool,
    pub intensity: f64,
    pub speed: f64,
}

impl Default for BreathingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            intensity: 0.08,
            speed: 0.3,
        }
    }
}

/// Everything the host mirrors from the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub appearance: Appearance,
    pub display: DisplayConfig,
    pub gesture: GestureSettings,
    pub shuffle: ShuffleSettings,
    pub breathing: BreathingSettings,
    /// BLE low-power transmission mode.
    pub low_power: bool,
    pub last_status: String,
    pub last_gesture: String,
}

/// Fields decoded from one status payload. `None` means "not mentioned".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub appearance: BTreeMap<String, f64>,
    pub display_kind: Option<String>,
    pub display_addr: Option<String>,
    pub gesture_matching: Option<bool>,
    pub gesture_reaction_time: Option<f64>,
    pub gesture_confidence: Option<f64>,
    pub gesture_cooldown: Option<f64>,
    /// Complete mapping list; replaces the previous one.
    pub gesture_mappings: Option<Vec<GestureMapping>>,
    pub shuffle_enabled: Option<bool>,
    pub shuffle_expr_min: Option<u32>,
    pub shuffle_expr_max: Option<u32>,
    pub shuffle_neutral_min: Option<u32>,
    pub shuffle_neutral_max: Option<u32>,
    pub breathing_enabled: Option<bool>,
    pub breathing_intensity: Option<f64>,
    pub breathing_speed: Option<f64>,
    pub low_power: Option<bool>,
    pub last_status: Option<String>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SettingsSnapshot {
    /// Write every field the patch mentions; leave the rest alone.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        for (key, value) in &patch.appearance {
            self.appearance.set(key, *value);
        }
        if let Some(v) = &patch.display_kind {
            self.display.kind = v.clone();
        }
        if let Some(v) = &patch.display_addr {
            self.display.addr = v.clone();
        }
        if let Some(v) = patch.gesture_matching {
            self.gesture.matching = v;
        }
        if let Some(v) = patch.gesture_reaction_time {
            self.gesture.reaction_time = v;
        }
        if let Some(v) = patch.gesture_confidence {
            self.gesture.confidence = v;
        }
        if let Some(v) = patch.gesture_cooldown {
            self.gesture.cooldown = v;
        }
        if let Some(v) = &patch.gesture_mappings {
            self.gesture.mappings = v.clone();
        }
        if let Some(v) = patch.shuffle_enabled {
            self.shuffle.enabled = v;
        }
        if let Some(v) = patch.shuffle_expr_min {
            self.shuffle.expr_min = v;
        }
        if let Some(v) = patch.shuffle_expr_max {
            self.shuffle.expr_max = v;
        }
        if let Some(v) = patch.shuffle_neutral_min {
            self.shuffle.neutral_min = v;
        }
        if let Some(v) = patch.shuffle_neutral_max {
            self.shuffle.neutral_max = v;
        }
        if let Some(v) = patch.breathing_enabled {
            self.breathing.enabled = v;
        }
        if let Some(v) = patch.breathing_intensity {
            self.breathing.intensity = v;
        }
        if let Some(v) = patch.breathing_speed {
            self.breathing.speed = v;
        }
        if let Some(v) = patch.low_power {
            self.low_power = v;
        }
        if let Some(v) = &patch.last_status {
            self.last_status = v.clone();
        }
    }
}

/// Destination for decoded device state.
pub trait SettingsSink: Send + Sync {
    /// Apply a partial update.
    fn apply(&self, patch: &SettingsPatch);

    /// Publish the most recent gesture event.
    fn set_last_gesture(&self, gesture: &str);

    /// Current values, used by the engine to read the power mode.
    fn snapshot(&self) -> SettingsSnapshot;
}

/// In-memory settings sink.
#[derive(Debug, Default)]
pub struct SettingsStore {
    inner: Mutex<SettingsSnapshot>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: SettingsSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SettingsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SettingsSink for SettingsStore {
    fn apply(&self, patch: &SettingsPatch) {
        self.lock().apply(patch);
    }

    fn set_last_gesture(&self, gesture: &str) {
        self.lock().last_gesture = gesture.to_string();
    }

    fn snapshot(&self) -> SettingsSnapshot {
        self.lock().clone()
    }
}
