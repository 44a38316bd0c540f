//! Legacy free-text status grammar.
//!
//! Older firmware answers each query with short lines such as
//! `ew=36 eh=36 es=10`, `shuffle: ON expr=2-5 neutral=2-5`,
//! `br:on i=0.08 s=0.3` or `ble:lp=1`. Every pattern is scanned
//! independently, so one line can update several fields.

use std::sync::OnceLock;

use regex::Regex;

use crate::settings::SettingsPatch;

/// Numeric `key=value` parameters.
const PARAM_PATTERN: &str = r"\b(ew|eh|es|er|mw|lt|vt|bi|gs|os|ss|rt|cf|cd|gm)=(\d+(?:\.\d+)?)";

pub struct LegacyGrammar {
    param: Regex,
    shuffle: Regex,
    expr: Regex,
    neutral: Regex,
    breathing: Regex,
    power: Regex,
}

impl LegacyGrammar {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            param: Regex::new(PARAM_PATTERN)?,
            shuffle: Regex::new(r"(?i)shuffle:\s*(on|off)")?,
            expr: Regex::new(r"expr=(\d+)-(\d+)")?,
            neutral: Regex::new(r"neutral=(\d+)-(\d+)")?,
            breathing: Regex::new(r"br:(on|off)\s+i=([\d.]+)\s+s=([\d.]+)")?,
            power: Regex::new(r"ble:lp=(\d)")?,
        })
    }

    /// Process-wide compiled grammar.
    pub fn shared() -> &'static LegacyGrammar {
        static GRAMMAR: OnceLock<LegacyGrammar> = OnceLock::new();
        GRAMMAR.get_or_init(|| LegacyGrammar::compile().expect("legacy status patterns are valid"))
    }

    /// Scan one line. The line itself becomes the last status.
    pub fn scan(&self, line: &str) -> SettingsPatch {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut patch = SettingsPatch {
            last_status: Some(line.to_string()),
            ..Default::default()
        };

        let mut seen = Vec::new();
        for caps in self.param.captures_iter(line) {
            let Some(key) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            // First occurrence of a key wins.
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let Ok(value) = caps[2].parse::<f64>() else {
                continue;
            };
            match key {
                "rt" => patch.gesture_reaction_time = Some(value),
                "cf" => patch.gesture_confidence = Some(value),
                "cd" => patch.gesture_cooldown = Some(value),
                "gm" => patch.gesture_matching = Some(value == 1.0),
                _ => {
                    patch.appearance.insert(key.to_string(), value);
                }
            }
        }

        if let Some(caps) = self.power.captures(line) {
            patch.low_power = Some(&caps[1] == "1");
        }

        if let Some(caps) = self.shuffle.captures(line) {
            patch.shuffle_enabled = Some(caps[1].eq_ignore_ascii_case("on"));
        }

        if let Some((min, max)) = range(&self.expr, line) {
            patch.shuffle_expr_min = Some(min);
            patch.shuffle_expr_max = Some(max);
        }

        if let Some((min, max)) = range(&self.neutral, line) {
            patch.shuffle_neutral_min = Some(min);
            patch.shuffle_neutral_max = Some(max);
        }

        if let Some(caps) = self.breathing.captures(line) {
            patch.breathing_enabled = Some(&caps[1] == "on");
            patch.breathing_intensity = caps[2].parse().ok();
            patch.breathing_speed = caps[3].parse().ok();
        }

        patch
    }
}

fn range(pattern: &Regex, line: &str) -> Option<(u32, u32)> {
    let caps = pattern.captures(line)?;
    let min = caps[1].parse().ok()?;
    let max = caps[2].parse().ok()?;
    Some((min, max))
}
