//! Property-based tests for status reassembly.
//!
//! A structured record must decode to the same settings no matter how the
//! link fragments it, and must only touch the fields it mentions.

use leor_link::{SettingsSnapshot, StatusParser};
use proptest::prelude::*;

const SYNC_RECORD: &str = r#"{"type":"sync","settings":{"ew":40,"eh":32,"ss":12.5},"display":{"type":"ssd1306","addr":"0x3d"},"state":{"shuf":0},"shuffle":{"emin":3,"emax":7,"nmin":1,"nmax":4},"breathing":{"on":1,"i":0.1,"s":0.5},"power":{"lp":1},"gesture":{"gm":1,"rt":900,"cf":80,"cd":1500,"map":[{"n":"patpat","a":"happy"},{"n":"shake","a":"dizzy {x}"}]}}"#;

const APPEARANCE_KEYS: [&str; 11] = ["ew", "eh", "es", "er", "mw", "lt", "vt", "bi", "gs", "os", "ss"];

fn feed_all(fragments: &[&[u8]]) -> SettingsSnapshot {
    let mut parser = StatusParser::new();
    let mut snap = SettingsSnapshot::default();
    for fragment in fragments {
        if let Some(patch) = parser.feed(fragment).patch() {
            snap.apply(patch);
        }
    }
    snap
}

/// Split `bytes` at the given (sorted, deduplicated) cut points.
fn split_at_points<'a>(bytes: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        if cut > start && cut < bytes.len() {
            out.push(&bytes[start..cut]);
            start = cut;
        }
    }
    out.push(&bytes[start..]);
    out
}

#[test]
fn every_single_split_matches_unsplit() {
    let bytes = SYNC_RECORD.as_bytes();
    let expected = feed_all(&[bytes]);
    assert_eq!(expected.last_status, "Sync complete");
    assert_eq!(expected.gesture.mappings.len(), 2);

    for cut in 1..bytes.len() {
        let (head, tail) = bytes.split_at(cut);
        assert_eq!(feed_all(&[head, tail]), expected, "split at byte {}", cut);
    }
}

proptest! {
    /// Arbitrary multi-way fragmentation reassembles to the same settings.
    #[test]
    fn fragmentation_is_invisible(mut cuts in prop::collection::vec(1usize..SYNC_RECORD.len(), 0..12)) {
        cuts.sort_unstable();
        cuts.dedup();
        let bytes = SYNC_RECORD.as_bytes();
        let fragments = split_at_points(bytes, &cuts);
        prop_assert_eq!(feed_all(&fragments), feed_all(&[bytes]));
    }

    /// Fields absent from a record keep their previous values.
    #[test]
    fn partial_record_leaves_other_fields(
        picks in prop::collection::vec(prop::option::of(0u32..4000), APPEARANCE_KEYS.len()),
        low_power in any::<bool>(),
    ) {
        let values: Vec<(&str, u32)> = APPEARANCE_KEYS
            .iter()
            .zip(&picks)
            .filter_map(|(k, v)| v.map(|v| (*k, v)))
            .collect();
        let settings: Vec<String> = values.iter().map(|(k, v)| format!("\"{}\":{}", k, v)).collect();
        let record = format!(
            r#"{{"type":"sync","settings":{{{}}},"power":{{"lp":{}}}}}"#,
            settings.join(","),
            u8::from(low_power)
        );
        let snap = feed_all(&[record.as_bytes()]);

        let mut expected = SettingsSnapshot::default();
        for (key, value) in &values {
            expected.appearance.set(key, f64::from(*value));
        }
        expected.low_power = low_power;
        expected.last_status = "Sync complete".to_string();
        prop_assert_eq!(snap, expected);
    }

    /// A legacy line after an undecodable payload is still read as a line.
    #[test]
    fn legacy_line_after_dead_payload(ew in 1u32..200) {
        let line = format!("ew={}", ew);
        let snap = feed_all(&[br#"{"type":"sync",}"#, line.as_bytes()]);
        prop_assert_eq!(snap.appearance.ew, f64::from(ew));
    }
}

#[test]
fn mapping_list_replaces_previous_set() {
    let snap = feed_all(&[
        SYNC_RECORD.as_bytes(),
        br#"[{"n":"tap","a":"blink"}]"#,
    ]);
    assert_eq!(snap.gesture.mappings.len(), 1);
    assert_eq!(snap.gesture.mappings[0].name, "tap");
    assert_eq!(snap.gesture.mappings[0].action, "blink");
}

#[test]
fn legacy_line_updates_in_one_pass() {
    let snap = feed_all(&[b"ew=40 shuffle: ON expr=3-7"]);
    assert_eq!(snap.appearance.ew, 40.0);
    assert!(snap.shuffle.enabled);
    assert_eq!((snap.shuffle.expr_min, snap.shuffle.expr_max), (3, 7));
    // Untouched.
    assert_eq!(snap.shuffle.neutral_min, 2);
    assert_eq!(snap.appearance.eh, 36.0);
}

#[test]
fn mistyped_field_keeps_rest_of_record() {
    let mut parser = StatusParser::new();
    let mut snap = SettingsSnapshot::default();
    let record = br#"{"type":"sync","settings":{"ew":44},"display":{"addr":60}}"#;
    if let Some(patch) = parser.feed(record).patch() {
        snap.apply(patch);
    }
    assert_eq!(snap.appearance.ew, 44.0);
    assert_eq!(snap.display, SettingsSnapshot::default().display);
    assert_eq!(snap.last_status, "Sync complete");
    assert!(parser.buffer().is_empty());
}
