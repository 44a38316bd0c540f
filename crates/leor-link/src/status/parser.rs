//! Fragment reassembly and dispatch for the status channel.

use tracing::{debug, warn};

use super::legacy::LegacyGrammar;
use super::structured::{decode_mappings, decode_record};
use crate::protocol::constants::{
    GESTURE_LIST_MARKER, MAX_STATUS_BUFFER, STRUCTURED_CLOSE, STRUCTURED_OPEN, SYNC_COMPLETE_STATUS,
};
use crate::settings::SettingsPatch;

/// Bytes of a structured payload still being reassembled.
///
/// Only ever holds data that began with `{`.
#[derive(Debug, Default, Clone)]
pub struct StatusBuffer {
    bytes: Vec<u8>,
}

impl StatusBuffer {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push(&mut self, fragment: &[u8]) {
        self.bytes.extend_from_slice(fragment);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Object nesting depth at the end of the buffer, ignoring braces
    /// inside string literals.
    fn depth(&self) -> i64 {
        let mut depth = 0i64;
        let mut in_string = false;
        let mut escaped = false;
        for &b in &self.bytes {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                STRUCTURED_OPEN => depth += 1,
                STRUCTURED_CLOSE => depth -= 1,
                _ => {}
            }
        }
        depth
    }

    /// Open payload waiting for more fragments.
    pub fn is_unterminated(&self) -> bool {
        self.bytes.first() == Some(&STRUCTURED_OPEN) && self.depth() > 0
    }

    /// Balanced and ending in the close marker: worth a decode attempt.
    pub fn is_terminated(&self) -> bool {
        let last = self.bytes.iter().rev().find(|b| !b.is_ascii_whitespace());
        last == Some(&STRUCTURED_CLOSE) && self.depth() <= 0
    }
}

/// What one status fragment turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Absorbed into a structured payload that is not decodable yet.
    Pending,
    /// Structured record decoded; `synced` when it was a sync record.
    Structured { patch: SettingsPatch, synced: bool },
    /// Gesture mapping list decoded.
    MappingList(SettingsPatch),
    /// Free-text line scanned with the legacy grammar.
    Legacy(SettingsPatch),
}

impl ParseOutcome {
    /// Fields to write into the settings sink, if any.
    pub fn patch(&self) -> Option<&SettingsPatch> {
        match self {
            ParseOutcome::Pending => None,
            ParseOutcome::Structured { patch, .. }
            | ParseOutcome::MappingList(patch)
            | ParseOutcome::Legacy(patch) => Some(patch),
        }
    }
}

/// Stateful status decoder. One per session.
pub struct StatusParser {
    buffer: StatusBuffer,
    grammar: &'static LegacyGrammar,
}

impl Default for StatusParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusParser {
    pub fn new() -> Self {
        Self {
            buffer: StatusBuffer::default(),
            grammar: LegacyGrammar::shared(),
        }
    }

    pub fn buffer(&self) -> &StatusBuffer {
        &self.buffer
    }

    /// Drop any half-received payload.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Consume one inbound fragment.
    pub fn feed(&mut self, fragment: &[u8]) -> ParseOutcome {
        let continuation = self.buffer.is_unterminated();
        if continuation && self.buffer.len() + fragment.len() > MAX_STATUS_BUFFER {
            // Never going to close; start over with this fragment.
            warn!(
                len = self.buffer.len(),
                limit = MAX_STATUS_BUFFER,
                "Discarding oversized structured payload"
            );
            self.buffer.clear();
            return self.feed(fragment);
        }

        if continuation || fragment.first() == Some(&STRUCTURED_OPEN) {
            if !continuation {
                // A terminated payload that failed to decode is dead.
                self.buffer.clear();
            }
            self.buffer.push(fragment);
            if !self.buffer.is_terminated() {
                return ParseOutcome::Pending;
            }
            return match decode_record(self.buffer.as_bytes()) {
                Ok(record) => {
                    self.buffer.clear();
                    let synced = record.is_sync();
                    let mut patch = if synced {
                        record.into_patch()
                    } else {
                        debug!(kind = ?record.kind, "Ignoring non-sync status record");
                        SettingsPatch::default()
                    };
                    if synced {
                        patch.last_status = Some(SYNC_COMPLETE_STATUS.to_string());
                    }
                    ParseOutcome::Structured { patch, synced }
                }
                Err(e) => {
                    debug!(error = %e, len = self.buffer.len(), "Structured payload not decodable yet");
                    ParseOutcome::Pending
                }
            };
        }

        if fragment.starts_with(GESTURE_LIST_MARKER) {
            match decode_mappings(fragment) {
                Ok(mappings) => {
                    self.buffer.clear();
                    debug!(count = mappings.len(), "Gesture mappings synced");
                    return ParseOutcome::MappingList(SettingsPatch {
                        gesture_mappings: Some(mappings),
                        ..Default::default()
                    });
                }
                Err(e) => warn!(error = %e, "Failed to parse gesture mappings"),
            }
        }

        self.buffer.clear();
        let line = String::from_utf8_lossy(fragment);
        ParseOutcome::Legacy(self.grammar.scan(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsSnapshot;

    fn apply_all(parser: &mut StatusParser, fragments: &[&[u8]]) -> SettingsSnapshot {
        let mut snap = SettingsSnapshot::default();
        for fragment in fragments {
            if let Some(patch) = parser.feed(fragment).patch() {
                snap.apply(patch);
            }
        }
        snap
    }

    #[test]
    fn test_fragmented_sync() {
        let mut parser = StatusParser::new();
        assert_eq!(parser.feed(br#"{"type":"sync","sett"#), ParseOutcome::Pending);
        assert_eq!(parser.feed(br#"ings":{"ew":44}"#), ParseOutcome::Pending);
        let outcome = parser.feed(b"}");
        match outcome {
            ParseOutcome::Structured { patch, synced } => {
                assert!(synced);
                assert_eq!(patch.appearance.get("ew"), Some(&44.0));
                assert_eq!(patch.last_status.as_deref(), Some(SYNC_COMPLETE_STATUS));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(parser.buffer().is_empty());
    }

    #[test]
    fn test_stuck_payload_is_bounded() {
        let mut parser = StatusParser::new();
        // Peer reset mid-record, leaving an open string literal behind.
        assert_eq!(
            parser.feed(br#"{"type":"sync","display":{"type":"sh"#),
            ParseOutcome::Pending
        );
        let mut snap = SettingsSnapshot::default();
        assert!(snap.shuffle.enabled);
        for _ in 0..1000 {
            if let Some(patch) = parser.feed(b"ew=40 shuffle: OFF").patch() {
                snap.apply(patch);
            }
            assert!(parser.buffer().len() <= MAX_STATUS_BUFFER);
        }
        assert_eq!(snap.appearance.ew, 40.0);
        assert!(!snap.shuffle.enabled);

        if let Some(patch) = parser.feed(br#"{"type":"sync","settings":{"ew":52}}"#).patch() {
            snap.apply(patch);
        }
        assert_eq!(snap.appearance.ew, 52.0);
        assert_eq!(snap.last_status, SYNC_COMPLETE_STATUS);
        assert!(parser.buffer().is_empty());
    }

    #[test]
    fn test_nested_close_is_not_terminal() {
        let mut parser = StatusParser::new();
        // Ends with '}' but the outer object is still open.
        assert_eq!(
            parser.feed(br#"{"type":"sync","power":{"lp":1}"#),
            ParseOutcome::Pending
        );
        assert!(parser.buffer().is_unterminated());
        let snap = apply_all(&mut parser, &[b"}"]);
        assert!(snap.low_power);
    }

    #[test]
    fn test_braces_inside_strings() {
        let mut parser = StatusParser::new();
        let snap = apply_all(
            &mut parser,
            &[br#"{"type":"sync","display":{"type":"odd}"#, br#"name","addr":"0x3d"}}"#],
        );
        assert_eq!(snap.display.kind, "odd}name");
        assert_eq!(snap.display.addr, "0x3d");
    }

    #[test]
    fn test_invalid_payload_not_absorbing_legacy_line() {
        let mut parser = StatusParser::new();
        assert_eq!(parser.feed(br#"{"type":"sync",}"#), ParseOutcome::Pending);
        assert!(!parser.buffer().is_empty());

        let outcome = parser.feed(b"ew=50");
        let patch = outcome.patch().unwrap();
        assert_eq!(patch.appearance.get("ew"), Some(&50.0));
        assert!(parser.buffer().is_empty());
    }

    #[test]
    fn test_fresh_payload_replaces_dead_buffer() {
        let mut parser = StatusParser::new();
        parser.feed(br#"{"broken":}"#);
        let snap = apply_all(&mut parser, &[br#"{"type":"sync","state":{"shuf":0}}"#]);
        assert!(!snap.shuffle.enabled);
    }

    #[test]
    fn test_non_sync_record_writes_nothing() {
        let mut parser = StatusParser::new();
        let outcome = parser.feed(br#"{"type":"ack","settings":{"ew":99}}"#);
        assert_eq!(
            outcome,
            ParseOutcome::Structured {
                patch: SettingsPatch::default(),
                synced: false
            }
        );
    }

    #[test]
    fn test_mapping_list_replaces() {
        let mut parser = StatusParser::new();
        let snap = apply_all(
            &mut parser,
            &[
                br#"[{"n":"neutral","a":""},{"n":"patpat","a":"happy"}]"#,
                br#"[{"n":"shake","a":"dizzy"}]"#,
            ],
        );
        assert_eq!(snap.gesture.mappings.len(), 1);
        assert_eq!(snap.gesture.mappings[0].name, "shake");
    }

    #[test]
    fn test_broken_mapping_list_falls_back_to_legacy() {
        let mut parser = StatusParser::new();
        let outcome = parser.feed(br#"[{"n":"neutral","a":"#);
        assert!(matches!(outcome, ParseOutcome::Legacy(_)));
    }

    #[test]
    fn test_legacy_line() {
        let mut parser = StatusParser::new();
        let snap = apply_all(&mut parser, &[b"ew=40 shuffle: ON expr=3-7"]);
        assert_eq!(snap.appearance.ew, 40.0);
        assert!(snap.shuffle.enabled);
        assert_eq!((snap.shuffle.expr_min, snap.shuffle.expr_max), (3, 7));
        assert_eq!(snap.last_status, "ew=40 shuffle: ON expr=3-7");
    }
}
