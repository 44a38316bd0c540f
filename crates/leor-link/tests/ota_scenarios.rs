//! End-to-end firmware update scenarios against the scripted mock peer.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use leor_link::transport::{DoneReply, RequestReply};
use leor_link::{
    Channel, ControlCode, LinkConfig, LinkEvent, LinkObserver, LinkSession, LinkState,
    MockTransport, OtaConfig, OtaError, OtaPhase, OtaStep, PeerScript, SettingsSnapshot,
    SettingsStore,
};
use proptest::prelude::*;

#[derive(Default)]
struct Recorder(Mutex<Vec<LinkEvent>>);

impl LinkObserver for Recorder {
    fn on_event(&self, event: &LinkEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    fn phases(&self) -> Vec<OtaPhase> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::OtaPhaseChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

fn test_config() -> LinkConfig {
    LinkConfig {
        sync_delay_ms: 0,
        ota: OtaConfig {
            request_timeout_secs: 1,
            done_timeout_secs: 1,
            credit_timeout_ms: 30,
            request_settle_ms: 0,
            finalize_settle_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Rig {
    mock: MockTransport,
    link: LinkSession<MockTransport>,
    recorder: Arc<Recorder>,
}

fn rig_with(script: PeerScript, config: LinkConfig, snapshot: SettingsSnapshot) -> Rig {
    let mock = MockTransport::with_peer(script);
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(SettingsStore::with_snapshot(snapshot));
    let link = LinkSession::with_observer(mock.clone(), config, store, recorder.clone());
    link.connect().unwrap();
    Rig {
        mock,
        link,
        recorder,
    }
}

fn rig(script: PeerScript) -> Rig {
    rig_with(script, test_config(), SettingsSnapshot::default())
}

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn update(rig: &Rig, image: &[u8]) -> (Result<leor_link::OtaReport, OtaError>, Vec<(u8, String)>) {
    let mut updates = Vec::new();
    let result = rig
        .link
        .update_firmware(image, |pct, msg| updates.push((pct, msg.to_string())));
    (result, updates)
}

#[test]
fn scenario_a_exact_multiple() {
    let rig = rig(PeerScript::default());
    let image = firmware(1018);
    let (result, updates) = update(&rig, &image);

    let report = result.unwrap();
    assert_eq!(report.packets, 2);
    assert_eq!(report.bytes, 1018);
    assert_eq!(report.over_grants, 0);

    let packets = rig.mock.data_packets();
    assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), [509, 509]);
    assert_eq!(packets.concat(), image);
    assert_eq!(rig.mock.peer_packet_size(), Some(509));
    assert_eq!(rig.mock.peer_bytes(), 1018);

    assert_eq!(updates.last().map(|(p, _)| *p), Some(100));
    assert_eq!(
        rig.recorder.phases(),
        [
            OtaPhase::Requesting,
            OtaPhase::Transferring,
            OtaPhase::Finalizing,
            OtaPhase::Succeeded
        ]
    );
    assert_eq!(rig.mock.unsubscriptions(Channel::OtaControl), 1);
    assert!(!rig.link.is_updating());
}

#[test]
fn scenario_b_trailing_byte() {
    let rig = rig(PeerScript::default());
    let image = firmware(1019);
    let (result, _) = update(&rig, &image);

    assert_eq!(result.unwrap().packets, 3);
    let sizes: Vec<usize> = rig.mock.data_packets().iter().map(Vec::len).collect();
    assert_eq!(sizes, [509, 509, 1]);
    assert_eq!(rig.mock.data_packets().concat(), image);
}

#[test]
fn scenario_c_request_nak() {
    let rig = rig(PeerScript {
        request: RequestReply::Nak,
        ..Default::default()
    });
    let (result, updates) = update(&rig, &firmware(4000));

    assert!(matches!(
        result,
        Err(OtaError::Rejected {
            step: OtaStep::Request,
            code: Some(ControlCode::RequestNak)
        })
    ));
    assert!(rig.mock.data_packets().is_empty());
    assert_eq!(updates.last().map(|(p, _)| *p), Some(0));
    assert_eq!(rig.recorder.phases().last(), Some(&OtaPhase::Rejected));
    assert_eq!(rig.mock.unsubscriptions(Channel::OtaControl), 1);
}

#[test]
fn request_timeout_is_rejection() {
    let rig = rig(PeerScript {
        request: RequestReply::Silent,
        ..Default::default()
    });
    let (result, _) = update(&rig, &firmware(10));
    assert!(matches!(
        result,
        Err(OtaError::Rejected {
            step: OtaStep::Request,
            code: None
        })
    ));
    assert!(rig.mock.data_packets().is_empty());
}

#[test]
fn scenario_d_disconnect_mid_transfer() {
    let snapshot = SettingsSnapshot {
        low_power: true,
        ..Default::default()
    };
    let rig = rig_with(
        PeerScript {
            disconnect_after: Some(5),
            ..Default::default()
        },
        test_config(),
        snapshot,
    );
    let (result, updates) = update(&rig, &firmware(20 * 509));

    assert!(matches!(result, Err(OtaError::Disconnected)));
    assert_eq!(rig.mock.data_packets().len(), 5);
    assert_eq!(rig.mock.unsubscriptions(Channel::OtaControl), 1);
    // Power mode boosted before the transfer, not restored afterwards.
    assert_eq!(rig.mock.commands(), ["sync", "ble:lp=0"]);
    assert_eq!(rig.link.state(), LinkState::Disconnected);
    assert_eq!(rig.recorder.phases().last(), Some(&OtaPhase::Aborted));

    let (pct, msg) = updates.last().unwrap();
    assert_eq!(*pct, 0);
    assert!(msg.contains("disconnected"));
}

#[test]
fn scenario_e_lost_credits_recovered() {
    let mut config = test_config();
    config.ota.credit_batch = 4;
    let rig = rig_with(
        PeerScript {
            credit_batch: 4,
            dropped_credits: vec![1, 2],
            ..Default::default()
        },
        config,
        SettingsSnapshot::default(),
    );
    let image = firmware(16 * 509);
    let (result, _) = update(&rig, &image);

    let report = result.unwrap();
    assert_eq!(report.over_grants, 2);
    assert_eq!(report.packets, 16);
    assert_eq!(rig.mock.data_packets().concat(), image);
}

#[test]
fn silent_peer_fails_after_three_waits() {
    let mut config = test_config();
    config.ota.credit_batch = 4;
    let rig = rig_with(
        PeerScript {
            credit_batch: 4,
            dropped_credits: vec![1, 2, 3],
            ..Default::default()
        },
        config,
        SettingsSnapshot::default(),
    );
    let (result, _) = update(&rig, &firmware(16 * 509));

    assert!(matches!(result, Err(OtaError::PeerUnresponsive { timeouts: 3 })));
    assert_eq!(rig.mock.data_packets().len(), 12);
    assert_eq!(rig.recorder.phases().last(), Some(&OtaPhase::Aborted));
}

#[test]
fn done_nak_is_rejection() {
    let rig = rig(PeerScript {
        done: DoneReply::Nak,
        ..Default::default()
    });
    let (result, _) = update(&rig, &firmware(600));
    assert!(matches!(
        result,
        Err(OtaError::Rejected {
            step: OtaStep::Done,
            code: Some(ControlCode::DoneNak)
        })
    ));
    assert_eq!(rig.mock.data_packets().len(), 2);
}

#[test]
fn done_timeout_is_rejection() {
    let rig = rig(PeerScript {
        done: DoneReply::Silent,
        ..Default::default()
    });
    let (result, _) = update(&rig, &firmware(600));
    assert!(matches!(
        result,
        Err(OtaError::Rejected {
            step: OtaStep::Done,
            code: None
        })
    ));
}

#[test]
fn reboot_after_done_ack_is_success() {
    let snapshot = SettingsSnapshot {
        low_power: true,
        ..Default::default()
    };
    let rig = rig_with(
        PeerScript {
            done: DoneReply::AckThenReboot,
            ..Default::default()
        },
        test_config(),
        snapshot,
    );
    let (result, updates) = update(&rig, &firmware(2000));

    assert!(result.is_ok());
    assert_eq!(updates.last().map(|(p, _)| *p), Some(100));
    assert_eq!(rig.link.state(), LinkState::Disconnected);
    assert_eq!(rig.mock.commands(), ["sync", "ble:lp=0"]);
    assert_eq!(rig.mock.unsubscriptions(Channel::OtaControl), 1);
}

#[test]
fn low_power_restored_when_still_connected() {
    let snapshot = SettingsSnapshot {
        low_power: true,
        ..Default::default()
    };
    let rig = rig_with(PeerScript::default(), test_config(), snapshot);
    let (result, _) = update(&rig, &firmware(100));

    assert!(result.is_ok());
    assert_eq!(rig.mock.commands(), ["sync", "ble:lp=0", "ble:lp=1"]);
}

#[test]
fn missing_ota_service_is_unavailable() {
    let mock = MockTransport::with_peer(PeerScript::default());
    mock.set_unavailable(Channel::OtaControl);
    let link = LinkSession::new(mock.clone(), test_config(), Arc::new(SettingsStore::new()));
    link.connect().unwrap();
    mock.clear_writes();

    let mut last = None;
    let result = link.update_firmware(&firmware(100), |pct, _| last = Some(pct));
    assert!(matches!(result, Err(OtaError::Unavailable)));
    assert!(mock.writes().is_empty());
    assert_eq!(mock.subscriptions(Channel::OtaControl), 0);
    assert_eq!(last, Some(0));
}

#[test]
fn empty_firmware_rejected_before_io() {
    let rig = rig(PeerScript::default());
    rig.mock.clear_writes();
    let (result, _) = update(&rig, &[]);
    assert!(matches!(result, Err(OtaError::EmptyFirmware)));
    assert!(rig.mock.writes().is_empty());
}

#[test]
fn second_update_is_busy_and_cancel_stops_first() {
    let mut config = test_config();
    config.ota.request_timeout_secs = 10;
    let rig = rig_with(
        PeerScript {
            request: RequestReply::Silent,
            ..Default::default()
        },
        config,
        SettingsSnapshot::default(),
    );
    let image = firmware(100);

    thread::scope(|s| {
        let first = s.spawn(|| rig.link.update_firmware(&image, |_, _| {}));

        while !rig.link.is_updating() {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        let second = rig.link.update_firmware(&image, |_, _| {});
        assert!(matches!(second, Err(OtaError::Busy)));

        assert!(rig.link.cancel_update());
        let result = first.join().unwrap();
        assert!(matches!(result, Err(OtaError::Cancelled)));
    });

    assert!(!rig.link.is_updating());
    assert!(rig.link.is_connected());
    assert_eq!(rig.mock.unsubscriptions(Channel::OtaControl), 1);
}

#[test]
fn progress_stays_in_window() {
    let rig = rig(PeerScript::default());
    let (result, updates) = update(&rig, &firmware(100 * 509));
    result.unwrap();

    let streaming: Vec<u8> = updates
        .iter()
        .map(|(p, _)| *p)
        .filter(|p| (2..=95).contains(p))
        .collect();
    assert!(streaming.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(streaming.last(), Some(&95));
    assert!(updates.iter().all(|(p, _)| *p <= 100));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any image goes out as ceil(N/P) in-order packets that reassemble it.
    #[test]
    fn packets_cover_image_in_order(len in 1usize..6000) {
        let rig = rig(PeerScript::default());
        let image = firmware(len);
        let (result, _) = update(&rig, &image);
        prop_assert!(result.is_ok());

        let packets = rig.mock.data_packets();
        prop_assert_eq!(packets.len(), len.div_ceil(509));
        let last = packets.last().map(Vec::len).unwrap_or(0);
        let expected_last = if len % 509 == 0 { 509 } else { len % 509 };
        prop_assert_eq!(last, expected_last);
        prop_assert_eq!(packets.concat(), image);
    }
}
