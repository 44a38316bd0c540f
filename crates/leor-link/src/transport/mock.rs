//! Mock link transport for testing.
//!
//! Records every write, lets tests inject notifications and link loss,
//! and can host a scripted peer that speaks the OTA control protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};

use super::traits::{Channel, LinkLossHandler, LinkTransport, NotifyHandler, TransportError};
use crate::protocol::ControlCode;
use crate::protocol::constants::OTA_CREDIT_BATCH;

/// How a write was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Acknowledged,
    Unacknowledged,
}

/// A captured write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub channel: Channel,
    pub kind: WriteKind,
    pub data: Vec<u8>,
}

/// Peer answer to REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReply {
    Ack,
    Nak,
    Silent,
}

/// Peer answer to DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReply {
    Ack,
    Nak,
    Silent,
    /// Notify DONE_ACK, then reboot before the write response goes out.
    AckThenReboot,
}

/// Scripted behavior of the simulated device.
#[derive(Debug, Clone)]
pub struct PeerScript {
    pub request: RequestReply,
    pub done: DoneReply,
    pub credit_batch: u32,
    /// 1-based batch numbers whose CREDIT notification gets lost.
    pub dropped_credits: Vec<u32>,
    /// Drop the link right after this many data packets.
    pub disconnect_after: Option<usize>,
    /// Status fragments notified when the unified sync command arrives.
    pub sync_reply: Vec<Vec<u8>>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            request: RequestReply::Ack,
            done: DoneReply::Ack,
            credit_batch: OTA_CREDIT_BATCH,
            dropped_credits: Vec::new(),
            disconnect_after: None,
            sync_reply: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PeerRuntime {
    script: PeerScript,
    packet_size: Option<u16>,
    receiving: bool,
    packets: usize,
    bytes: usize,
}

enum PeerAction {
    Notify(Channel, Vec<u8>),
    DropLink,
    FailWrite,
}

impl PeerRuntime {
    fn on_write(&mut self, channel: Channel, data: &[u8]) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        match channel {
            Channel::Command => {
                if data == b"sync" {
                    for fragment in &self.script.sync_reply {
                        actions.push(PeerAction::Notify(Channel::Status, fragment.clone()));
                    }
                }
            }
            Channel::OtaData if !self.receiving => {
                if data.len() == 2 {
                    self.packet_size = Some(LittleEndian::read_u16(data));
                }
            }
            Channel::OtaData => {
                self.packets += 1;
                self.bytes += data.len();
                let batch = self.script.credit_batch.max(1) as usize;
                if self.packets % batch == 0 {
                    let batch_no = (self.packets / batch) as u32;
                    if !self.script.dropped_credits.contains(&batch_no) {
                        actions.push(credit_notification());
                    }
                }
                if self.script.disconnect_after == Some(self.packets) {
                    actions.push(PeerAction::DropLink);
                }
            }
            Channel::OtaControl => match ControlCode::from_bytes(data) {
                Some(ControlCode::Request) => match self.script.request {
                    RequestReply::Ack => {
                        self.receiving = true;
                        self.packets = 0;
                        self.bytes = 0;
                        actions.push(control(ControlCode::RequestAck));
                    }
                    RequestReply::Nak => actions.push(control(ControlCode::RequestNak)),
                    RequestReply::Silent => {}
                },
                Some(ControlCode::Done) => {
                    self.receiving = false;
                    match self.script.done {
                        DoneReply::Ack => actions.push(control(ControlCode::DoneAck)),
                        DoneReply::Nak => actions.push(control(ControlCode::DoneNak)),
                        DoneReply::Silent => {}
                        DoneReply::AckThenReboot => {
                            actions.push(control(ControlCode::DoneAck));
                            actions.push(PeerAction::DropLink);
                            actions.push(PeerAction::FailWrite);
                        }
                    }
                }
                _ => {}
            },
            Channel::Status | Channel::Gesture => {}
        }
        actions
    }
}

fn control(code: ControlCode) -> PeerAction {
    PeerAction::Notify(Channel::OtaControl, vec![code.as_byte()])
}

fn credit_notification() -> PeerAction {
    control(ControlCode::Credit)
}

#[derive(Default)]
struct MockState {
    connected: bool,
    open_error: Option<String>,
    unavailable: HashSet<Channel>,
    bound: HashSet<Channel>,
    writes: Vec<RecordedWrite>,
    handlers: HashMap<Channel, NotifyHandler>,
    loss_handler: Option<LinkLossHandler>,
    subscriptions: Vec<Channel>,
    unsubscriptions: Vec<Channel>,
    peer: Option<PeerRuntime>,
    opens: usize,
    closes: usize,
}

/// Mock transport for unit testing session and OTA logic.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with a scripted device on the other end.
    pub fn with_peer(script: PeerScript) -> Self {
        let mock = Self::new();
        mock.set_peer(script);
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_peer(&self, script: PeerScript) {
        self.state().peer = Some(PeerRuntime {
            script,
            ..Default::default()
        });
    }

    /// Make the next `open` fail.
    pub fn fail_open(&self, message: &str) {
        self.state().open_error = Some(message.to_string());
    }

    /// Hide a channel from the device's GATT table.
    pub fn set_unavailable(&self, channel: Channel) {
        self.state().unavailable.insert(channel);
    }

    /// Deliver a notification as if the device sent it.
    pub fn notify(&self, channel: Channel, data: &[u8]) {
        let handler = {
            let st = self.state();
            if !st.connected {
                return;
            }
            st.handlers.get(&channel).cloned()
        };
        if let Some(handler) = handler {
            handler(data);
        }
    }

    /// Simulate the peer dropping the link.
    pub fn drop_link(&self) {
        let handler = {
            let mut st = self.state();
            if !st.connected {
                return;
            }
            st.connected = false;
            st.handlers.clear();
            st.bound.clear();
            st.loss_handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Payloads written on one channel, in order.
    pub fn writes_on(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.channel == channel)
            .map(|w| w.data.clone())
            .collect()
    }

    /// Commands written on the command channel, as text.
    pub fn commands(&self) -> Vec<String> {
        self.writes_on(Channel::Command)
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    /// Firmware packets, i.e. unacknowledged writes on the data channel.
    pub fn data_packets(&self) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.channel == Channel::OtaData && w.kind == WriteKind::Unacknowledged)
            .map(|w| w.data.clone())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    pub fn subscriptions(&self, channel: Channel) -> usize {
        self.state().subscriptions.iter().filter(|&&c| c == channel).count()
    }

    pub fn unsubscriptions(&self, channel: Channel) -> usize {
        self.state()
            .unsubscriptions
            .iter()
            .filter(|&&c| c == channel)
            .count()
    }

    pub fn has_subscriber(&self, channel: Channel) -> bool {
        self.state().handlers.contains_key(&channel)
    }

    /// Packet size the peer recorded from the announcement write.
    pub fn peer_packet_size(&self) -> Option<u16> {
        self.state().peer.as_ref().and_then(|p| p.packet_size)
    }

    /// Bytes the peer accepted during the current transfer.
    pub fn peer_bytes(&self) -> usize {
        self.state().peer.as_ref().map_or(0, |p| p.bytes)
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    fn write_with(
        &self,
        channel: Channel,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<usize, TransportError> {
        let actions = {
            let mut st = self.state();
            if !st.connected {
                return Err(TransportError::Disconnected);
            }
            if !st.bound.contains(&channel) {
                return Err(TransportError::NotBound(channel));
            }
            st.writes.push(RecordedWrite {
                channel,
                kind,
                data: data.to_vec(),
            });
            match st.peer.as_mut() {
                Some(peer) => peer.on_write(channel, data),
                None => Vec::new(),
            }
        };

        let mut result = Ok(data.len());
        for action in actions {
            match action {
                PeerAction::Notify(ch, payload) => self.notify(ch, &payload),
                PeerAction::DropLink => self.drop_link(),
                PeerAction::FailWrite => {
                    result = Err(TransportError::WriteFailed {
                        channel,
                        message: "peer reset before write response".into(),
                    })
                }
            }
        }
        result
    }
}

impl LinkTransport for MockTransport {
    fn open(&self, device_name: &str) -> Result<(), TransportError> {
        let mut st = self.state();
        if let Some(message) = st.open_error.take() {
            return Err(TransportError::OpenFailed(message));
        }
        if device_name.is_empty() {
            return Err(TransportError::DeviceNotFound {
                name: device_name.to_string(),
            });
        }
        st.connected = true;
        st.bound.clear();
        st.handlers.clear();
        st.opens += 1;
        Ok(())
    }

    fn bind(&self, channel: Channel) -> Result<(), TransportError> {
        let mut st = self.state();
        if !st.connected {
            return Err(TransportError::Disconnected);
        }
        if st.unavailable.contains(&channel) {
            return Err(TransportError::BindFailed {
                channel,
                message: "characteristic not found".into(),
            });
        }
        st.bound.insert(channel);
        Ok(())
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<usize, TransportError> {
        self.write_with(channel, data, WriteKind::Acknowledged)
    }

    fn write_without_response(
        &self,
        channel: Channel,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.write_with(channel, data, WriteKind::Unacknowledged)
    }

    fn subscribe(&self, channel: Channel, handler: NotifyHandler) -> Result<(), TransportError> {
        let mut st = self.state();
        if !st.connected {
            return Err(TransportError::Disconnected);
        }
        if !st.bound.contains(&channel) {
            return Err(TransportError::NotBound(channel));
        }
        if !channel.notifies() {
            return Err(TransportError::SubscribeFailed {
                channel,
                message: "characteristic has no notify property".to_string(),
            });
        }
        st.handlers.insert(channel, handler);
        st.subscriptions.push(channel);
        Ok(())
    }

    fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let mut st = self.state();
        st.handlers.remove(&channel);
        st.unsubscriptions.push(channel);
        Ok(())
    }

    fn on_link_loss(&self, handler: LinkLossHandler) {
        self.state().loss_handler = Some(handler);
    }

    fn close(&self) {
        let mut st = self.state();
        st.connected = false;
        st.handlers.clear();
        st.bound.clear();
        st.closes += 1;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_mock(mock: &MockTransport) {
        mock.open("Leor").unwrap();
        for ch in [Channel::Command, Channel::Status, Channel::OtaControl, Channel::OtaData] {
            mock.bind(ch).unwrap();
        }
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        open_mock(&mock);
        mock.write(Channel::Command, b"happy").unwrap();
        mock.write_without_response(Channel::OtaData, b"xyz").unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data, b"happy");
        assert_eq!(writes[1].kind, WriteKind::Unacknowledged);
        assert_eq!(mock.commands(), ["happy"]);
    }

    #[test]
    fn test_mock_unbound_channel() {
        let mock = MockTransport::new();
        mock.set_unavailable(Channel::OtaData);
        mock.open("Leor").unwrap();
        assert!(mock.bind(Channel::OtaData).is_err());
        assert!(matches!(
            mock.write(Channel::OtaData, b"x"),
            Err(TransportError::NotBound(Channel::OtaData))
        ));
    }

    #[test]
    fn test_mock_subscribe_requires_notify() {
        let mock = MockTransport::new();
        open_mock(&mock);
        assert!(matches!(
            mock.subscribe(Channel::Command, Arc::new(|_: &[u8]| {})),
            Err(TransportError::SubscribeFailed {
                channel: Channel::Command,
                ..
            })
        ));
        assert!(!mock.has_subscriber(Channel::Command));
        mock.subscribe(Channel::Status, Arc::new(|_: &[u8]| {})).unwrap();
        assert!(mock.has_subscriber(Channel::Status));
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        open_mock(&mock);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mock.on_link_loss(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        mock.drop_link();
        mock.drop_link();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mock.is_connected());
        assert!(mock.write(Channel::Command, b"test").is_err());
    }

    #[test]
    fn test_peer_grants_credit_per_batch() {
        let mock = MockTransport::with_peer(PeerScript {
            credit_batch: 4,
            dropped_credits: vec![2],
            ..Default::default()
        });
        open_mock(&mock);
        let credits = Arc::new(AtomicUsize::new(0));
        let counter = credits.clone();
        mock.subscribe(
            Channel::OtaControl,
            Arc::new(move |data: &[u8]| {
                if data == [ControlCode::Credit.as_byte()] {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

        mock.write(Channel::OtaData, &509u16.to_le_bytes()).unwrap();
        mock.write(Channel::OtaControl, &[ControlCode::Request.as_byte()])
            .unwrap();
        for _ in 0..12 {
            mock.write_without_response(Channel::OtaData, &[0u8; 8]).unwrap();
        }

        assert_eq!(mock.peer_packet_size(), Some(509));
        assert_eq!(mock.peer_bytes(), 96);
        // Batches 1 and 3 granted, batch 2 lost.
        assert_eq!(credits.load(Ordering::SeqCst), 2);
    }
}
