//! Firmware packetization and progress mapping.

use crate::protocol::constants::{PROGRESS_STREAM_END, PROGRESS_STREAM_START};

/// Walks a firmware image in fixed-size packets, in offset order.
#[derive(Debug, Clone)]
pub struct PacketCursor {
    /// Packets handed out so far.
    pub current: usize,
    /// Total packets in the image.
    pub total: usize,
    /// Byte offset of the next packet.
    pub offset: usize,
    pub packet_size: usize,
    pub data_size: usize,
}

impl PacketCursor {
    pub fn new(data_size: usize, packet_size: usize) -> Self {
        let total = if data_size == 0 || packet_size == 0 {
            0
        } else {
            data_size.div_ceil(packet_size)
        };
        Self {
            current: 0,
            total,
            offset: 0,
            packet_size,
            data_size,
        }
    }

    /// Next packet from `data`, advancing the cursor.
    pub fn next_packet<'a>(&mut self, data: &'a [u8]) -> Option<&'a [u8]> {
        if self.is_done() || self.offset >= data.len() {
            return None;
        }
        let end = (self.offset + self.packet_size).min(self.data_size).min(data.len());
        let packet = &data[self.offset..end];
        self.offset = end;
        self.current += 1;
        Some(packet)
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }

    /// Whether the packet just sent should produce a progress update.
    pub fn should_report(&self, interval: usize) -> bool {
        self.is_done() || (interval > 0 && self.current % interval == 0)
    }

    /// Streaming progress, mapped into the streaming window.
    pub fn progress_pct(&self) -> u8 {
        stream_percent(self.offset, self.data_size)
    }
}

/// Map `sent / total` bytes into the 2%..95% window.
pub fn stream_percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return PROGRESS_STREAM_END;
    }
    let span = (PROGRESS_STREAM_END - PROGRESS_STREAM_START) as usize;
    let scaled = sent.min(total) as u128 * span as u128 / total as u128;
    PROGRESS_STREAM_START + scaled as u8
}
