//! MIDI exchange between the host, the control plane and the engine.
//!
//! [`MidiBridge`] owns two bounded FIFOs, one per direction. Pushing into a
//! full FIFO replaces its oldest event and bumps a dropped-event counter, so
//! producers never block. Events within one direction keep their order.
//!
//! The engine talks MIDI as raw bytes through read/write callbacks;
//! [`MidiBridge::read_bytes`] and [`MidiBridge::write_bytes`] translate
//! between those byte streams and [`MidiEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// A short MIDI message with its sample offset inside the host block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample offset within the block.
    pub sample_offset: u32,
    data: [u8; 3],
    len: u8,
}

impl MidiEvent {
    /// Build an event from raw bytes. Returns `None` unless `bytes` holds
    /// one to three bytes starting with a status byte.
    pub fn from_bytes(sample_offset: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > 3 || bytes[0] & 0x80 == 0 {
            return None;
        }
        let mut data = [0u8; 3];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            sample_offset,
            data,
            len: bytes.len() as u8,
        })
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            sample_offset: 0,
            data: [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            len: 3,
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            sample_offset: 0,
            data: [0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            len: 3,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            sample_offset: 0,
            data: [0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F],
            len: 3,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn status(&self) -> u8 {
        self.data[0]
    }

    /// Zero-based MIDI channel, for channel voice messages.
    pub fn channel(&self) -> Option<u8> {
        (self.data[0] < 0xF0).then_some(self.data[0] & 0x0F)
    }
}

/// Length in bytes of a message starting with `status`, or `None` for
/// SysEx and undefined status bytes.
pub fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(3),
        0xC0..=0xDF => Some(2),
        0xF1 | 0xF3 => Some(2),
        0xF2 => Some(3),
        0xF6 | 0xF8..=0xFF => Some(1),
        _ => None,
    }
}

/// A bounded drop-oldest FIFO of MIDI events.
pub struct MidiQueue {
    queue: ArrayQueue<MidiEvent>,
    dropped: AtomicU64,
}

impl MidiQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an event, evicting the oldest one when full.
    pub fn push(&self, event: MidiEvent) {
        if self.queue.force_push(event).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<MidiEvent> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Events evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// The two MIDI FIFOs of one processor.
pub struct MidiBridge {
    inbound: MidiQueue,
    outbound: MidiQueue,
}

impl MidiBridge {
    pub fn new(input_capacity: usize, output_capacity: usize) -> Self {
        Self {
            inbound: MidiQueue::new(input_capacity),
            outbound: MidiQueue::new(output_capacity),
        }
    }

    /// Host → engine FIFO.
    pub fn inbound(&self) -> &MidiQueue {
        &self.inbound
    }

    /// Engine → host FIFO.
    pub fn outbound(&self) -> &MidiQueue {
        &self.outbound
    }

    /// Queue an event for the engine (host MIDI or an on-screen keyboard).
    pub fn push_input(&self, event: MidiEvent) {
        self.inbound.push(event);
    }

    /// Serve the engine's MIDI read callback.
    ///
    /// Copies whole queued messages into `buf` in arrival order. A message
    /// that does not fit is parked in `pending` and written first next time.
    pub fn read_bytes(&self, pending: &mut Option<MidiEvent>, buf: &mut [u8]) -> usize {
        let mut written = 0;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match self.inbound.pop() {
                    Some(event) => event,
                    None => break,
                },
            };
            let bytes = event.bytes();
            if written + bytes.len() > buf.len() {
                *pending = Some(event);
                break;
            }
            buf[written..written + bytes.len()].copy_from_slice(bytes);
            written += bytes.len();
        }
        written
    }

    /// Serve the engine's MIDI write callback.
    ///
    /// Splits the byte stream into messages by status byte (honouring
    /// running status) and queues them for the host. Returns the number of
    /// bytes consumed. SysEx and stray data bytes are skipped.
    pub fn write_bytes(&self, bytes: &[u8], sample_offset: u32) -> usize {
        let mut i = 0;
        let mut running: Option<u8> = None;
        while i < bytes.len() {
            let b = bytes[i];
            if b >= 0xF8 {
                if let Some(event) = MidiEvent::from_bytes(sample_offset, &bytes[i..i + 1]) {
                    self.outbound.push(event);
                }
                i += 1;
                continue;
            }
            if b == 0xF0 {
                // Skip to the end of the SysEx message.
                i = bytes[i..]
                    .iter()
                    .position(|&x| x == 0xF7)
                    .map_or(bytes.len(), |p| i + p + 1);
                running = None;
                continue;
            }
            let (status, data_start) = if b & 0x80 != 0 {
                (b, i + 1)
            } else if let Some(status) = running {
                (status, i)
            } else {
                i += 1;
                continue;
            };
            let Some(len) = message_len(status) else {
                i = data_start;
                continue;
            };
            let data_len = len - 1;
            if data_start + data_len > bytes.len() {
                break;
            }
            let mut message = [status, 0, 0];
            message[1..len].copy_from_slice(&bytes[data_start..data_start + data_len]);
            if let Some(event) = MidiEvent::from_bytes(sample_offset, &message[..len]) {
                self.outbound.push(event);
            }
            running = (status < 0xF0).then_some(status);
            i = data_start + data_len;
        }
        i
    }
}

/// Fixed-capacity MIDI buffer exchanged with the host once per block.
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    capacity: usize,
    overflowed: bool,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Append an event. Returns `false` (and flags overflow) when full.
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() >= self.capacity {
            self.overflowed = true;
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidiEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let bridge = MidiBridge::new(8, 8);
        for note in 60..64 {
            bridge.push_input(MidiEvent::note_on(0, note, 100));
        }
        let notes: Vec<u8> = std::iter::from_fn(|| bridge.inbound().pop())
            .map(|e| e.bytes()[1])
            .collect();
        assert_eq!(notes, vec![60, 61, 62, 63]);
    }

    #[test]
    fn test_overflow_drops_oldest_and_keeps_order() {
        let queue = MidiQueue::new(4);
        for note in 0..100u8 {
            queue.push(MidiEvent::note_on(0, note, 1));
        }
        assert_eq!(queue.dropped(), 96);
        let notes: Vec<u8> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.bytes()[1])
            .collect();
        assert_eq!(notes, vec![96, 97, 98, 99]);
    }

    #[test]
    fn test_read_bytes_parks_partial_event() {
        let bridge = MidiBridge::new(8, 8);
        bridge.push_input(MidiEvent::note_on(0, 60, 100));
        bridge.push_input(MidiEvent::from_bytes(0, &[0xC1, 5]).unwrap());
        bridge.push_input(MidiEvent::note_off(0, 60, 0));

        let mut pending = None;
        let mut buf = [0u8; 4];
        let n = bridge.read_bytes(&mut pending, &mut buf);
        assert_eq!(&buf[..n], &[0x90, 60, 100]);
        assert!(pending.is_some());

        let n = bridge.read_bytes(&mut pending, &mut buf);
        assert_eq!(&buf[..n], &[0xC1, 5]);
        let n = bridge.read_bytes(&mut pending, &mut buf);
        assert_eq!(&buf[..n], &[0x80, 60, 0]);
        assert_eq!(bridge.read_bytes(&mut pending, &mut buf), 0);
    }

    #[test]
    fn test_write_bytes_running_status() {
        let bridge = MidiBridge::new(8, 8);
        let consumed = bridge.write_bytes(&[0x90, 60, 100, 62, 90, 0xF8, 0xB0, 7, 127], 0);
        assert_eq!(consumed, 9);
        let out: Vec<Vec<u8>> = std::iter::from_fn(|| bridge.outbound().pop())
            .map(|e| e.bytes().to_vec())
            .collect();
        assert_eq!(
            out,
            vec![
                vec![0x90, 60, 100],
                vec![0x90, 62, 90],
                vec![0xF8],
                vec![0xB0, 7, 127],
            ]
        );
    }

    #[test]
    fn test_write_bytes_skips_sysex() {
        let bridge = MidiBridge::new(8, 8);
        bridge.write_bytes(&[0xF0, 0x41, 0x10, 0xF7, 0xC0, 3], 0);
        let event = bridge.outbound().pop().unwrap();
        assert_eq!(event.bytes(), &[0xC0, 3]);
        assert!(bridge.outbound().is_empty());
    }

    #[test]
    fn test_midi_buffer_capacity() {
        let mut buffer = MidiBuffer::with_capacity(1);
        assert!(buffer.push(MidiEvent::note_on(0, 1, 1)));
        assert!(!buffer.push(MidiEvent::note_on(0, 2, 1)));
        assert!(buffer.has_overflowed());
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.has_overflowed());
    }

    #[test]
    fn test_event_validation() {
        assert!(MidiEvent::from_bytes(0, &[]).is_none());
        assert!(MidiEvent::from_bytes(0, &[0x40, 1]).is_none());
        assert_eq!(MidiEvent::note_on(3, 60, 1).channel(), Some(3));
        assert_eq!(message_len(0xD0), Some(2));
        assert_eq!(message_len(0xF0), None);
    }
}
