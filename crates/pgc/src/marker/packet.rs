//! Mark Packets - Bounded Work Buffers
//!
//! A mark packet holds up to `PACKET_SIZE` grey cells. Packets are checked
//! out of the `PacketManager` by one marker at a time and returned whole,
//! so a packet's contents are never shared.
//!
//! Pools:
//! - `full` - packets at least half full, preferred as input
//! - `partial` - non-empty packets below half
//! - `empty` - ready to receive discoveries
//!
//! ```text
//!   pop_input:  full -> partial
//!   pop_output: empty -> partial
//!   push:       classified by fill level
//! ```

use parking_lot::Mutex;

use crate::index::GcCell;

/// Capacity of one packet
pub const PACKET_SIZE: usize = 512;

/// MarkPacket - fixed-capacity stack of grey cells
pub struct MarkPacket {
    cells: Vec<GcCell>,
}

impl MarkPacket {
    pub fn new() -> Self {
        Self {
            cells: Vec::with_capacity(PACKET_SIZE),
        }
    }

    /// Push a cell; the packet must not be full
    pub fn push(&mut self, cell: GcCell) {
        debug_assert!(!self.is_full(), "push into a full mark packet");
        self.cells.push(cell);
    }

    pub fn pop(&mut self) -> Option<GcCell> {
        self.cells.pop()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.cells.len() >= PACKET_SIZE
    }

    /// At least half full
    pub fn is_almost_full(&self) -> bool {
        self.cells.len() >= PACKET_SIZE / 2
    }

    /// Non-empty but below half
    pub fn is_partial_full(&self) -> bool {
        !self.is_empty() && !self.is_almost_full()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

impl Default for MarkPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarkPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkPacket").field("len", &self.len()).finish()
    }
}

type Pool = Mutex<Vec<Box<MarkPacket>>>;

/// PacketManager - shared pools of mark packets
pub struct PacketManager {
    full: Pool,
    partial: Pool,
    empty: Pool,
    total: usize,
}

impl PacketManager {
    /// Create `count` empty packets
    pub fn new(count: usize) -> Self {
        let packets = (0..count).map(|_| Box::new(MarkPacket::new())).collect();
        Self {
            full: Mutex::new(Vec::new()),
            partial: Mutex::new(Vec::new()),
            empty: Mutex::new(packets),
            total: count,
        }
    }

    /// Packet with work to trace, or None if no work is available right now
    pub fn pop_input_packet(&self) -> Option<Box<MarkPacket>> {
        if let Some(packet) = self.full.lock().pop() {
            return Some(packet);
        }
        self.partial.lock().pop()
    }

    /// Packet to collect discoveries in, or None if the pool is exhausted
    pub fn pop_output_packet(&self) -> Option<Box<MarkPacket>> {
        if let Some(packet) = self.empty.lock().pop() {
            return Some(packet);
        }
        self.partial.lock().pop()
    }

    /// Return a packet to the pool matching its fill level
    pub fn push_packet(&self, packet: Box<MarkPacket>) {
        if packet.is_empty() {
            self.empty.lock().push(packet);
        } else if packet.is_partial_full() {
            self.partial.lock().push(packet);
        } else {
            self.full.lock().push(packet);
        }
    }

    /// Check if every packet is back in the pool and empty
    ///
    /// True only when no marker holds a packet, so no grey cell exists
    /// anywhere.
    pub fn is_no_input(&self) -> bool {
        self.empty.lock().len() == self.total
    }

    /// Check if a packet with work is available
    pub fn has_input(&self) -> bool {
        !self.full.lock().is_empty() || !self.partial.lock().is_empty()
    }

    /// Empty every pooled packet
    ///
    /// Checked-out packets must have been returned.
    pub fn clear(&self) {
        let mut drained: Vec<Box<MarkPacket>> = Vec::new();
        drained.append(&mut self.full.lock());
        drained.append(&mut self.partial.lock());
        let mut empty = self.empty.lock();
        for mut packet in drained {
            packet.clear();
            empty.push(packet);
        }
        debug_assert_eq!(empty.len(), self.total, "mark packet leaked");
    }

    /// Number of packets
    pub fn count(&self) -> usize {
        self.total
    }
}

impl std::fmt::Debug for PacketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketManager")
            .field("full", &self.full.lock().len())
            .field("partial", &self.partial.lock().len())
            .field("empty", &self.empty.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MemoryRef, StackDescriptor};

    fn dummy_cell() -> GcCell {
        // Stack memory has no cells; only the value travels through packets.
        let stack = Box::leak(Box::new(StackDescriptor::new(0x1000, 0x1000)));
        GcCell::new(MemoryRef::stack(stack), 0x1000 as *mut u8)
    }

    #[test]
    fn test_fill_levels() {
        let cell = dummy_cell();
        let mut packet = MarkPacket::new();
        assert!(packet.is_empty() && !packet.is_partial_full());

        packet.push(cell);
        assert!(packet.is_partial_full());

        for _ in 1..PACKET_SIZE / 2 {
            packet.push(cell);
        }
        assert!(packet.is_almost_full() && !packet.is_full());

        while !packet.is_full() {
            packet.push(cell);
        }
        assert_eq!(packet.len(), PACKET_SIZE);
    }

    #[test]
    fn test_input_prefers_full_packets() {
        let manager = PacketManager::new(4);
        let cell = dummy_cell();

        let mut partial = manager.pop_output_packet().unwrap();
        partial.push(cell);
        let mut full = manager.pop_output_packet().unwrap();
        for _ in 0..PACKET_SIZE {
            full.push(cell);
        }
        manager.push_packet(partial);
        manager.push_packet(full);

        assert_eq!(manager.pop_input_packet().unwrap().len(), PACKET_SIZE);
        assert_eq!(manager.pop_input_packet().unwrap().len(), 1);
        assert!(manager.pop_input_packet().is_none());
    }

    #[test]
    fn test_no_input_requires_all_packets_returned() {
        let manager = PacketManager::new(2);
        assert!(manager.is_no_input());

        let packet = manager.pop_output_packet().unwrap();
        assert!(!manager.is_no_input());
        assert!(!manager.has_input());

        manager.push_packet(packet);
        assert!(manager.is_no_input());
    }

    #[test]
    fn test_output_exhaustion_and_clear() {
        let manager = PacketManager::new(2);
        let cell = dummy_cell();
        let mut a = manager.pop_output_packet().unwrap();
        let mut b = manager.pop_output_packet().unwrap();
        assert!(manager.pop_output_packet().is_none());

        a.push(cell);
        b.push(cell);
        manager.push_packet(a);
        manager.push_packet(b);
        manager.clear();
        assert!(manager.is_no_input());
    }
}
