//! Packet batches.
//!
//! A batch is the unit of work between the I/O tier and the graph. Killed
//! or forwarded packets leave tombstones in place, so slot indices stay
//! stable for every element that sees the batch; the batch only compacts
//! by ceasing to exist when it exits the graph.

use crate::packet::Packet;

/// Fixed-capacity ordered collection of packet slots.
pub struct PacketBatch {
    slots: Vec<Option<Packet>>,
    capacity: usize,
    /// Global index of the computation thread that owns the batch.
    pub owner: usize,
    /// Batch sequence id assigned by the producing I/O thread.
    pub batch_id: u64,
    /// Packets currently parked in an in-flight offload.
    pub pending_offloads: usize,
}

impl PacketBatch {
    /// Create an empty batch with room for `capacity` packets.
    pub fn new(capacity: usize, owner: usize, batch_id: u64) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            owner,
            batch_id,
            pending_offloads: 0,
        }
    }

    /// Capacity in slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots used (alive + tombstoned).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots are used.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a packet; a full batch hands it back.
    pub fn push(&mut self, pkt: Packet) -> std::result::Result<(), Packet> {
        if self.slots.len() >= self.capacity {
            return Err(pkt);
        }
        self.slots.push(Some(pkt));
        Ok(())
    }

    /// Number of alive (non-tombstoned) packets.
    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether every slot is a tombstone.
    pub fn fully_tombstoned(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Borrow the packet in a slot, if alive.
    pub fn get(&self, idx: usize) -> Option<&Packet> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// Mutably borrow the packet in a slot, if alive.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Packet> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    /// Remove the packet from a slot, leaving a tombstone.
    pub fn take(&mut self, idx: usize) -> Option<Packet> {
        self.slots.get_mut(idx).and_then(|s| s.take())
    }

    /// Indices of alive packets, in slot order.
    pub fn alive_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Drain every remaining packet, in slot order.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::PacketPool;

    fn make_batch(n: usize) -> (PacketPool, PacketBatch) {
        let pool = PacketPool::new("test", 0, 128, 64).unwrap();
        let mut batch = PacketBatch::new(32, 0, 1);
        for i in 0..n {
            let pkt = Packet::synthesize(&pool, &[i as u8; 60], 0).unwrap();
            assert!(batch.push(pkt).is_ok());
        }
        (pool, batch)
    }

    #[test]
    fn test_push_and_capacity() {
        let (_pool, batch) = make_batch(32);
        assert_eq!(batch.len(), 32);
        assert_eq!(batch.alive_count(), 32);
    }

    #[test]
    fn test_push_beyond_capacity_hands_packet_back() {
        let (pool, mut batch) = make_batch(32);
        let pkt = Packet::synthesize(&pool, &[7; 60], 0).unwrap();
        let rejected = batch.push(pkt).unwrap_err();
        assert_eq!(rejected.data()[0], 7);
        assert_eq!(batch.len(), 32);
    }

    #[test]
    fn test_tombstones_keep_indices_stable() {
        let (_pool, mut batch) = make_batch(4);
        let killed = batch.take(1).unwrap();
        drop(killed);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.alive_count(), 3);
        assert!(batch.get(1).is_none());
        // Slot 2 still holds the packet that was pushed third.
        assert_eq!(batch.get(2).unwrap().data()[0], 2);
        assert_eq!(batch.alive_indices(), vec![0, 2, 3]);
    }

    #[test]
    fn test_fully_tombstoned() {
        let (_pool, mut batch) = make_batch(3);
        for i in 0..3 {
            batch.take(i);
        }
        assert!(batch.fully_tombstoned());
        assert_eq!(batch.alive_count(), 0);
    }

    #[test]
    fn test_drain_preserves_order() {
        let (_pool, mut batch) = make_batch(5);
        batch.take(2);
        let pkts = batch.drain();
        assert_eq!(pkts.len(), 4);
        assert_eq!(pkts[0].data()[0], 0);
        assert_eq!(pkts[1].data()[0], 1);
        assert_eq!(pkts[2].data()[0], 3);
        assert_eq!(pkts[3].data()[0], 4);
    }
}
