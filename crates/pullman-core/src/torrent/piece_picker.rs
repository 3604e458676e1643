//! Piece selection
//!
//! Rarest-first: among pieces we still need and the peer can serve,
//! pick one with the lowest swarm availability, breaking ties at
//! random so simultaneous starters do not all hammer the same piece.

use rand::seq::SliceRandom;
use std::collections::HashSet;

/// MSB-first piece bitfield, the wire encoding peers exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(len.div_ceil(8), 0);
        Self { bits, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 1 << (7 - (index % 8));
        }
    }

    pub fn count(&self) -> usize {
        (0..self.len).filter(|&i| self.has(i)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }
}

#[derive(Debug)]
pub struct PiecePicker {
    have: Bitfield,
    /// How many connected peers advertise each piece
    availability: Vec<u32>,
    /// Pieces currently assigned to a peer
    pending: HashSet<usize>,
    /// Task priority, bounds how many pieces may be in flight
    priority: i32,
}

/// Concurrent assignments allowed at a given task priority. Low
/// priority swarms keep fewer pieces in flight and so yield bandwidth
/// to higher priority ones.
fn inflight_cap(priority: i32) -> usize {
    let shift = (priority.clamp(-2, 4) + 2) as u32;
    4usize << shift
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            have: Bitfield::new(piece_count),
            availability: vec![0; piece_count],
            pending: HashSet::new(),
            priority: 0,
        }
    }

    /// Rebuild from a persisted bitfield after a restart.
    pub fn from_bitfield(have: Bitfield) -> Self {
        let count = have.len();
        Self {
            have,
            availability: vec![0; count],
            pending: HashSet::new(),
            priority: 0,
        }
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn has(&self, index: usize) -> bool {
        self.have.has(index)
    }

    pub fn mark_have(&mut self, index: usize) {
        self.have.set(index);
        self.pending.remove(&index);
    }

    pub fn pieces_have(&self) -> usize {
        self.have.count()
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    /// A peer announced its full bitfield.
    pub fn peer_joined(&mut self, peer: &Bitfield) {
        for i in 0..self.availability.len() {
            if peer.has(i) {
                self.availability[i] += 1;
            }
        }
    }

    /// A peer left; its advertised pieces lose one point of
    /// availability.
    pub fn peer_left(&mut self, peer: &Bitfield) {
        for i in 0..self.availability.len() {
            if peer.has(i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
    }

    /// A connected peer sent Have for one piece.
    pub fn peer_has(&mut self, index: usize) {
        if index < self.availability.len() {
            self.availability[index] += 1;
        }
    }

    /// Assign the rarest needed piece this peer can serve, within the
    /// in-flight cap the task priority allows.
    pub fn pick(&mut self, peer: &Bitfield) -> Option<usize> {
        if self.pending.len() >= inflight_cap(self.priority) {
            return None;
        }
        let mut best_rarity = u32::MAX;
        let mut candidates: Vec<usize> = Vec::new();

        for index in 0..self.availability.len() {
            if self.have.has(index) || self.pending.contains(&index) || !peer.has(index) {
                continue;
            }
            let rarity = self.availability[index];
            if rarity < best_rarity {
                best_rarity = rarity;
                candidates.clear();
                candidates.push(index);
            } else if rarity == best_rarity {
                candidates.push(index);
            }
        }

        let pick = *candidates.choose(&mut rand::thread_rng())?;
        self.pending.insert(pick);
        Some(pick)
    }

    /// A peer dropped mid-piece; hand the piece back to the pool.
    pub fn unassign(&mut self, index: usize) {
        self.pending.remove(&index);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bitfield(len: usize) -> Bitfield {
        let mut bf = Bitfield::new(len);
        for i in 0..len {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn bitfield_is_msb_first() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        assert_eq!(bf.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(5));
    }

    #[test]
    fn bitfield_round_trips_through_bytes() {
        let mut bf = Bitfield::new(13);
        bf.set(3);
        bf.set(12);
        let back = Bitfield::from_bytes(bf.as_bytes(), 13);
        assert_eq!(bf, back);
    }

    #[test]
    fn out_of_range_bits_read_false() {
        let bf = Bitfield::from_bytes(&[0xff, 0xff], 10);
        assert!(bf.has(9));
        assert!(!bf.has(10));
        assert!(!bf.has(100));
    }

    #[test]
    fn picker_prefers_the_rarest_piece() {
        let mut picker = PiecePicker::new(4);

        // Two peers hold everything except piece 2, one peer holds
        // only piece 2: availability 2/2/1/2.
        let mut no_two = Bitfield::new(4);
        no_two.set(0);
        no_two.set(1);
        no_two.set(3);
        let mut rare_only = Bitfield::new(4);
        rare_only.set(2);
        picker.peer_joined(&no_two);
        picker.peer_joined(&no_two);
        picker.peer_joined(&rare_only);

        let everything = full_bitfield(4);
        assert_eq!(picker.pick(&everything), Some(2));
    }

    #[test]
    fn picked_pieces_are_not_picked_twice() {
        let mut picker = PiecePicker::new(3);
        let peer = full_bitfield(3);
        picker.peer_joined(&peer);

        let mut picked = HashSet::new();
        for _ in 0..3 {
            picked.insert(picker.pick(&peer).unwrap());
        }
        assert_eq!(picked.len(), 3);
        assert!(picker.pick(&peer).is_none());
    }

    #[test]
    fn unassign_returns_a_piece_to_the_pool() {
        let mut picker = PiecePicker::new(1);
        let peer = full_bitfield(1);
        picker.peer_joined(&peer);

        assert_eq!(picker.pick(&peer), Some(0));
        assert!(picker.pick(&peer).is_none());
        picker.unassign(0);
        assert_eq!(picker.pick(&peer), Some(0));
    }

    #[test]
    fn owned_pieces_are_never_picked() {
        let mut picker = PiecePicker::new(2);
        let peer = full_bitfield(2);
        picker.peer_joined(&peer);
        picker.mark_have(0);

        assert_eq!(picker.pick(&peer), Some(1));
        assert!(picker.pick(&peer).is_none());
    }

    #[test]
    fn low_priority_limits_pieces_in_flight() {
        let mut picker = PiecePicker::new(8);
        picker.set_priority(-2);
        let peer = full_bitfield(8);
        picker.peer_joined(&peer);

        for _ in 0..4 {
            assert!(picker.pick(&peer).is_some());
        }
        assert!(picker.pick(&peer).is_none());

        // Raising the priority widens the in-flight cap.
        picker.set_priority(0);
        assert!(picker.pick(&peer).is_some());
    }

    #[test]
    fn completion_tracks_the_have_set() {
        let mut picker = PiecePicker::new(2);
        assert!(!picker.is_complete());
        picker.mark_have(0);
        picker.mark_have(1);
        assert!(picker.is_complete());
        assert_eq!(picker.pieces_have(), 2);
    }
}
