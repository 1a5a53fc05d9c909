//! Bounded circular pool of frame buffers
//!
//! The pool owns `depth` pre-allocated [`Frame`] slots and hands them out
//! round-robin. Nothing is allocated after construction: acquisition
//! describes a native frame into the slot in place. A slot handed out again
//! before its previous occupant was delivered is overwritten; every hand-out
//! bumps the slot's epoch so stale [`SlotTicket`]s no longer resolve.

use peerlink_core::{Frame, FrameFormat, PeerLinkError, PeerLinkResult};

/// Default number of slots
pub const DEFAULT_POOL_DEPTH: usize = 3;

#[derive(Debug)]
struct PoolSlot {
    frame: Frame,
    epoch: u64,
}

/// Refers to one hand-out of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTicket {
    index: usize,
    epoch: u64,
}

impl SlotTicket {
    /// Slot index inside the pool
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-size round-robin frame pool
#[derive(Debug)]
pub struct FramePool {
    slots: Vec<PoolSlot>,
    next: usize,
    epoch: u64,
}

impl FramePool {
    /// Create a pool of `depth` slots
    pub fn new(depth: usize) -> PeerLinkResult<Self> {
        if depth == 0 {
            return Err(PeerLinkError::invalid_param("frame pool depth must be at least 1"));
        }
        let slots = (0..depth)
            .map(|_| PoolSlot {
                frame: Frame::empty(FrameFormat::Yuv420_888),
                epoch: 0,
            })
            .collect();
        Ok(Self {
            slots,
            next: 0,
            epoch: 0,
        })
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Hand out the next slot round-robin, invalidating its previous ticket
    pub fn get(&mut self) -> (SlotTicket, &mut Frame) {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();
        self.epoch += 1;

        let slot = &mut self.slots[index];
        slot.epoch = self.epoch;
        (
            SlotTicket {
                index,
                epoch: slot.epoch,
            },
            &mut slot.frame,
        )
    }

    /// Frame behind `ticket`, unless the slot has been handed out again since
    pub fn frame(&self, ticket: SlotTicket) -> Option<&Frame> {
        self.slots
            .get(ticket.index)
            .filter(|slot| slot.epoch == ticket.epoch)
            .map(|slot| &slot.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_depth_rejected() {
        assert!(FramePool::new(0).is_err());
    }

    #[test]
    fn test_round_robin_reuses_oldest_slot() {
        let mut pool = FramePool::new(DEFAULT_POOL_DEPTH).unwrap();
        let first = pool.get().0;
        let second = pool.get().0;
        let third = pool.get().0;
        assert_eq!([first.index(), second.index(), third.index()], [0, 1, 2]);

        let fourth = pool.get().0;
        assert_eq!(fourth.index(), first.index());
        assert!(pool.frame(first).is_none());
        assert!(pool.frame(second).is_some());
        assert!(pool.frame(fourth).is_some());
        assert_eq!(pool.depth(), 3);
    }

    #[test]
    fn test_slot_keeps_its_allocation() {
        let mut pool = FramePool::new(1).unwrap();
        let capacity = {
            let (_, frame) = pool.get();
            frame.planes.capacity()
        };
        let (_, frame) = pool.get();
        assert_eq!(frame.planes.capacity(), capacity);
    }
}
