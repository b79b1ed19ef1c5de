use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Receive,
    Transmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    InFlight,
    /// Back from the device, not yet processed. Cannot be resubmitted.
    Completed,
}

#[derive(Debug)]
pub struct TransferSlot {
    buffer: Option<Box<[u8]>>,
    requested: usize,
    actual: usize,
    state: SlotState,
}

impl TransferSlot {
    fn with_size(size: usize) -> Self {
        Self {
            buffer: Some(vec![0_u8; size].into_boxed_slice()),
            requested: 0,
            actual: 0,
            state: SlotState::Idle,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn actual(&self) -> usize {
        self.actual
    }
}

/// Fixed ring of transfer slots for one direction.
///
/// Buffers are allocated once; submitting a slot moves its buffer to the
/// transport and the completion moves it back. The submit cursor only
/// advances forward, so completions are expected oldest first.
#[derive(Debug)]
pub struct TransferPool {
    direction: Direction,
    slots: Vec<TransferSlot>,
    slot_bytes: usize,
    submit_cursor: usize,
    oldest: usize,
    in_flight: usize,
}

impl TransferPool {
    pub fn new(direction: Direction, capacity: usize, slot_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            direction,
            slots: (0..capacity)
                .map(|_| TransferSlot::with_size(slot_bytes))
                .collect(),
            slot_bytes,
            submit_cursor: 0,
            oldest: 0,
            in_flight: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn all_home(&self) -> bool {
        self.in_flight == 0
    }

    pub fn slot(&self, idx: usize) -> Option<&TransferSlot> {
        self.slots.get(idx)
    }

    /// The slot due for submission, if its previous occupant has been
    /// completed and processed.
    pub fn next_submit(&self) -> Option<usize> {
        let slot = &self.slots[self.submit_cursor];
        if slot.state == SlotState::Idle && slot.buffer.is_some() {
            Some(self.submit_cursor)
        } else {
            None
        }
    }

    pub fn buffer_mut(&mut self, idx: usize) -> Option<&mut [u8]> {
        self.slots.get_mut(idx)?.buffer.as_deref_mut()
    }

    /// Received bytes of a completed slot.
    pub fn data(&self, idx: usize) -> Option<&[u8]> {
        let slot = self.slots.get(idx)?;
        let buf = slot.buffer.as_deref()?;
        Some(&buf[..slot.actual.min(buf.len())])
    }

    /// Hands the cursor slot's buffer out for submission of `len` bytes.
    pub fn begin_submit(&mut self, idx: usize, len: usize) -> Result<Box<[u8]>> {
        if idx != self.submit_cursor {
            return Err(BridgeError::InvalidState("submission out of ring order"));
        }
        let slot = &mut self.slots[idx];
        if slot.state != SlotState::Idle {
            return Err(BridgeError::InvalidState("slot is busy"));
        }
        let buffer = slot
            .buffer
            .take()
            .ok_or(BridgeError::InvalidState("slot has no buffer"))?;
        if self.in_flight == 0 {
            self.oldest = idx;
        }
        slot.state = SlotState::InFlight;
        slot.requested = len.min(buffer.len());
        slot.actual = 0;
        self.in_flight += 1;
        self.submit_cursor = (self.submit_cursor + 1) % self.slots.len();
        Ok(buffer)
    }

    /// Puts back a buffer the transport refused, rewinding the cursor.
    pub fn abort_submit(&mut self, idx: usize, buffer: Box<[u8]>) {
        let slot = &mut self.slots[idx];
        slot.buffer = Some(buffer);
        slot.state = SlotState::Idle;
        slot.requested = 0;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.submit_cursor = idx;
        self.advance_oldest();
    }

    /// Takes a buffer back from the transport. Completions must arrive in
    /// submission order; an out-of-order completion still returns its buffer
    /// to the pool but is reported as an error.
    pub fn complete(&mut self, idx: usize, buffer: Box<[u8]>, actual: usize) -> Result<()> {
        let expected = self.oldest;
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or_else(|| BridgeError::InvalidParameter(format!("slot {idx} out of range")))?;
        if slot.state != SlotState::InFlight {
            return Err(BridgeError::InvalidState(
                "completion for a slot that is not in flight",
            ));
        }
        slot.actual = actual.min(buffer.len());
        slot.buffer = Some(buffer);
        slot.state = SlotState::Completed;
        self.in_flight -= 1;
        self.advance_oldest();
        if idx != expected {
            return Err(BridgeError::InvalidState("completion out of submission order"));
        }
        Ok(())
    }

    /// Marks a completed slot as processed so it can be submitted again.
    pub fn finish(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            if slot.state == SlotState::Completed {
                slot.state = SlotState::Idle;
            }
        }
    }

    /// Marks every completed slot as processed. Used when the worker stops.
    pub fn finish_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::Completed {
                slot.state = SlotState::Idle;
            }
        }
    }

    fn advance_oldest(&mut self) {
        if self.in_flight == 0 {
            self.oldest = self.submit_cursor;
            return;
        }
        let len = self.slots.len();
        for _ in 0..len {
            if self.slots[self.oldest].state == SlotState::InFlight {
                return;
            }
            self.oldest = (self.oldest + 1) % len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_never_double_submits() {
        let mut pool = TransferPool::new(Direction::Receive, 3, 8);
        let mut out = Vec::new();
        while let Some(idx) = pool.next_submit() {
            out.push((idx, pool.begin_submit(idx, 8).unwrap()));
        }
        assert_eq!(out.len(), 3);
        assert_eq!(pool.in_flight(), 3);
        assert!(pool.next_submit().is_none());
        assert!(pool.begin_submit(0, 8).is_err());

        let (idx, buf) = out.remove(0);
        pool.complete(idx, buf, 5).unwrap();
        // Completed but unprocessed: still not eligible.
        assert!(pool.next_submit().is_none());
        assert_eq!(pool.data(idx).unwrap().len(), 5);
        pool.finish(idx);
        assert_eq!(pool.next_submit(), Some(0));
    }

    #[test]
    fn out_of_order_completion_is_reported_but_not_lost() {
        let mut pool = TransferPool::new(Direction::Transmit, 2, 4);
        let a = pool.begin_submit(0, 4).unwrap();
        let b = pool.begin_submit(1, 4).unwrap();
        assert!(pool.complete(1, b, 4).is_err());
        assert_eq!(pool.slot(1).unwrap().state(), SlotState::Completed);
        pool.complete(0, a, 4).unwrap();
        assert!(pool.all_home());
    }

    #[test]
    fn aborted_submit_rewinds_cursor() {
        let mut pool = TransferPool::new(Direction::Receive, 2, 4);
        let buf = pool.begin_submit(0, 4).unwrap();
        pool.abort_submit(0, buf);
        assert_eq!(pool.next_submit(), Some(0));
        assert!(pool.all_home());
    }

    #[test]
    fn stray_completion_is_rejected() {
        let mut pool = TransferPool::new(Direction::Receive, 2, 4);
        let stray = vec![0_u8; 4].into_boxed_slice();
        assert!(pool.complete(0, stray, 4).is_err());
        assert!(pool.complete(7, vec![0_u8; 4].into_boxed_slice(), 4).is_err());
    }
}
