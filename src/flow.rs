//! Credit-based flow control.
//!
//! Each side owns `buf_num` receive buffers and may have at most
//! `buf_num - 1` messages in flight towards the peer, so the peer always
//! keeps one free receive buffer. When a receiver's grant counter runs
//! out it tops the sender back up with a minimal one-byte flow-control
//! packet, which the sender consumes silently.

use crate::buffer::BufIndex;

/// Wire length of a flow-control packet. Any message of exactly this
/// length is control traffic, never payload.
pub const FLOW_CONTROL_MSG_LEN: usize = 1;

/// The two credit counters of one connection.
///
/// `send_credits` is how many more messages we may post before the peer
/// must grant again; `recv_credits` is how many more messages we may
/// retire before we owe the peer a grant. Both start at `buf_num - 1`
/// and each refreshes to `buf_num - 1` when traffic in the opposite
/// direction proves the peer has caught up.
#[derive(Debug)]
pub struct FlowCounters {
    send_credits: u32,
    recv_credits: u32,
    buf_num: u32,
}

impl FlowCounters {
    pub fn new(buf_num: u32) -> Self {
        debug_assert!(buf_num >= 1);
        Self {
            send_credits: buf_num - 1,
            recv_credits: buf_num - 1,
            buf_num,
        }
    }

    #[inline]
    pub fn send_credits(&self) -> u32 {
        self.send_credits
    }

    #[inline]
    pub fn recv_credits(&self) -> u32 {
        self.recv_credits
    }

    /// No more sends allowed until the peer grants.
    #[inline]
    pub fn send_exhausted(&self) -> bool {
        self.send_credits == 0
    }

    /// Account for one posted send. Any message reaching the peer is an
    /// implicit grant for its receive side, so its counter resets here.
    pub fn on_send_posted(&mut self) {
        debug_assert!(self.send_credits > 0);
        self.recv_credits = self.buf_num - 1;
        self.send_credits -= 1;
    }

    /// Account for one retired receive. Any message arriving from the
    /// peer is an implicit grant for our send side. Returns true when we
    /// now owe the peer an explicit flow-control packet.
    pub fn on_recv_retired(&mut self) -> bool {
        debug_assert!(self.recv_credits > 0);
        self.send_credits = self.buf_num - 1;
        self.recv_credits -= 1;
        self.recv_credits == 0
    }
}

/// Send-side in-flight accounting.
///
/// `outstanding` counts posted-but-uncompleted sends; `cursor` is the
/// buffer slot the next send will occupy, wrapping modulo `buf_num`.
/// Because sends retire in posting order, a slot is free again exactly
/// when `outstanding` has dropped below `buf_num` by the time the
/// cursor comes back around. `force_wait_all` latches when a
/// non-blocking send used a partially available window and the next
/// blocking operation must first drain everything.
#[derive(Debug, Default)]
pub struct SendWindow {
    outstanding: u32,
    cursor: u32,
    force_wait_all: bool,
}

impl SendWindow {
    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    #[inline]
    pub fn is_full(&self, buf_num: u32) -> bool {
        self.outstanding >= buf_num
    }

    /// Slot the next send will occupy.
    #[inline]
    pub fn next_slot(&self, buf_num: u32) -> BufIndex {
        BufIndex::wrapping(self.cursor, buf_num)
    }

    /// Slot of the oldest in-flight send. Sends retire in posting
    /// order, so this is the only wr_id a valid send completion can
    /// carry.
    #[inline]
    pub fn oldest_slot(&self, buf_num: u32) -> BufIndex {
        debug_assert!(self.outstanding > 0 && self.outstanding <= buf_num);
        BufIndex::wrapping(
            self.cursor + buf_num - (self.outstanding % buf_num),
            buf_num,
        )
    }

    pub fn on_posted(&mut self, buf_num: u32) {
        self.outstanding += 1;
        self.cursor = (self.cursor + 1) % buf_num;
    }

    /// Roll back the optimistic increment after a failed post.
    pub fn on_post_failed(&mut self, buf_num: u32) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.cursor = (self.cursor + buf_num - 1) % buf_num;
    }

    pub fn on_completed(&mut self, retired: u32) {
        debug_assert!(retired <= self.outstanding);
        self.outstanding -= retired;
    }

    #[inline]
    pub fn force_wait_all(&self) -> bool {
        self.force_wait_all
    }

    pub fn set_force_wait_all(&mut self, v: bool) {
        self.force_wait_all = v;
    }
}

/// A received message not yet fully consumed by the application.
#[derive(Debug, Clone, Copy)]
pub struct PendingRecv {
    /// Receive-buffer slot holding the message.
    pub index: BufIndex,
    /// Total message length as reported by the completion.
    pub total_len: usize,
    /// Bytes already handed to the application.
    pub consumed: usize,
}

impl PendingRecv {
    pub fn new(index: BufIndex, total_len: usize) -> Self {
        Self {
            index,
            total_len,
            consumed: 0,
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.total_len - self.consumed
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.consumed >= self.total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_credits() {
        let fc = FlowCounters::new(4);
        assert_eq!(fc.send_credits(), 3);
        assert_eq!(fc.recv_credits(), 3);
        assert!(!fc.send_exhausted());
    }

    #[test]
    fn test_send_exhaustion_after_buf_num_minus_one() {
        let mut fc = FlowCounters::new(4);
        fc.on_send_posted();
        fc.on_send_posted();
        assert!(!fc.send_exhausted());
        fc.on_send_posted();
        assert!(fc.send_exhausted());
    }

    #[test]
    fn test_recv_retired_refreshes_send_credits() {
        let mut fc = FlowCounters::new(4);
        fc.on_send_posted();
        fc.on_send_posted();
        fc.on_send_posted();
        assert!(fc.send_exhausted());

        // Any inbound message regrants the full send window.
        let owes = fc.on_recv_retired();
        assert!(!owes);
        assert_eq!(fc.send_credits(), 3);
    }

    #[test]
    fn test_control_packet_owed_when_recv_credits_hit_zero() {
        let mut fc = FlowCounters::new(3);
        assert!(!fc.on_recv_retired());
        assert!(fc.on_recv_retired());
        // The posted control packet counts as a send and refreshes our
        // view of the peer's receive window.
        fc.on_send_posted();
        assert_eq!(fc.recv_credits(), 2);
    }

    #[test]
    fn test_minimal_pool_alternates_every_message() {
        // With buf_num == 2 each retired receive owes a grant.
        let mut fc = FlowCounters::new(2);
        assert!(fc.on_recv_retired());
        fc.on_send_posted();
        assert!(fc.send_exhausted());
        assert!(fc.on_recv_retired());
    }

    #[test]
    fn test_send_window_slot_wraps() {
        let mut w = SendWindow::default();
        assert_eq!(w.next_slot(4).get(), 0);
        for _ in 0..4 {
            w.on_posted(4);
        }
        assert!(w.is_full(4));
        w.on_completed(4);
        assert_eq!(w.outstanding(), 0);
        assert_eq!(w.next_slot(4).get(), 0);
    }

    #[test]
    fn test_send_window_partial_completion_keeps_cursor() {
        let mut w = SendWindow::default();
        w.on_posted(4);
        w.on_posted(4);
        // Oldest send retires; slots 0 and 1 both cycle back eventually,
        // but the next post still goes to slot 2.
        w.on_completed(1);
        assert_eq!(w.outstanding(), 1);
        assert_eq!(w.next_slot(4).get(), 2);

        // A failed post hands its slot back.
        w.on_posted(4);
        w.on_post_failed(4);
        assert_eq!(w.next_slot(4).get(), 2);
    }

    #[test]
    fn test_oldest_slot_tracks_completion_order() {
        let mut w = SendWindow::default();
        w.on_posted(4);
        w.on_posted(4);
        w.on_posted(4);
        assert_eq!(w.oldest_slot(4).get(), 0);
        w.on_completed(1);
        assert_eq!(w.oldest_slot(4).get(), 1);

        // A full window wraps all the way around to the cursor.
        w.on_posted(4);
        w.on_posted(4);
        assert!(w.is_full(4));
        assert_eq!(w.oldest_slot(4).get(), 1);
        assert_eq!(w.next_slot(4).get(), 1);
    }

    #[test]
    fn test_pending_recv_accounting() {
        let mut pending = PendingRecv::new(BufIndex::wrapping(1, 4), 300);
        pending.consumed += 100;
        assert_eq!(pending.remaining(), 200);
        assert!(!pending.is_done());
        pending.consumed += 200;
        assert!(pending.is_done());
    }
}
