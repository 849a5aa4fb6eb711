//! The connected stream.
//!
//! [`RcStream`] is a reliable, ordered, message-fragmenting byte stream
//! over one reliable-connected queue pair. It owns its connection
//! identifier, handshake state and [`CommContext`], and drives the whole
//! lifecycle: multi-stage connect with stale retry, credit-checked sends,
//! buffer-pool receives, liveness checks against a silently dead peer,
//! two-phase readiness polling and bounded shutdown.
//!
//! One thread drives the data path; only the handshake state is shared
//! with the fabric's event-delivery thread.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::buffer::BufIndex;
use crate::config::{CommConfig, TimeoutConfig, DEFAULT_STALE_RETRIES, SHUTDOWN_TIMEOUT_MS};
use crate::context::{CommContext, CHECK_CONN_WR_ID};
use crate::error::{Error, Result};
use crate::fabric::{
    CompletionSignal, ConnParam, ConnectionId, Fabric, WcOpcode, WcStatus, WorkCompletion,
};
use crate::flow::{PendingRecv, FLOW_CONTROL_MSG_LEN};
use crate::handshake::{ConnState, PeerDest, SharedState, StateEventSink};

/// Slice length for waits with no caller deadline. Each expiry triggers
/// a liveness check instead of sleeping forever against a dead peer.
const INFINITE_RECV_SLICE_MS: u32 = 1_000_000;

bitflags! {
    /// Send flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Send only what fits right now; never block.
        const DONTWAIT = 1 << 0;
    }
}

bitflags! {
    /// Readiness classes for [`RcStream::poll`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        /// Received data is available.
        const IN = 1 << 0;
        /// A send of at least one message would not block.
        const OUT = 1 << 1;
        /// The connection is dead.
        const ERR = 1 << 2;
    }
}

/// Options for [`RcStream::connect_with`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Local address to resolve from; `None` lets the fabric pick.
    pub src: Option<Ipv4Addr>,
    pub timeouts: TimeoutConfig,
    /// How many times to retry when the peer rejects our connection
    /// identifier as stale state from a dead prior session.
    pub stale_retries: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            src: None,
            timeouts: TimeoutConfig::default(),
            stale_retries: DEFAULT_STALE_RETRIES,
        }
    }
}

/// A reliable connected stream to one peer.
pub struct RcStream {
    conn: Box<dyn ConnectionId>,
    state: Arc<SharedState>,
    ctx: CommContext,
    timeouts: TimeoutConfig,
}

impl RcStream {
    /// Connect to `dst` with default options.
    pub fn connect(fabric: &dyn Fabric, cfg: &CommConfig, dst: SocketAddrV4) -> Result<Self> {
        Self::connect_with(fabric, cfg, dst, &ConnectOptions::default())
    }

    /// Connect to `dst`.
    ///
    /// Runs the full multi-stage handshake: address resolution, route
    /// resolution, resource allocation, establishment with our
    /// handshake blob as private data, then peer-blob validation and
    /// receive-pool posting. A stale rejection restarts the whole
    /// attempt with a fresh connection identifier, up to
    /// `opts.stale_retries` times.
    pub fn connect_with(
        fabric: &dyn Fabric,
        cfg: &CommConfig,
        dst: SocketAddrV4,
        opts: &ConnectOptions,
    ) -> Result<Self> {
        cfg.validate()?;
        if !fabric.devices_exist() {
            return Err(Error::Comm("no rdma-capable device available".into()));
        }

        let timeouts = opts.timeouts;
        let mut stale_attempts = 0u32;
        loop {
            // Stale state lives in the identifier, so every attempt
            // starts from a fresh one.
            let state = SharedState::new();
            let sink = Arc::new(StateEventSink::new(state.clone()));
            let conn = fabric.create_id(sink)?;

            state.set(ConnState::Connecting);
            conn.resolve_addr(opts.src, dst, timeouts.connect_ms)?;
            if state.wait_leave(ConnState::Connecting) != ConnState::AddrResolved {
                return Err(Error::Comm(format!("address resolution failed for {dst}")));
            }

            conn.resolve_route(timeouts.connect_ms)?;
            if state.wait_leave(ConnState::AddrResolved) != ConnState::RouteResolved {
                return Err(Error::Comm(format!("route resolution failed for {dst}")));
            }

            let mut ctx = CommContext::new(conn.as_ref(), cfg)?;
            let dest = ctx.local_dest().encode();
            conn.connect(ConnParam {
                private_data: &dest,
                responder_resources: 1,
                initiator_depth: 1,
                retry_count: 7,
                rnr_retry_count: 7,
            })?;

            match state.wait_leave_timeout(ConnState::RouteResolved, timeouts.connect_ms)? {
                ConnState::Established => {
                    let data = state
                        .take_established_data()
                        .ok_or_else(|| Error::Protocol("missing handshake data".into()))?;
                    let peer = PeerDest::parse(&data)?;
                    if peer.recv_buf_num < cfg.buf_num || peer.recv_buf_size < cfg.buf_size {
                        return Err(Error::Protocol(format!(
                            "peer receive window too small: {}x{} < local {}x{}",
                            peer.recv_buf_num, peer.recv_buf_size, cfg.buf_num, cfg.buf_size
                        )));
                    }
                    ctx.peer = Some(peer);
                    ctx.post_all_recvs()?;
                    info!(%dst, stale_attempts, "connection established");
                    return Ok(Self {
                        conn,
                        state,
                        ctx,
                        timeouts,
                    });
                }
                ConnState::RejectedStale => {
                    stale_attempts += 1;
                    if stale_attempts > opts.stale_retries {
                        return Err(Error::Comm(format!(
                            "peer kept rejecting stale connection state after {stale_attempts} attempts"
                        )));
                    }
                    debug!(%dst, stale_attempts, "stale rejection, retrying with a fresh identifier");
                    continue;
                }
                other => {
                    return Err(Error::Comm(format!(
                        "connection to {dst} failed in state {other:?}"
                    )));
                }
            }
        }
    }

    /// Replace the configured timeouts. A value of 0 resets that
    /// timeout to its default.
    pub fn set_timeouts(
        &mut self,
        connect_ms: u32,
        completion_ms: u32,
        flow_send_ms: u32,
        flow_recv_ms: u32,
        poll_ms: u32,
    ) {
        self.timeouts
            .set(connect_ms, completion_ms, flow_send_ms, flow_recv_ms, poll_ms);
    }

    /// Peer geometry and liveness target from the handshake.
    pub fn peer_dest(&self) -> PeerDest {
        self.ctx.peer.expect("stream is always established")
    }

    /// Whether the stream can still be used.
    pub fn is_alive(&self) -> bool {
        !self.state.is_failed()
    }

    /// Handle for sleeping between two [`poll`](Self::poll) phases and
    /// for interrupting blocked waits from another thread.
    pub fn completion_signal(&self) -> Arc<CompletionSignal> {
        self.ctx.signal.clone()
    }

    // === send path ===

    /// Send `buf`, fragmenting into buffer-sized messages.
    ///
    /// Blocking mode returns only when everything is posted. With
    /// [`MsgFlags::DONTWAIT`] it sends the prefix that fits into the
    /// currently free window and returns its length, or `WouldBlock`
    /// when nothing fits.
    pub fn send(&mut self, buf: &[u8], flags: MsgFlags) -> Result<usize> {
        self.ensure_alive()?;
        if buf.is_empty() {
            // A zero-length post would reach the peer as a one-byte
            // class of its own; there is nothing to transfer anyway.
            return Ok(0);
        }

        let buf_size = self.ctx.cfg.buf_size as usize;
        let mut to_send = buf.len();
        let mut clamped = false;
        if flags.contains(MsgFlags::DONTWAIT) {
            (to_send, clamped) = self.nonblocking_send_check(to_send)?;
        }

        let mut sent = 0usize;
        while sent < to_send {
            self.flow_control_on_send_wait(self.timeouts.flow_send_ms)?;
            if self.ctx.window.force_wait_all() || self.ctx.window.is_full(self.ctx.cfg.buf_num) {
                self.wait_for_total_send_completion(self.timeouts.completion_ms)?;
                self.ctx.window.set_force_wait_all(false);
            }

            let chunk = (to_send - sent).min(buf_size);
            let slot = self.ctx.window.next_slot(self.ctx.cfg.buf_num);
            let mut src = &buf[sent..sent + chunk];
            let filled = match self.ctx.send_bufs.get_mut(slot).fill(&mut src) {
                Ok(n) => n,
                // Copy faults are fatal: bytes were promised that the
                // source could not supply.
                Err(e) => return Err(self.fail_with(e)),
            };
            debug_assert_eq!(filled, chunk);

            if let Err(e) = self.ctx.post_send_slot(slot) {
                return Err(self.fail_with(e));
            }
            sent += chunk;
        }
        if clamped {
            // The remainder of the caller's payload was cut off; the
            // next blocking operation drains everything first so the
            // resumed payload stays in stream order.
            self.ctx.window.set_force_wait_all(true);
        }
        Ok(sent)
    }

    /// How much of a `wanted`-byte send can be posted without blocking.
    /// The second result reports that only a prefix fits.
    fn nonblocking_send_check(&mut self, wanted: usize) -> Result<(usize, bool)> {
        self.drain_send_completions()?;

        if self.ctx.window.force_wait_all() {
            // A previous partial send requires a full drain, which a
            // non-blocking call cannot do unless it already happened.
            if self.ctx.window.outstanding() > 0 {
                return Err(Error::WouldBlock);
            }
            self.ctx.window.set_force_wait_all(false);
        }

        if self.ctx.flow.send_exhausted() && !self.try_consume_control_packet()? {
            return Err(Error::WouldBlock);
        }

        let free_slots = self.ctx.cfg.buf_num - self.ctx.window.outstanding();
        let slots = free_slots.min(self.ctx.flow.send_credits());
        if slots == 0 {
            return Err(Error::WouldBlock);
        }
        let max_bytes = slots as usize * self.ctx.cfg.buf_size as usize;
        if wanted > max_bytes {
            Ok((max_bytes, true))
        } else {
            Ok((wanted, false))
        }
    }

    /// Block until the peer has granted at least one send credit.
    ///
    /// With credits exhausted the peer owes us a flow-control packet
    /// before anything else; [`accept_recv_wc`](Self::accept_recv_wc)
    /// kills the connection if payload arrives in that position.
    fn flow_control_on_send_wait(&mut self, timeout_ms: u32) -> Result<()> {
        if !self.ctx.flow.send_exhausted() {
            return Ok(());
        }
        debug!("send window exhausted, waiting for a flow-control grant");
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let (index, len) = self.recv_wc(deadline)?;
        debug_assert_eq!(len, FLOW_CONTROL_MSG_LEN);
        self.retire_recv(index)
    }

    // === receive path ===

    /// Receive into `buf`, blocking without limit. Long waits are cut
    /// into slices, each ending in a liveness check, so a dead peer
    /// surfaces as an error instead of an eternal sleep.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.recv_timeout(buf, INFINITE_RECV_SLICE_MS) {
                Err(Error::Timeout) => continue,
                other => return other,
            }
        }
    }

    /// Receive into `buf`, waiting at most `timeout_ms`.
    ///
    /// Returns the number of bytes copied out. A message larger than
    /// `buf` is handed out across successive calls; its receive buffer
    /// is reposted (and flow control updated) only once it is fully
    /// consumed.
    ///
    /// While our send window is exhausted the peer owes a flow-control
    /// grant before anything else, so payload arriving in the grant's
    /// position kills the connection here too, not just on the send
    /// path.
    pub fn recv_timeout(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.ensure_alive()?;
        if buf.is_empty() {
            return Ok(0);
        }

        if self.ctx.pending_recv.is_none() {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            loop {
                let (index, len) = self.recv_wc(deadline)?;
                if len == FLOW_CONTROL_MSG_LEN {
                    // Grant for our send side; invisible to the caller.
                    self.retire_recv(index)?;
                    continue;
                }
                self.ctx.pending_recv = Some(PendingRecv::new(index, len));
                break;
            }
        }
        self.recv_continue_pending(buf)
    }

    /// Copy out of the pending message and retire its buffer once done.
    fn recv_continue_pending(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut pending = self.ctx.pending_recv.take().expect("pending message");
        let n = self
            .ctx
            .recv_bufs
            .get(pending.index)
            .copy_out(pending.consumed, buf, pending.total_len);
        pending.consumed += n;
        if pending.is_done() {
            self.retire_recv(pending.index)?;
        } else {
            self.ctx.pending_recv = Some(pending);
        }
        Ok(n)
    }

    /// Repost a fully consumed receive buffer and run receive-side flow
    /// control, granting the peer a new window when ours is used up.
    fn retire_recv(&mut self, index: BufIndex) -> Result<()> {
        if let Err(e) = self.ctx.post_recv_slot(index) {
            return Err(self.fail_with(e));
        }
        if self.ctx.flow.on_recv_retired() {
            self.send_flow_control_packet()?;
        }
        Ok(())
    }

    /// Post the one-byte grant. May first have to drain the send window
    /// when all send buffers are in flight.
    fn send_flow_control_packet(&mut self) -> Result<()> {
        if self.ctx.window.force_wait_all() || self.ctx.window.is_full(self.ctx.cfg.buf_num) {
            self.wait_for_total_send_completion(self.timeouts.flow_recv_ms)?;
            self.ctx.window.set_force_wait_all(false);
        }
        let slot = self.ctx.window.next_slot(self.ctx.cfg.buf_num);
        self.ctx.send_bufs.get_mut(slot).prepare_control();
        if let Err(e) = self.ctx.post_send_slot(slot) {
            return Err(self.fail_with(e));
        }
        Ok(())
    }

    /// Wait for one receive completion, slicing the wait so that each
    /// quiet slice triggers a liveness check.
    fn recv_wc(&mut self, deadline: Instant) -> Result<(BufIndex, usize)> {
        let mut wcs = [WorkCompletion {
            wr_id: 0,
            byte_len: 0,
            opcode: WcOpcode::Recv,
            status: WcStatus::Success,
        }];
        loop {
            let seen = self.ctx.signal.count();
            let n = self
                .ctx
                .qp
                .poll_recv(&mut wcs)
                .map_err(|e| self.fail_with(e))?;
            if n > 0 {
                return self.accept_recv_wc(wcs[0]);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let remaining = deadline - now;
            let slice = remaining
                .min(Duration::from_millis(self.timeouts.poll_ms as u64));
            let changed = self.ctx.signal.wait_changed(seen, slice)?;
            if !changed && slice < remaining {
                // Quiet slice with time left: make sure the peer is
                // still there before sleeping again.
                self.check_connection()?;
            }
        }
    }

    /// Validate one receive completion. Every inbound completion funnels
    /// through here, so the flow-control grant discipline is enforced in
    /// one place for the send, receive and readiness paths alike.
    fn accept_recv_wc(&mut self, wc: WorkCompletion) -> Result<(BufIndex, usize)> {
        if wc.status != WcStatus::Success {
            let err = Error::Comm(format!(
                "receive completion failed: {}",
                wc.status.as_str()
            ));
            return Err(self.fail_with(err));
        }
        let index = match BufIndex::from_wr_id(wc.wr_id, self.ctx.cfg.buf_num) {
            Some(index) => index,
            None => {
                let err = Error::Comm(format!("bogus receive wr_id {}", wc.wr_id));
                return Err(self.fail_with(err));
            }
        };
        let len = wc.byte_len as usize;
        if len > self.ctx.cfg.buf_size as usize {
            let err = Error::Comm(format!(
                "receive completion length {len} exceeds the {}-byte buffer",
                self.ctx.cfg.buf_size
            ));
            return Err(self.fail_with(err));
        }
        if self.ctx.flow.send_exhausted() && len != FLOW_CONTROL_MSG_LEN {
            let err = Error::Protocol(format!(
                "expected flow-control packet, got {len}-byte message"
            ));
            return Err(self.fail_with(err));
        }
        Ok((index, len))
    }

    /// Poll the receive queue once; retire an immediately available
    /// control packet. Returns whether one was consumed.
    fn try_consume_control_packet(&mut self) -> Result<bool> {
        let mut wcs = [WorkCompletion {
            wr_id: 0,
            byte_len: 0,
            opcode: WcOpcode::Recv,
            status: WcStatus::Success,
        }];
        let n = self
            .ctx
            .qp
            .poll_recv(&mut wcs)
            .map_err(|e| self.fail_with(e))?;
        if n == 0 {
            return Ok(false);
        }
        // Only called with the send window exhausted, so acceptance
        // already guarantees this is the one-byte grant.
        let (index, len) = self.accept_recv_wc(wcs[0])?;
        debug_assert_eq!(len, FLOW_CONTROL_MSG_LEN);
        self.retire_recv(index)?;
        Ok(true)
    }

    // === send-completion draining ===

    /// Drain all currently retired send-queue completions without
    /// blocking.
    fn drain_send_completions(&mut self) -> Result<()> {
        let mut wcs = [WorkCompletion {
            wr_id: 0,
            byte_len: 0,
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
        }];
        loop {
            let n = self
                .ctx
                .qp
                .poll_send(&mut wcs)
                .map_err(|e| self.fail_with(e))?;
            if n == 0 {
                return Ok(());
            }
            self.account_send_wc(wcs[0])?;
        }
    }

    /// Block until every outstanding send has retired.
    fn wait_for_total_send_completion(&mut self, timeout_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        while self.ctx.window.outstanding() > 0 || self.ctx.check_read_outstanding {
            let seen = self.ctx.signal.count();
            let before = self.ctx.window.outstanding();
            self.drain_send_completions()?;
            if self.ctx.window.outstanding() < before {
                continue;
            }
            if self.ctx.window.outstanding() == 0 && !self.ctx.check_read_outstanding {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                let err = Error::Comm("timed out waiting for send completions".into());
                return Err(self.fail_with(err));
            }
            self.ctx.signal.wait_changed(seen, deadline - now)?;
        }
        Ok(())
    }

    /// Validate and account one send-queue completion.
    fn account_send_wc(&mut self, wc: WorkCompletion) -> Result<()> {
        if wc.status != WcStatus::Success {
            let err = Error::Comm(format!("send completion failed: {}", wc.status.as_str()));
            return Err(self.fail_with(err));
        }
        match wc.opcode {
            WcOpcode::RdmaRead => {
                if wc.wr_id != CHECK_CONN_WR_ID {
                    let err = Error::Comm(format!("bogus read completion wr_id {}", wc.wr_id));
                    return Err(self.fail_with(err));
                }
                self.ctx.check_read_outstanding = false;
                Ok(())
            }
            WcOpcode::Send => {
                if self.ctx.window.outstanding() == 0 {
                    let err = Error::Comm(format!(
                        "send completion with nothing in flight: wr_id {}",
                        wc.wr_id
                    ));
                    return Err(self.fail_with(err));
                }
                let expected = self.ctx.window.oldest_slot(self.ctx.cfg.buf_num);
                if wc.wr_id != expected.wr_id() {
                    let err = Error::Comm(format!(
                        "send completion out of order: wr_id {}, expected {}",
                        wc.wr_id,
                        expected.wr_id()
                    ));
                    return Err(self.fail_with(err));
                }
                self.ctx.window.on_completed(1);
                Ok(())
            }
            WcOpcode::Recv => {
                let err = Error::Comm("receive completion on the send queue".into());
                Err(self.fail_with(err))
            }
        }
    }

    // === liveness ===

    /// Prove the peer's adapter is still reachable with a one-sided
    /// read of its liveness buffer. The read completes without any
    /// involvement of the peer's software, so it checks the path and
    /// the remote adapter, nothing more.
    pub fn check_connection(&mut self) -> Result<()> {
        self.ensure_alive()?;
        debug!("liveness check via one-sided read");
        if let Err(e) = self.ctx.post_liveness_read() {
            return Err(self.fail_with(e));
        }

        let deadline = Instant::now() + Duration::from_millis(self.timeouts.completion_ms as u64);
        while self.ctx.check_read_outstanding {
            let seen = self.ctx.signal.count();
            self.drain_send_completions()?;
            if !self.ctx.check_read_outstanding {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                let err = Error::Comm("liveness check timed out".into());
                return Err(self.fail_with(err));
            }
            self.ctx.signal.wait_changed(seen, deadline - now)?;
        }
        Ok(())
    }

    // === readiness ===

    /// Non-blocking readiness check for a caller-driven wait loop.
    ///
    /// There is no registration step: the completion signal fires on
    /// every completion, so a caller that samples the
    /// [`completion_signal`](Self::completion_signal) count before
    /// polling and sleeps on `wait_changed` with that count cannot miss
    /// a wakeup that lands in between. `finish` marks the last call of
    /// a wait loop; with nothing to deregister it runs the same checks.
    ///
    /// A dead connection reports only `ERR`, with no further queue
    /// access; a fatal error discovered by the checks themselves also
    /// surfaces as `ERR` on the same return.
    pub fn poll(&mut self, events: PollEvents, _finish: bool) -> Result<PollEvents> {
        if self.state.is_failed() {
            return Ok(PollEvents::ERR);
        }
        let mut revents = PollEvents::empty();

        if events.contains(PollEvents::IN) {
            match self.recv_ready() {
                Ok(true) => revents |= PollEvents::IN,
                Ok(false) => {}
                Err(e) if e.is_retryable() => return Err(e),
                // Fatal: the stream is poisoned, reported below.
                Err(_) => {}
            }
        }

        if events.contains(PollEvents::OUT) {
            match self.send_ready() {
                Ok(true) => revents |= PollEvents::OUT,
                Ok(false) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(_) => {}
            }
        }

        // Checked again: anything above may have discovered the death.
        if self.state.is_failed() {
            revents |= PollEvents::ERR;
        }
        Ok(revents)
    }

    /// Data available without blocking. Pulls a waiting completion into
    /// the pending slot; control packets are retired on the spot.
    fn recv_ready(&mut self) -> Result<bool> {
        if self.ctx.pending_recv.is_some() {
            return Ok(true);
        }
        let mut wcs = [WorkCompletion {
            wr_id: 0,
            byte_len: 0,
            opcode: WcOpcode::Recv,
            status: WcStatus::Success,
        }];
        loop {
            let n = self
                .ctx
                .qp
                .poll_recv(&mut wcs)
                .map_err(|e| self.fail_with(e))?;
            if n == 0 {
                return Ok(false);
            }
            let (index, len) = self.accept_recv_wc(wcs[0])?;
            if len == FLOW_CONTROL_MSG_LEN {
                self.retire_recv(index)?;
                continue;
            }
            self.ctx.pending_recv = Some(PendingRecv::new(index, len));
            return Ok(true);
        }
    }

    /// At least one message could be posted without blocking. When the
    /// window is blocked on a peer grant, readiness hinges on the
    /// receive queue, so an already arrived grant is consumed here.
    fn send_ready(&mut self) -> Result<bool> {
        self.drain_send_completions()?;
        if self.ctx.window.force_wait_all() && self.ctx.window.outstanding() > 0 {
            return Ok(false);
        }
        if self.ctx.flow.send_exhausted() && !self.try_consume_control_packet()? {
            return Ok(false);
        }
        Ok(self.ctx.window.outstanding() < self.ctx.cfg.buf_num
            && self.ctx.flow.send_credits() > 0)
    }

    // === shutdown ===

    /// Orderly shutdown: give in-flight sends a short grace period,
    /// then disconnect. Never fails; a dead connection is torn down
    /// as-is.
    pub fn shutdown(&mut self) {
        if !self.state.is_failed()
            && (self.ctx.window.outstanding() > 0 || self.ctx.check_read_outstanding)
        {
            if let Err(e) = self.wait_for_total_send_completion(SHUTDOWN_TIMEOUT_MS) {
                warn!(error = %e, "shutdown with sends still in flight");
            }
        }
        self.conn.disconnect();
        debug!("stream shut down");
    }

    // === helpers ===

    fn ensure_alive(&self) -> Result<()> {
        if self.state.is_failed() {
            return Err(Error::Comm("connection is dead".into()));
        }
        Ok(())
    }

    /// Poison the stream. Every later call fails fast.
    fn fail_with(&self, e: Error) -> Error {
        if !e.is_retryable() {
            self.state.fail();
        }
        e
    }
}

impl fmt::Debug for RcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcStream")
            .field("alive", &!self.state.is_failed())
            .field("buf_num", &self.ctx.cfg.buf_num)
            .field("buf_size", &self.ctx.cfg.buf_size)
            .field("send_credits", &self.ctx.flow.send_credits())
            .field("outstanding_sends", &self.ctx.window.outstanding())
            .finish_non_exhaustive()
    }
}

impl Drop for RcStream {
    fn drop(&mut self) {
        self.conn.disconnect();
    }
}

/// A bound, listening connection identifier.
///
/// Data connections are initiator-only; inbound connection requests are
/// rejected by the event sink. Listening still claims the local address,
/// so a peer probing it gets an immediate rejection instead of a
/// resolution timeout.
pub struct RcListener {
    conn: Box<dyn ConnectionId>,
    addr: SocketAddrV4,
}

impl RcListener {
    /// Bind `addr` on a fresh connection identifier.
    pub fn bind(fabric: &dyn Fabric, addr: SocketAddrV4) -> Result<Self> {
        let sink = Arc::new(StateEventSink::new(SharedState::new()));
        let conn = fabric.create_id(sink)?;
        conn.bind(addr)?;
        Ok(Self { conn, addr })
    }

    /// Start listening. Every inbound request is rejected.
    pub fn listen(&self) -> Result<()> {
        self.conn.listen()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }
}
