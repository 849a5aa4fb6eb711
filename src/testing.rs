//! Deterministic in-process fabric.
//!
//! [`MemFabric`] implements the fabric seam entirely in memory:
//! registration hands out plain heap storage behind fake DMA addresses,
//! connection-manager events are delivered synchronously from the call
//! that causes them, and the test driver plays the peer by injecting
//! messages and draining what the stream posted. Everything is
//! observable, nothing is timing-dependent.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use crate::config::KeyType;
use crate::error::{Error, Result};
use crate::fabric::{
    AccessFlags, CmEvent, CmVerdict, CompletionSignal, ConnParam, ConnectionId, Direction,
    EventSink, Fabric, QueuePair, QueuePairAttr, RegisteredMemory, RemoteBuffer, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::handshake::{PeerDest, PEER_DEST_LEN};

/// What the fabric does with a one-sided liveness read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadBehavior {
    /// Complete it successfully, copying from the target region.
    #[default]
    Succeed,
    /// Complete it with an error status.
    Fail,
    /// Never complete it, as a dead remote adapter would.
    Silent,
}

/// Scripted behavior of the simulated peer and fabric.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Receive geometry the peer advertises in its handshake blob.
    pub recv_buf_num: u32,
    pub recv_buf_size: u32,
    /// Reject this many establishment attempts as stale before
    /// accepting.
    pub stale_rejections: u32,
    /// Reject establishment outright (non-stale).
    pub refuse: bool,
    pub fail_addr_resolution: bool,
    pub fail_route_resolution: bool,
    pub fail_connect: bool,
    /// Handshake blob to send instead of a well-formed one.
    pub private_data_override: Option<Vec<u8>>,
    /// Retire sends as soon as they are posted. Turn off to script
    /// completion timing by hand.
    pub auto_complete_sends: bool,
    pub read_behavior: ReadBehavior,
    pub devices_exist: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            recv_buf_num: 64,
            recv_buf_size: 1 << 20,
            stale_rejections: 0,
            refuse: false,
            fail_addr_resolution: false,
            fail_route_resolution: false,
            fail_connect: false,
            private_data_override: None,
            auto_complete_sends: true,
            read_behavior: ReadBehavior::default(),
            devices_exist: true,
        }
    }
}

struct Inner {
    cfg: PeerConfig,
    next_addr: u64,
    /// Backing storage of live registrations, keyed by fake DMA address.
    regions: HashMap<u64, Arc<Mutex<Vec<u8>>>>,
    registration_log: Vec<u64>,
    unregistration_log: Vec<u64>,
    ids_created: u32,
    stale_left: u32,
    bound_addr: Option<SocketAddrV4>,
    listening: bool,
    /// Sink of the most recently created identifier.
    sink: Option<Arc<dyn EventSink>>,
    /// Handshake blob the initiator sent with its establishment request.
    initiator_blob: Option<Vec<u8>>,
    /// Liveness target the simulated peer advertised.
    peer_liveness_addr: Option<u64>,
    /// Posted receive work requests, oldest first.
    posted_recvs: VecDeque<(u64, Vec<Sge>)>,
    /// Payloads the stream posted, oldest first.
    sent_messages: Vec<Vec<u8>>,
    /// Posted sends not yet moved to the completion queue.
    pending_sends: VecDeque<WorkCompletion>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
    send_signal: Option<Arc<CompletionSignal>>,
    recv_signal: Option<Arc<CompletionSignal>>,
}

/// The in-memory fabric plus the test driver's view of the peer.
#[derive(Clone)]
pub struct MemFabric {
    inner: Arc<Mutex<Inner>>,
}

impl MemFabric {
    pub fn new(cfg: PeerConfig) -> Self {
        let stale_left = cfg.stale_rejections;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cfg,
                next_addr: 0x1000,
                regions: HashMap::new(),
                registration_log: Vec::new(),
                unregistration_log: Vec::new(),
                ids_created: 0,
                stale_left,
                bound_addr: None,
                listening: false,
                sink: None,
                initiator_blob: None,
                peer_liveness_addr: None,
                posted_recvs: VecDeque::new(),
                sent_messages: Vec::new(),
                pending_sends: VecDeque::new(),
                send_cq: VecDeque::new(),
                recv_cq: VecDeque::new(),
                send_signal: None,
                recv_signal: None,
            })),
        }
    }

    // === test-driver surface ===

    /// Deliver a payload from the peer into the oldest posted receive
    /// buffer.
    ///
    /// # Panics
    /// Panics when no receive buffer is posted, which on real hardware
    /// would be a receiver-not-ready stall.
    pub fn deliver(&self, payload: &[u8]) {
        let signal;
        {
            let mut inner = self.inner.lock().unwrap();
            let (wr_id, sges) = inner
                .posted_recvs
                .pop_front()
                .expect("peer sent with no receive buffer posted");
            let mut off = 0usize;
            for sge in &sges {
                if off >= payload.len() {
                    break;
                }
                let n = (payload.len() - off).min(sge.length as usize);
                let storage = inner.regions.get(&sge.addr).expect("sge into dead region");
                storage.lock().unwrap()[..n].copy_from_slice(&payload[off..off + n]);
                off += n;
            }
            assert_eq!(off, payload.len(), "payload larger than the receive buffer");
            inner.recv_cq.push_back(WorkCompletion {
                wr_id,
                byte_len: payload.len() as u32,
                opcode: WcOpcode::Recv,
                status: WcStatus::Success,
            });
            signal = inner.recv_signal.clone();
        }
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Deliver a one-byte flow-control grant from the peer.
    pub fn deliver_control(&self) {
        self.deliver(&[0u8]);
    }

    /// Deliver a receive completion claiming `byte_len` bytes without
    /// writing any, as a corrupt adapter would. Consumes one posted
    /// buffer.
    pub fn deliver_corrupt_length(&self, byte_len: u32) {
        let signal;
        {
            let mut inner = self.inner.lock().unwrap();
            let (wr_id, _) = inner
                .posted_recvs
                .pop_front()
                .expect("no receive buffer posted");
            inner.recv_cq.push_back(WorkCompletion {
                wr_id,
                byte_len,
                opcode: WcOpcode::Recv,
                status: WcStatus::Success,
            });
            signal = inner.recv_signal.clone();
        }
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Deliver a receive completion with the given error status,
    /// consuming one posted buffer.
    pub fn deliver_error(&self, status: WcStatus) {
        let signal;
        {
            let mut inner = self.inner.lock().unwrap();
            let (wr_id, _) = inner
                .posted_recvs
                .pop_front()
                .expect("no receive buffer posted");
            inner.recv_cq.push_back(WorkCompletion {
                wr_id,
                byte_len: 0,
                opcode: WcOpcode::Recv,
                status,
            });
            signal = inner.recv_signal.clone();
        }
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Payloads the stream has posted so far, in order.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent_messages.clone()
    }

    /// Number of receive buffers currently posted.
    pub fn posted_recv_count(&self) -> usize {
        self.inner.lock().unwrap().posted_recvs.len()
    }

    /// Number of connection identifiers created so far.
    pub fn ids_created(&self) -> u32 {
        self.inner.lock().unwrap().ids_created
    }

    /// The handshake blob the initiator sent, once it has.
    pub fn initiator_blob(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().initiator_blob.clone()
    }

    /// Move up to `n` posted-but-unretired sends to the completion
    /// queue. Only useful with `auto_complete_sends` off.
    pub fn complete_sends(&self, n: usize) {
        let signal;
        {
            let mut inner = self.inner.lock().unwrap();
            for _ in 0..n {
                let Some(wc) = inner.pending_sends.pop_front() else {
                    break;
                };
                inner.send_cq.push_back(wc);
            }
            signal = inner.send_signal.clone();
        }
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Deliver a disconnect event, as a peer teardown would.
    pub fn disconnect_peer(&self) {
        let sink = self.inner.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.on_cm_event(CmEvent::Disconnected);
        }
        // Waiters notice through their next poll.
        let (send_signal, recv_signal) = {
            let inner = self.inner.lock().unwrap();
            (inner.send_signal.clone(), inner.recv_signal.clone())
        };
        if let Some(s) = send_signal {
            s.notify();
        }
        if let Some(s) = recv_signal {
            s.notify();
        }
    }

    /// Deliver an inbound connection request to the current identifier
    /// and report the sink's verdict.
    pub fn inject_connect_request(&self) -> CmVerdict {
        let sink = self.inner.lock().unwrap().sink.clone();
        sink.expect("no identifier created")
            .on_cm_event(CmEvent::ConnectRequest)
    }

    /// Address the most recent identifier bound, if any.
    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.inner.lock().unwrap().bound_addr
    }

    /// Whether an identifier is in the listening state.
    pub fn is_listening(&self) -> bool {
        self.inner.lock().unwrap().listening
    }

    /// Registered region addresses, in registration order.
    pub fn registration_log(&self) -> Vec<u64> {
        self.inner.lock().unwrap().registration_log.clone()
    }

    /// Unregistered region addresses, in unregistration order.
    pub fn unregistration_log(&self) -> Vec<u64> {
        self.inner.lock().unwrap().unregistration_log.clone()
    }

    fn register_region(&self, len: usize) -> MemRegion {
        let mut inner = self.inner.lock().unwrap();
        let addr = inner.next_addr;
        inner.next_addr += (len as u64).max(8).next_multiple_of(0x1000);
        let storage = Arc::new(Mutex::new(vec![0u8; len]));
        inner.regions.insert(addr, storage.clone());
        inner.registration_log.push(addr);
        MemRegion {
            addr,
            len,
            storage,
            fabric: self.inner.clone(),
        }
    }

    fn make_peer_blob(&self) -> Vec<u8> {
        let (blob_override, existing, buf_num, buf_size) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.cfg.private_data_override.clone(),
                inner.peer_liveness_addr,
                inner.cfg.recv_buf_num,
                inner.cfg.recv_buf_size,
            )
        };
        if let Some(blob) = blob_override {
            return blob;
        }
        let liveness_addr = match existing {
            Some(addr) => addr,
            None => {
                let region = self.register_region(8);
                let addr = region.addr;
                // Lives for the fabric's lifetime; skipping Drop keeps
                // it in the registry.
                std::mem::forget(region);
                self.inner.lock().unwrap().peer_liveness_addr = Some(addr);
                addr
            }
        };
        let mut blob = PeerDest {
            liveness_addr,
            liveness_rkey: (liveness_addr as u32) ^ 0x5afe,
            recv_buf_num: buf_num,
            recv_buf_size: buf_size,
        }
        .encode()
        .to_vec();
        debug_assert_eq!(blob.len(), PEER_DEST_LEN);
        // Real transports pad private data; exercise that tolerance.
        blob.extend_from_slice(&[0u8; 12]);
        blob
    }
}

impl Fabric for MemFabric {
    fn create_id(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn ConnectionId>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ids_created += 1;
        inner.sink = Some(sink.clone());
        Ok(Box::new(MemConnection {
            fabric: self.clone(),
            sink,
        }))
    }

    fn devices_exist(&self) -> bool {
        self.inner.lock().unwrap().cfg.devices_exist
    }
}

struct MemConnection {
    fabric: MemFabric,
    sink: Arc<dyn EventSink>,
}

impl ConnectionId for MemConnection {
    fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        self.fabric.inner.lock().unwrap().bound_addr = Some(addr);
        Ok(())
    }

    fn listen(&self) -> Result<()> {
        let mut inner = self.fabric.inner.lock().unwrap();
        if inner.bound_addr.is_none() {
            return Err(Error::Comm("listen on an unbound identifier".into()));
        }
        inner.listening = true;
        Ok(())
    }

    fn resolve_addr(
        &self,
        _src: Option<Ipv4Addr>,
        _dst: SocketAddrV4,
        _timeout_ms: u32,
    ) -> Result<()> {
        let fail = self.fabric.inner.lock().unwrap().cfg.fail_addr_resolution;
        if fail {
            self.sink.on_cm_event(CmEvent::AddrError);
        } else {
            self.sink.on_cm_event(CmEvent::AddrResolved);
        }
        Ok(())
    }

    fn resolve_route(&self, _timeout_ms: u32) -> Result<()> {
        let fail = self.fabric.inner.lock().unwrap().cfg.fail_route_resolution;
        if fail {
            self.sink.on_cm_event(CmEvent::RouteError);
        } else {
            self.sink.on_cm_event(CmEvent::RouteResolved);
        }
        Ok(())
    }

    fn connect(&self, param: ConnParam<'_>) -> Result<()> {
        let event = {
            let mut inner = self.fabric.inner.lock().unwrap();
            inner.initiator_blob = Some(param.private_data.to_vec());
            if inner.cfg.fail_connect {
                Some(CmEvent::ConnectError)
            } else if inner.cfg.refuse {
                Some(CmEvent::Rejected { stale: false })
            } else if inner.stale_left > 0 {
                inner.stale_left -= 1;
                Some(CmEvent::Rejected { stale: true })
            } else {
                // Blob construction may register memory, which needs
                // the lock.
                None
            }
        };
        let event = event.unwrap_or_else(|| CmEvent::Established {
            private_data: self.fabric.make_peer_blob(),
        });
        self.sink.on_cm_event(event);
        Ok(())
    }

    fn disconnect(&self) {}

    fn register(
        &self,
        len: usize,
        _dir: Direction,
        _access: AccessFlags,
    ) -> Result<Box<dyn RegisteredMemory>> {
        Ok(Box::new(self.fabric.register_region(len)))
    }

    fn unsafe_rkey(&self, _key_type: KeyType) -> Result<u32> {
        Ok(0x5afe)
    }

    fn create_queue_pair(&self, attr: QueuePairAttr) -> Result<Box<dyn QueuePair>> {
        let mut inner = self.fabric.inner.lock().unwrap();
        inner.send_signal = Some(attr.send_signal);
        inner.recv_signal = Some(attr.recv_signal);
        Ok(Box::new(MemQueuePair {
            fabric: self.fabric.clone(),
        }))
    }
}

struct MemQueuePair {
    fabric: MemFabric,
}

impl QueuePair for MemQueuePair {
    fn post_send(&self, wr_id: u64, sges: &[Sge]) -> Result<()> {
        let (auto, signal) = {
            let mut inner = self.fabric.inner.lock().unwrap();
            let mut payload = Vec::new();
            for sge in sges {
                let storage = inner
                    .regions
                    .get(&sge.addr)
                    .ok_or_else(|| Error::Comm("send from unregistered memory".into()))?;
                let data = storage.lock().unwrap();
                payload.extend_from_slice(&data[..sge.length as usize]);
            }
            inner.sent_messages.push(payload);
            let wc = WorkCompletion {
                wr_id,
                byte_len: 0,
                opcode: WcOpcode::Send,
                status: WcStatus::Success,
            };
            let auto = inner.cfg.auto_complete_sends;
            if auto {
                inner.send_cq.push_back(wc);
            } else {
                inner.pending_sends.push_back(wc);
            }
            (auto, inner.send_signal.clone())
        };
        if auto {
            if let Some(signal) = signal {
                signal.notify();
            }
        }
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, sges: &[Sge]) -> Result<()> {
        let mut inner = self.fabric.inner.lock().unwrap();
        inner.posted_recvs.push_back((wr_id, sges.to_vec()));
        Ok(())
    }

    fn post_read(&self, wr_id: u64, sge: Sge, remote: RemoteBuffer) -> Result<()> {
        let (behavior, signal) = {
            let inner = self.fabric.inner.lock().unwrap();
            (inner.cfg.read_behavior, inner.send_signal.clone())
        };
        match behavior {
            ReadBehavior::Silent => return Ok(()),
            ReadBehavior::Fail => {
                let mut inner = self.fabric.inner.lock().unwrap();
                inner.send_cq.push_back(WorkCompletion {
                    wr_id,
                    byte_len: 0,
                    opcode: WcOpcode::RdmaRead,
                    status: WcStatus::ResponseTimeout,
                });
            }
            ReadBehavior::Succeed => {
                let mut inner = self.fabric.inner.lock().unwrap();
                if let Some(remote_storage) = inner.regions.get(&remote.addr) {
                    let data = remote_storage.lock().unwrap().clone();
                    if let Some(local) = inner.regions.get(&sge.addr) {
                        let n = (sge.length as usize).min(data.len());
                        local.lock().unwrap()[..n].copy_from_slice(&data[..n]);
                    }
                }
                inner.send_cq.push_back(WorkCompletion {
                    wr_id,
                    byte_len: sge.length,
                    opcode: WcOpcode::RdmaRead,
                    status: WcStatus::Success,
                });
            }
        }
        if let Some(signal) = signal {
            signal.notify();
        }
        Ok(())
    }

    fn poll_send(&self, out: &mut [WorkCompletion]) -> Result<usize> {
        let mut inner = self.fabric.inner.lock().unwrap();
        let mut n = 0;
        while n < out.len() {
            let Some(wc) = inner.send_cq.pop_front() else {
                break;
            };
            out[n] = wc;
            n += 1;
        }
        Ok(n)
    }

    fn poll_recv(&self, out: &mut [WorkCompletion]) -> Result<usize> {
        let mut inner = self.fabric.inner.lock().unwrap();
        let mut n = 0;
        while n < out.len() {
            let Some(wc) = inner.recv_cq.pop_front() else {
                break;
            };
            out[n] = wc;
            n += 1;
        }
        Ok(n)
    }
}

struct MemRegion {
    addr: u64,
    len: usize,
    storage: Arc<Mutex<Vec<u8>>>,
    fabric: Arc<Mutex<Inner>>,
}

impl RegisteredMemory for MemRegion {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.addr as u32
    }

    fn rkey(&self) -> u32 {
        (self.addr as u32) ^ 0x5afe
    }

    fn write_at(&self, offset: usize, src: &[u8]) {
        self.storage.lock().unwrap()[offset..offset + src.len()].copy_from_slice(src);
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.storage.lock().unwrap()[offset..offset + dst.len()]);
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        let mut inner = self.fabric.lock().unwrap();
        inner.regions.remove(&self.addr);
        inner.unregistration_log.push(self.addr);
    }
}
