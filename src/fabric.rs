//! Seam to the RDMA fabric.
//!
//! The transport only ever touches the fabric through the traits in this
//! module: an out-of-band connection manager ([`ConnectionId`]), a queue
//! pair with two completion queues ([`QueuePair`]), and DMA-registered
//! memory ([`RegisteredMemory`]). Address/route resolution, device
//! enumeration and DMA mapping internals live behind these traits; the
//! transport reacts to them via [`CmEvent`]s delivered to an
//! [`EventSink`] and via [`CompletionSignal`] wakeups.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::config::KeyType;
use crate::error::{Error, Result};

/// DMA direction a buffer is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Send buffers: device reads from them.
    ToDevice,
    /// Receive buffers: device writes into them.
    FromDevice,
}

bitflags! {
    /// Access flags for memory registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_READ = 1 << 1;
        const REMOTE_WRITE = 1 << 2;
    }
}

/// Scatter/gather element referencing registered memory.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Remote target of a one-sided operation.
#[derive(Debug, Clone, Copy)]
pub struct RemoteBuffer {
    pub addr: u64,
    pub rkey: u32,
}

/// Opcode of a retired work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaRead,
}

/// Completion status of a retired work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    FlushError,
    RetryExceeded,
    ResponseTimeout,
    GeneralError,
}

impl WcStatus {
    /// Human-readable status string for connection-error logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::FlushError => "work request flush error",
            WcStatus::RetryExceeded => "retries exceeded error",
            WcStatus::ResponseTimeout => "response timeout error",
            WcStatus::GeneralError => "general error",
        }
    }
}

/// A retired work request, as drained from a completion queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Caller-chosen identifier from the posted work request
    /// (a buffer-slot index for sends/receives).
    pub wr_id: u64,
    /// Bytes transferred (receives only).
    pub byte_len: u32,
    pub opcode: WcOpcode,
    pub status: WcStatus,
}

/// Connection-manager events, delivered asynchronously to an [`EventSink`]
/// from a fabric-driven context.
#[derive(Debug, Clone)]
pub enum CmEvent {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectError,
    /// An inbound connection request arrived on a listening identifier.
    ConnectRequest,
    /// The connection is established; carries the peer's handshake
    /// private data.
    Established { private_data: Vec<u8> },
    /// The peer rejected the connection. `stale` means the peer still
    /// associated our identifier with a dead prior session.
    Rejected { stale: bool },
    Disconnected,
    DeviceRemoval,
}

/// How the sink wants the fabric to react to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmVerdict {
    Handled,
    /// Reject the inbound request (only meaningful for `ConnectRequest`).
    Reject,
}

/// Receiver of connection-manager events. Implementations must tolerate
/// being called from a thread other than the one driving the connect.
pub trait EventSink: Send + Sync {
    fn on_cm_event(&self, event: CmEvent) -> CmVerdict;
}

/// Connection parameters for the establishment request.
#[derive(Debug, Clone, Copy)]
pub struct ConnParam<'a> {
    /// Handshake private data, exchanged once at establishment.
    pub private_data: &'a [u8],
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    /// Receiver-not-ready retry count; 7 means infinite.
    pub rnr_retry_count: u8,
}

/// Sizing and notification wiring for a queue pair and its two
/// completion queues.
pub struct QueuePairAttr {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub send_cq_depth: u32,
    pub recv_cq_depth: u32,
    /// Notified whenever a send completion becomes drainable.
    pub send_signal: Arc<CompletionSignal>,
    /// Notified whenever a receive completion becomes drainable.
    pub recv_signal: Arc<CompletionSignal>,
}

/// DMA-registered memory. Dropping the handle unregisters the region.
pub trait RegisteredMemory: Send {
    fn addr(&self) -> u64;
    fn len(&self) -> usize;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
    fn write_at(&self, offset: usize, src: &[u8]);
    fn read_at(&self, offset: usize, dst: &mut [u8]);
}

/// One reliable-connected queue pair plus its completion queues.
pub trait QueuePair: Send {
    fn post_send(&self, wr_id: u64, sges: &[Sge]) -> Result<()>;
    fn post_recv(&self, wr_id: u64, sges: &[Sge]) -> Result<()>;
    /// Post a one-sided read of `remote` into `sge`.
    fn post_read(&self, wr_id: u64, sge: Sge, remote: RemoteBuffer) -> Result<()>;
    /// Drain up to `out.len()` send completions without blocking.
    fn poll_send(&self, out: &mut [WorkCompletion]) -> Result<usize>;
    /// Drain up to `out.len()` receive completions without blocking.
    fn poll_recv(&self, out: &mut [WorkCompletion]) -> Result<usize>;
}

/// One connection identifier: the out-of-band handle used for address and
/// route resolution, the establishment handshake, and resource creation.
pub trait ConnectionId: Send {
    /// Bind the identifier to a local address.
    fn bind(&self, addr: SocketAddrV4) -> Result<()>;
    /// Put the identifier into the listening state. Inbound requests
    /// arrive as [`CmEvent::ConnectRequest`] events on the sink.
    fn listen(&self) -> Result<()>;
    fn resolve_addr(
        &self,
        src: Option<Ipv4Addr>,
        dst: SocketAddrV4,
        timeout_ms: u32,
    ) -> Result<()>;
    fn resolve_route(&self, timeout_ms: u32) -> Result<()>;
    fn connect(&self, param: ConnParam<'_>) -> Result<()>;
    fn disconnect(&self);
    /// Register `len` bytes of DMA-capable memory for this connection.
    fn register(
        &self,
        len: usize,
        dir: Direction,
        access: AccessFlags,
    ) -> Result<Box<dyn RegisteredMemory>>;
    /// Remote key for the unsafe (non-registered) key modes.
    fn unsafe_rkey(&self, key_type: KeyType) -> Result<u32>;
    fn create_queue_pair(&self, attr: QueuePairAttr) -> Result<Box<dyn QueuePair>>;
}

/// Entry point: creates connection identifiers bound to an event sink.
pub trait Fabric: Send + Sync {
    fn create_id(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn ConnectionId>>;

    /// Whether any RDMA-capable device is present. Used by higher levels
    /// to decide whether to attempt RDMA at all.
    fn devices_exist(&self) -> bool {
        true
    }
}

/// Completion-notification bridge: a monotonically increasing event count
/// behind a mutex, signalled through a condvar.
///
/// The fabric calls [`notify`](Self::notify) from its completion handler;
/// waiters sample the count, poll the completion queue, and sleep until
/// the count changes. [`interrupt`](Self::interrupt) makes current
/// waiters return `Error::Interrupted` without touching connection state,
/// which is how signal delivery is wired into blocking waits.
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

struct SignalState {
    count: u64,
    interrupted: bool,
}

impl CompletionSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                count: 0,
                interrupted: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Record one new event and wake all waiters.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Current event count, for use as the `seen` argument of a later
    /// [`wait_changed`](Self::wait_changed).
    pub fn count(&self) -> u64 {
        self.state.lock().unwrap().count
    }

    /// Interrupt all current waiters.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        state.interrupted = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Wait until the event count differs from `seen` or `timeout`
    /// elapses. Returns `Ok(true)` if the count changed, `Ok(false)` on
    /// timeout, `Err(Interrupted)` if interrupted.
    pub fn wait_changed(&self, seen: u64, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.interrupted {
                state.interrupted = false;
                return Err(Error::Interrupted);
            }
            if state.count != seen {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if result.timed_out() && state.count == seen && !state.interrupted {
                return Ok(false);
            }
        }
    }
}
