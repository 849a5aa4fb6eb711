//! Connection establishment: handshake blob, state machine, event sink.
//!
//! The multi-stage handshake is driven by connection-manager events that
//! arrive on a fabric-owned thread. [`StateEventSink`] translates each
//! event into a [`ConnState`] transition on a [`SharedState`], and the
//! connecting thread advances stage by stage with condvar waits.
//!
//! The handshake private data is a fixed little-endian blob
//! ([`PeerDest`]) carrying a verification tag, a protocol version, the
//! liveness-check read target and the peer's receive-buffer geometry.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::fabric::{CmEvent, CmVerdict, EventSink};

/// Tag at the start of the handshake blob. A mismatch means the peer is
/// not speaking this protocol at all.
pub const VERIFICATION_TAG: [u8; 8] = *b"rcstream";
/// Protocol version carried in the handshake blob.
pub const PROTOCOL_VERSION: u64 = 1;
/// Exact encoded length of a [`PeerDest`].
pub const PEER_DEST_LEN: usize = 36;

/// The handshake payload each side sends as connection private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDest {
    /// Address of the peer's liveness-check target buffer.
    pub liveness_addr: u64,
    /// Remote key authorizing reads of that buffer.
    pub liveness_rkey: u32,
    /// Number of receive buffers the peer posted.
    pub recv_buf_num: u32,
    /// Capacity of each of those buffers.
    pub recv_buf_size: u32,
}

impl PeerDest {
    /// Encode as handshake private data.
    pub fn encode(&self) -> [u8; PEER_DEST_LEN] {
        let mut out = [0u8; PEER_DEST_LEN];
        out[0..8].copy_from_slice(&VERIFICATION_TAG);
        out[8..16].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        out[16..24].copy_from_slice(&self.liveness_addr.to_le_bytes());
        out[24..28].copy_from_slice(&self.liveness_rkey.to_le_bytes());
        out[28..32].copy_from_slice(&self.recv_buf_num.to_le_bytes());
        out[32..36].copy_from_slice(&self.recv_buf_size.to_le_bytes());
        out
    }

    /// Parse received private data. Transports may pad the private data,
    /// so longer input is accepted and the excess ignored; shorter input,
    /// a foreign tag or a version mismatch are protocol violations.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PEER_DEST_LEN {
            return Err(Error::Protocol(format!(
                "handshake data too short: {} bytes",
                data.len()
            )));
        }
        if data[0..8] != VERIFICATION_TAG {
            return Err(Error::Protocol("bad handshake verification tag".into()));
        }
        let version = u64::from_le_bytes(data[8..16].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "protocol version mismatch: peer {version}, local {PROTOCOL_VERSION}"
            )));
        }
        Ok(Self {
            liveness_addr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            liveness_rkey: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            recv_buf_num: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            recv_buf_size: u32::from_le_bytes(data[32..36].try_into().unwrap()),
        })
    }
}

/// Stages of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    /// Address resolution in progress.
    Connecting,
    AddrResolved,
    RouteResolved,
    Established,
    /// A stage failed; the attempt is over.
    Failed,
    /// The peer rejected us as a stale connection identifier. The caller
    /// may retry with a fresh identifier.
    RejectedStale,
}

struct SharedInner {
    conn: ConnState,
    /// Sticky: once set, every operation on the stream fails fast.
    failed: bool,
    /// Peer handshake data captured by the `Established` event.
    established_data: Option<Vec<u8>>,
}

/// Connection state shared between the connecting thread and the
/// fabric's event-delivery thread.
pub struct SharedState {
    inner: Mutex<SharedInner>,
    cond: Condvar,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SharedInner {
                conn: ConnState::Unconnected,
                failed: false,
                established_data: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn get(&self) -> ConnState {
        self.inner.lock().unwrap().conn
    }

    pub fn set(&self, state: ConnState) {
        let mut inner = self.inner.lock().unwrap();
        inner.conn = state;
        drop(inner);
        self.cond.notify_all();
    }

    /// Mark the connection dead. Sticky.
    pub fn fail(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    fn set_established(&self, private_data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.established_data = Some(private_data);
        inner.conn = ConnState::Established;
        drop(inner);
        self.cond.notify_all();
    }

    /// Take the peer handshake data captured at establishment.
    pub fn take_established_data(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().established_data.take()
    }

    /// Block until the state is no longer `from`. Used for stages with
    /// no sensible local timeout (the fabric applies its own).
    pub fn wait_leave(&self, from: ConnState) -> ConnState {
        let mut inner = self.inner.lock().unwrap();
        while inner.conn == from {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.conn
    }

    /// Block until the state is no longer `from`, or until `timeout_ms`
    /// elapses. Returns the state reached, or `Err(Timeout)`.
    pub fn wait_leave_timeout(&self, from: ConnState, timeout_ms: u32) -> Result<ConnState> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut inner = self.inner.lock().unwrap();
        while inner.conn == from {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (next, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = next;
        }
        Ok(inner.conn)
    }
}

/// Event sink driving the [`SharedState`] from connection-manager
/// events.
pub struct StateEventSink {
    state: Arc<SharedState>,
}

impl StateEventSink {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }
}

impl EventSink for StateEventSink {
    fn on_cm_event(&self, event: CmEvent) -> CmVerdict {
        match event {
            CmEvent::AddrResolved => self.state.set(ConnState::AddrResolved),
            CmEvent::RouteResolved => self.state.set(ConnState::RouteResolved),
            CmEvent::AddrError | CmEvent::RouteError | CmEvent::ConnectError => {
                self.state.set(ConnState::Failed);
            }
            // Connections are initiated, never accepted, on this
            // identifier.
            CmEvent::ConnectRequest => return CmVerdict::Reject,
            CmEvent::Established { private_data } => {
                self.state.set_established(private_data);
            }
            CmEvent::Rejected { stale } => {
                if stale {
                    self.state.set(ConnState::RejectedStale);
                } else {
                    self.state.set(ConnState::Failed);
                }
            }
            CmEvent::Disconnected => {
                // The peer went away; poison the stream so the owner
                // notices on the next operation.
                self.state.fail();
            }
            CmEvent::DeviceRemoval => {
                warn!("ignoring device removal event");
            }
        }
        CmVerdict::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_dest_roundtrip() {
        let dest = PeerDest {
            liveness_addr: 0xdead_beef_0123_4567,
            liveness_rkey: 0x0bad_cafe,
            recv_buf_num: 4,
            recv_buf_size: 4096,
        };
        let encoded = dest.encode();
        assert_eq!(encoded.len(), PEER_DEST_LEN);
        assert_eq!(PeerDest::parse(&encoded).unwrap(), dest);
    }

    #[test]
    fn test_dest_field_offsets_are_little_endian() {
        let dest = PeerDest {
            liveness_addr: 0x1122_3344_5566_7788,
            liveness_rkey: 0xaabb_ccdd,
            recv_buf_num: 2,
            recv_buf_size: 8192,
        };
        let encoded = dest.encode();
        assert_eq!(&encoded[0..8], b"rcstream");
        assert_eq!(encoded[8], 1);
        assert_eq!(encoded[16], 0x88);
        assert_eq!(encoded[23], 0x11);
        assert_eq!(encoded[24], 0xdd);
        assert_eq!(encoded[28], 2);
        assert_eq!(u32::from_le_bytes(encoded[32..36].try_into().unwrap()), 8192);
    }

    #[test]
    fn test_dest_parse_tolerates_padding() {
        let dest = PeerDest {
            liveness_addr: 1,
            liveness_rkey: 2,
            recv_buf_num: 3,
            recv_buf_size: 4,
        };
        let mut padded = dest.encode().to_vec();
        padded.extend_from_slice(&[0u8; 20]);
        assert_eq!(PeerDest::parse(&padded).unwrap(), dest);
    }

    #[test]
    fn test_dest_parse_rejects_short_and_corrupt() {
        let dest = PeerDest {
            liveness_addr: 1,
            liveness_rkey: 2,
            recv_buf_num: 3,
            recv_buf_size: 4,
        };
        let encoded = dest.encode();

        assert!(matches!(
            PeerDest::parse(&encoded[..PEER_DEST_LEN - 1]),
            Err(Error::Protocol(_))
        ));

        // A single flipped tag byte must be rejected.
        let mut bad_tag = encoded;
        bad_tag[3] ^= 0x01;
        assert!(matches!(PeerDest::parse(&bad_tag), Err(Error::Protocol(_))));

        let mut bad_version = encoded;
        bad_version[8] = 2;
        assert!(matches!(
            PeerDest::parse(&bad_version),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_sink_advances_state_machine() {
        let state = SharedState::new();
        let sink = StateEventSink::new(state.clone());

        state.set(ConnState::Connecting);
        sink.on_cm_event(CmEvent::AddrResolved);
        assert_eq!(state.get(), ConnState::AddrResolved);

        sink.on_cm_event(CmEvent::RouteResolved);
        assert_eq!(state.get(), ConnState::RouteResolved);

        sink.on_cm_event(CmEvent::Established {
            private_data: vec![1, 2, 3],
        });
        assert_eq!(state.get(), ConnState::Established);
        assert_eq!(state.take_established_data(), Some(vec![1, 2, 3]));
        assert_eq!(state.take_established_data(), None);
    }

    #[test]
    fn test_sink_rejects_inbound_requests() {
        let state = SharedState::new();
        let sink = StateEventSink::new(state.clone());
        assert_eq!(sink.on_cm_event(CmEvent::ConnectRequest), CmVerdict::Reject);
        // State is untouched by the rejection.
        assert_eq!(state.get(), ConnState::Unconnected);
    }

    #[test]
    fn test_sink_stale_rejection_and_errors() {
        let state = SharedState::new();
        let sink = StateEventSink::new(state.clone());

        sink.on_cm_event(CmEvent::Rejected { stale: true });
        assert_eq!(state.get(), ConnState::RejectedStale);

        sink.on_cm_event(CmEvent::Rejected { stale: false });
        assert_eq!(state.get(), ConnState::Failed);

        sink.on_cm_event(CmEvent::AddrError);
        assert_eq!(state.get(), ConnState::Failed);
        assert!(!state.is_failed());

        sink.on_cm_event(CmEvent::Disconnected);
        assert!(state.is_failed());
    }

    #[test]
    fn test_wait_leave_timeout() {
        let state = SharedState::new();
        state.set(ConnState::Connecting);
        assert!(matches!(
            state.wait_leave_timeout(ConnState::Connecting, 10),
            Err(Error::Timeout)
        ));

        let waiter = state.clone();
        let handle = thread::spawn(move || waiter.wait_leave_timeout(ConnState::Connecting, 2_000));
        thread::sleep(Duration::from_millis(20));
        state.set(ConnState::AddrResolved);
        assert_eq!(handle.join().unwrap().unwrap(), ConnState::AddrResolved);
    }
}
