//! Configuration types for rcstream.

use crate::error::{Error, Result};

/// Default connect timeout per handshake stage, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u32 = 5_000;
/// Default completion wait timeout in milliseconds.
/// This also bounds send-completion drain waits.
pub const DEFAULT_COMPLETION_TIMEOUT_MS: u32 = 300_000;
/// Default timeout for waiting on a peer flow-control packet before a send.
pub const DEFAULT_FLOW_SEND_TIMEOUT_MS: u32 = 180_000;
/// Default timeout for posting a flow-control packet on the receive path.
pub const DEFAULT_FLOW_RECV_TIMEOUT_MS: u32 = 180_000;
/// Default poll slice: long waits are cut into slices of this length so a
/// silently dead peer is caught by a liveness check instead of a full-length
/// hang.
pub const DEFAULT_POLL_TIMEOUT_MS: u32 = 10_000;
/// Bound on draining outstanding sends during shutdown, in milliseconds.
pub const SHUTDOWN_TIMEOUT_MS: u32 = 250;
/// Default number of retries when the peer rejects our connection
/// identifier as stale.
pub const DEFAULT_STALE_RETRIES: u32 = 128;

/// Which kind of remote key is exchanged for the liveness-check RDMA read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    /// Fabric-wide unsafe global rkey.
    UnsafeGlobal,
    /// Unsafe DMA memory-region rkey covering all of system memory.
    UnsafeDma,
    /// A per-buffer registered memory region. Safest, default.
    #[default]
    Register,
}

/// Buffer geometry for one connection. Immutable once a connection is
/// established with it.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Number of send buffers and of receive buffers. Must be >= 1.
    pub buf_num: u32,
    /// Total capacity of each buffer in bytes. Must be > 0.
    pub buf_size: u32,
    /// Fragment size: each buffer is registered as multiple memory
    /// regions of at most this many bytes, so large buffers need not be
    /// physically contiguous. 0 means one fragment spanning the whole
    /// buffer.
    pub fragment_size: u32,
    /// Remote-key mode for the liveness check.
    pub key_type: KeyType,
}

impl CommConfig {
    /// Create a configuration with the given buffer geometry and the
    /// default key type.
    pub fn new(buf_num: u32, buf_size: u32) -> Self {
        Self {
            buf_num,
            buf_size,
            fragment_size: 0,
            key_type: KeyType::default(),
        }
    }

    /// Set the fragment size.
    pub fn with_fragment_size(mut self, fragment_size: u32) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    /// Set the remote-key mode.
    pub fn with_key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.buf_num == 0 {
            return Err(Error::InvalidConfig("buf_num cannot be 0".into()));
        }
        if self.buf_size == 0 {
            return Err(Error::InvalidConfig("buf_size cannot be 0".into()));
        }
        Ok(())
    }

    /// Fragment capacity actually used: `fragment_size`, or the whole
    /// buffer when `fragment_size` is 0.
    pub fn effective_fragment_size(&self) -> u32 {
        if self.fragment_size == 0 {
            self.buf_size
        } else {
            self.fragment_size
        }
    }

    /// Number of fragments each buffer is split into.
    pub fn fragments_per_buffer(&self) -> u32 {
        self.buf_size.div_ceil(self.effective_fragment_size())
    }
}

/// Timeouts for the various wait points of a stream. All in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect_ms: u32,
    pub completion_ms: u32,
    pub flow_send_ms: u32,
    pub flow_recv_ms: u32,
    pub poll_ms: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            completion_ms: DEFAULT_COMPLETION_TIMEOUT_MS,
            flow_send_ms: DEFAULT_FLOW_SEND_TIMEOUT_MS,
            flow_recv_ms: DEFAULT_FLOW_RECV_TIMEOUT_MS,
            poll_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    /// Replace the configured timeouts. A value of 0 resets that timeout
    /// to its default.
    pub fn set(
        &mut self,
        connect_ms: u32,
        completion_ms: u32,
        flow_send_ms: u32,
        flow_recv_ms: u32,
        poll_ms: u32,
    ) {
        let or_default = |v: u32, d: u32| if v > 0 { v } else { d };
        self.connect_ms = or_default(connect_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        self.completion_ms = or_default(completion_ms, DEFAULT_COMPLETION_TIMEOUT_MS);
        self.flow_send_ms = or_default(flow_send_ms, DEFAULT_FLOW_SEND_TIMEOUT_MS);
        self.flow_recv_ms = or_default(flow_recv_ms, DEFAULT_FLOW_RECV_TIMEOUT_MS);
        self.poll_ms = or_default(poll_ms, DEFAULT_POLL_TIMEOUT_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_buf_num() {
        assert!(CommConfig::new(0, 4096).validate().is_err());
        assert!(CommConfig::new(4, 0).validate().is_err());
        assert!(CommConfig::new(1, 1).validate().is_ok());
    }

    #[test]
    fn test_fragment_geometry() {
        let cfg = CommConfig::new(4, 4096);
        assert_eq!(cfg.effective_fragment_size(), 4096);
        assert_eq!(cfg.fragments_per_buffer(), 1);

        let cfg = CommConfig::new(4, 4096).with_fragment_size(1000);
        assert_eq!(cfg.effective_fragment_size(), 1000);
        assert_eq!(cfg.fragments_per_buffer(), 5);

        let cfg = CommConfig::new(4, 4096).with_fragment_size(2048);
        assert_eq!(cfg.fragments_per_buffer(), 2);
    }

    #[test]
    fn test_timeout_zero_resets_to_default() {
        let mut t = TimeoutConfig::default();
        t.set(100, 200, 300, 400, 500);
        assert_eq!(t.connect_ms, 100);
        assert_eq!(t.poll_ms, 500);

        t.set(0, 0, 0, 0, 0);
        assert_eq!(t.connect_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(t.completion_ms, DEFAULT_COMPLETION_TIMEOUT_MS);
        assert_eq!(t.flow_send_ms, DEFAULT_FLOW_SEND_TIMEOUT_MS);
        assert_eq!(t.flow_recv_ms, DEFAULT_FLOW_RECV_TIMEOUT_MS);
        assert_eq!(t.poll_ms, DEFAULT_POLL_TIMEOUT_MS);
    }
}
