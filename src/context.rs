//! Per-connection communication context.
//!
//! Owns everything a live connection needs on the data path: the queue
//! pair, both buffer pools, the liveness-check buffer, the credit
//! counters and the in-flight bookkeeping. Built between route
//! resolution and the establishment request, torn down wholesale when
//! the stream drops.

use std::sync::Arc;

use crate::buffer::{BufIndex, BufferPool, FragmentedBuffer};
use crate::config::{CommConfig, KeyType};
use crate::error::{Error, Result};
use crate::fabric::{
    AccessFlags, CompletionSignal, ConnectionId, Direction, QueuePair, QueuePairAttr,
    RemoteBuffer, Sge,
};
use crate::flow::{FlowCounters, PendingRecv, SendWindow};
use crate::handshake::PeerDest;

/// wr_id reserved for the liveness-check RDMA read. Buffer-slot wr_ids
/// are pool indices, so they can never collide with this.
pub const CHECK_CONN_WR_ID: u64 = u64::MAX;

/// Size of the liveness-check buffer. The peer reads it to prove the
/// path is alive; the content is never interpreted.
const CHECK_CONN_BUF_LEN: u32 = 8;

pub struct CommContext {
    pub qp: Box<dyn QueuePair>,
    /// One signal for both completion queues, so a blocked caller has a
    /// single thing to sleep on. Spurious wakeups from the other queue
    /// are absorbed by the poll loops.
    pub signal: Arc<CompletionSignal>,
    pub send_bufs: BufferPool,
    pub recv_bufs: BufferPool,
    /// Liveness target and landing zone for one-sided reads.
    check_buf: FragmentedBuffer,
    /// rkey advertised for the liveness target, per the configured key
    /// type.
    liveness_rkey: u32,
    pub flow: FlowCounters,
    pub window: SendWindow,
    /// Received message not yet fully consumed.
    pub pending_recv: Option<PendingRecv>,
    /// Peer geometry and liveness target, known after establishment.
    pub peer: Option<PeerDest>,
    /// A liveness-check read is posted and not yet retired.
    pub check_read_outstanding: bool,
    pub cfg: CommConfig,
}

impl CommContext {
    /// Allocate pools and the queue pair for one connection attempt.
    pub fn new(conn: &dyn ConnectionId, cfg: &CommConfig) -> Result<Self> {
        cfg.validate()?;

        let signal = CompletionSignal::new();

        let send_bufs = BufferPool::create(
            conn,
            cfg.buf_num,
            cfg.buf_size,
            cfg.fragment_size,
            Direction::ToDevice,
            AccessFlags::empty(),
        )?;
        let recv_bufs = BufferPool::create(
            conn,
            cfg.buf_num,
            cfg.buf_size,
            cfg.fragment_size,
            Direction::FromDevice,
            AccessFlags::LOCAL_WRITE,
        )?;
        let check_buf = FragmentedBuffer::new(
            conn,
            CHECK_CONN_BUF_LEN,
            0,
            Direction::FromDevice,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        )?;

        let liveness_rkey = match cfg.key_type {
            KeyType::Register => check_buf.rkey(),
            other => conn.unsafe_rkey(other)?,
        };

        let max_sge = (cfg.fragments_per_buffer()).max(1);
        let qp = conn.create_queue_pair(QueuePairAttr {
            // One extra send slot for the liveness-check read.
            max_send_wr: (cfg.buf_num + 1).max(1),
            max_recv_wr: cfg.buf_num.max(1),
            max_send_sge: max_sge,
            max_recv_sge: max_sge,
            send_cq_depth: cfg.buf_num + 1,
            recv_cq_depth: cfg.buf_num,
            send_signal: signal.clone(),
            recv_signal: signal.clone(),
        })?;

        Ok(Self {
            qp,
            signal,
            send_bufs,
            recv_bufs,
            check_buf,
            liveness_rkey,
            flow: FlowCounters::new(cfg.buf_num),
            window: SendWindow::default(),
            pending_recv: None,
            peer: None,
            check_read_outstanding: false,
            cfg: cfg.clone(),
        })
    }

    /// Our half of the handshake blob.
    pub fn local_dest(&self) -> PeerDest {
        PeerDest {
            liveness_addr: self.check_buf.addr(),
            liveness_rkey: self.liveness_rkey,
            recv_buf_num: self.cfg.buf_num,
            recv_buf_size: self.cfg.buf_size,
        }
    }

    /// Post one receive buffer slot.
    pub fn post_recv_slot(&mut self, index: BufIndex) -> Result<()> {
        let sges = self.recv_bufs.get(index).recv_sges();
        self.qp.post_recv(index.wr_id(), &sges)
    }

    /// Post the whole receive pool, done once right after establishment.
    pub fn post_all_recvs(&mut self) -> Result<()> {
        for raw in 0..self.cfg.buf_num {
            self.post_recv_slot(BufIndex::wrapping(raw, self.cfg.buf_num))?;
        }
        Ok(())
    }

    /// Post the filled send buffer at `index`, with full credit and
    /// window accounting. The window is charged before posting and
    /// rolled back if the post fails, so accounting never runs ahead of
    /// the queue pair.
    pub fn post_send_slot(&mut self, index: BufIndex) -> Result<()> {
        debug_assert!(!self.flow.send_exhausted());
        let sges = self.send_bufs.get(index).send_sges();
        self.window.on_posted(self.cfg.buf_num);
        if let Err(e) = self.qp.post_send(index.wr_id(), &sges) {
            self.window.on_post_failed(self.cfg.buf_num);
            return Err(e);
        }
        self.flow.on_send_posted();
        Ok(())
    }

    /// Post the one-sided liveness read of the peer's check buffer into
    /// our own.
    pub fn post_liveness_read(&mut self) -> Result<()> {
        let peer = self
            .peer
            .ok_or_else(|| Error::Comm("liveness check before establishment".into()))?;
        let sge = Sge {
            addr: self.check_buf.addr(),
            length: CHECK_CONN_BUF_LEN,
            lkey: self.check_buf_lkey(),
        };
        self.qp.post_read(
            CHECK_CONN_WR_ID,
            sge,
            RemoteBuffer {
                addr: peer.liveness_addr,
                rkey: peer.liveness_rkey,
            },
        )?;
        self.check_read_outstanding = true;
        Ok(())
    }

    fn check_buf_lkey(&self) -> u32 {
        // Single-fragment buffer; the first sge carries its lkey.
        self.check_buf.recv_sges()[0].lkey
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{CmVerdict, EventSink, Fabric};
    use crate::testing::{MemFabric, PeerConfig};

    struct NullSink;
    impl EventSink for NullSink {
        fn on_cm_event(&self, _event: crate::fabric::CmEvent) -> CmVerdict {
            CmVerdict::Handled
        }
    }

    #[test]
    fn test_context_advertises_own_geometry() {
        let fabric = MemFabric::new(PeerConfig::default());
        let conn = fabric.create_id(Arc::new(NullSink)).unwrap();
        let cfg = CommConfig::new(4, 4096);
        let ctx = CommContext::new(conn.as_ref(), &cfg).unwrap();

        let dest = ctx.local_dest();
        assert_eq!(dest.recv_buf_num, 4);
        assert_eq!(dest.recv_buf_size, 4096);
        assert_ne!(dest.liveness_addr, 0);
    }

    #[test]
    fn test_context_rejects_invalid_geometry() {
        let fabric = MemFabric::new(PeerConfig::default());
        let conn = fabric.create_id(Arc::new(NullSink)).unwrap();
        let cfg = CommConfig::new(0, 4096);
        assert!(matches!(
            CommContext::new(conn.as_ref(), &cfg),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_initial_credits_match_pool_size() {
        let fabric = MemFabric::new(PeerConfig::default());
        let conn = fabric.create_id(Arc::new(NullSink)).unwrap();
        let cfg = CommConfig::new(4, 1024);
        let ctx = CommContext::new(conn.as_ref(), &cfg).unwrap();
        assert_eq!(ctx.flow.send_credits(), 3);
        assert_eq!(ctx.flow.recv_credits(), 3);
        assert_eq!(ctx.window.outstanding(), 0);
    }
}
