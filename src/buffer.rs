//! Buffer and fragment management.
//!
//! A [`FragmentedBuffer`] is one send or receive buffer of `total_size`
//! bytes, registered for DMA as a sequence of fragments of at most
//! `fragment_size` bytes each, so large buffers need not be physically
//! contiguous. A [`BufferPool`] owns a fixed number of such buffers for
//! one direction of one connection.

use std::io::Read;

use crate::error::{Error, Result};
use crate::fabric::{AccessFlags, ConnectionId, Direction, RegisteredMemory, Sge};

/// Buffer-slot index, guaranteed to be below the owning pool's size.
///
/// Work-request identifiers on the wire are raw `u64`s; converting them
/// back through [`from_wr_id`](Self::from_wr_id) is the only way to get a
/// `BufIndex`, so an out-of-range completion can never reach pool
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufIndex(u32);

impl BufIndex {
    /// Validate a completion's wr_id against the pool size.
    pub fn from_wr_id(wr_id: u64, pool_size: u32) -> Option<BufIndex> {
        if wr_id < pool_size as u64 {
            Some(BufIndex(wr_id as u32))
        } else {
            None
        }
    }

    /// Next slot after `raw` sends, wrapping modulo `pool_size`.
    pub fn wrapping(raw: u32, pool_size: u32) -> BufIndex {
        BufIndex(raw % pool_size)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    pub fn wr_id(self) -> u64 {
        self.0 as u64
    }
}

/// One DMA-registered buffer split into fragments.
pub struct FragmentedBuffer {
    /// Fragments in registration order; released in reverse order.
    frags: Vec<Box<dyn RegisteredMemory>>,
    /// Per-fragment filled length for the next send post.
    lens: Vec<u32>,
    /// Capacity of every fragment except possibly the last.
    frag_size: u32,
    /// Total capacity across all fragments.
    total_size: u32,
    /// Currently filled length (send side).
    len: u32,
}

impl FragmentedBuffer {
    /// Allocate and register a buffer of `total_size` bytes in fragments
    /// of `fragment_size` bytes (0 means one fragment for the whole
    /// buffer). Fails atomically: dropping the partially built fragment
    /// list unregisters everything already registered in this call, in
    /// reverse order.
    pub fn new(
        conn: &dyn ConnectionId,
        total_size: u32,
        fragment_size: u32,
        dir: Direction,
        access: AccessFlags,
    ) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::InvalidConfig("buffer size cannot be 0".into()));
        }
        let frag_size = if fragment_size == 0 {
            total_size
        } else {
            fragment_size
        };

        let count = total_size.div_ceil(frag_size);
        let mut frags: Vec<Box<dyn RegisteredMemory>> = Vec::with_capacity(count as usize);
        let mut remaining = total_size;
        while remaining > 0 {
            let this = remaining.min(frag_size);
            let region = conn.register(this as usize, dir, access)?;
            frags.push(region);
            remaining -= this;
        }

        let lens = vec![0u32; frags.len()];
        Ok(Self {
            frags,
            lens,
            frag_size,
            total_size,
            len: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.total_size
    }

    pub fn fragment_size(&self) -> u32 {
        self.frag_size
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Currently filled length.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first fragment; the remote target handle exchanged
    /// for liveness checks.
    pub fn addr(&self) -> u64 {
        self.frags[0].addr()
    }

    /// Remote key of the first fragment.
    pub fn rkey(&self) -> u32 {
        self.frags[0].rkey()
    }

    /// Fill the buffer from `src`, starting at offset 0, up to the total
    /// capacity or until the source runs dry. Records per-fragment
    /// lengths for the following post. Returns the number of bytes
    /// copied in.
    ///
    /// A read error from the source is a copy fault: the caller promised
    /// bytes it cannot supply, which is non-recoverable for the
    /// connection.
    pub fn fill(&mut self, src: &mut dyn Read) -> Result<usize> {
        let mut tmp = vec![0u8; self.frag_size as usize];
        let mut filled = 0usize;

        for (i, frag) in self.frags.iter().enumerate() {
            let cap = frag.len();
            let mut off = 0usize;
            while off < cap {
                let n = src
                    .read(&mut tmp[..cap - off])
                    .map_err(|e| Error::Comm(format!("copy fault while filling send buffer: {e}")))?;
                if n == 0 {
                    break;
                }
                frag.write_at(off, &tmp[..n]);
                off += n;
            }
            self.lens[i] = off as u32;
            filled += off;
            if off < cap {
                // Source exhausted; zero the lengths of the remaining fragments.
                for len in &mut self.lens[i + 1..] {
                    *len = 0;
                }
                break;
            }
        }

        self.len = filled as u32;
        Ok(filled)
    }

    /// Mark the buffer as carrying a minimal flow-control packet: one
    /// byte in the first fragment, no payload semantics.
    pub fn prepare_control(&mut self) {
        self.lens[0] = crate::flow::FLOW_CONTROL_MSG_LEN as u32;
        for len in &mut self.lens[1..] {
            *len = 0;
        }
        self.len = crate::flow::FLOW_CONTROL_MSG_LEN as u32;
    }

    /// Copy received bytes out, resuming at `offset` of a message of
    /// `total_len` bytes. Returns the number of bytes copied (bounded by
    /// `dst` and by the unconsumed remainder).
    pub fn copy_out(&self, offset: usize, dst: &mut [u8], total_len: usize) -> usize {
        let frag_size = self.frag_size as usize;
        let mut copied = 0usize;
        while copied < dst.len() && offset + copied < total_len {
            let pos = offset + copied;
            let page = pos / frag_size;
            let page_off = pos % frag_size;
            let n = (dst.len() - copied)
                .min(frag_size - page_off)
                .min(total_len - pos);
            self.frags[page].read_at(page_off, &mut dst[copied..copied + n]);
            copied += n;
        }
        copied
    }

    /// Scatter/gather list for posting this buffer as a send: the filled
    /// prefix of fragments with their filled lengths.
    pub fn send_sges(&self) -> Vec<Sge> {
        self.frags
            .iter()
            .zip(self.lens.iter())
            .filter(|(_, len)| **len > 0)
            .map(|(frag, len)| Sge {
                addr: frag.addr(),
                length: *len,
                lkey: frag.lkey(),
            })
            .collect()
    }

    /// Scatter/gather list for posting this buffer as a receive: every
    /// fragment at full capacity.
    pub fn recv_sges(&self) -> Vec<Sge> {
        self.frags
            .iter()
            .map(|frag| Sge {
                addr: frag.addr(),
                length: frag.len() as u32,
                lkey: frag.lkey(),
            })
            .collect()
    }
}

impl Drop for FragmentedBuffer {
    fn drop(&mut self) {
        // Unregister in strict reverse order of registration.
        while let Some(frag) = self.frags.pop() {
            drop(frag);
        }
    }
}

/// A fixed set of buffers for one direction of one connection.
pub struct BufferPool {
    bufs: Vec<FragmentedBuffer>,
}

impl BufferPool {
    /// Create `count` buffers of `buf_size` bytes each, fragmented by
    /// `fragment_size`, registered for `dir`.
    pub fn create(
        conn: &dyn ConnectionId,
        count: u32,
        buf_size: u32,
        fragment_size: u32,
        dir: Direction,
        access: AccessFlags,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidConfig("buffer count cannot be 0".into()));
        }
        let mut bufs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            bufs.push(FragmentedBuffer::new(
                conn,
                buf_size,
                fragment_size,
                dir,
                access,
            )?);
        }
        Ok(Self { bufs })
    }

    pub fn count(&self) -> u32 {
        self.bufs.len() as u32
    }

    pub fn get(&self, index: BufIndex) -> &FragmentedBuffer {
        &self.bufs[index.get()]
    }

    pub fn get_mut(&mut self, index: BufIndex) -> &mut FragmentedBuffer {
        &mut self.bufs[index.get()]
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Buffers release in reverse order of creation.
        while let Some(buf) = self.bufs.pop() {
            drop(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{CmVerdict, EventSink, Fabric};
    use crate::testing::{MemFabric, PeerConfig};
    use std::sync::Arc;

    struct NullSink;
    impl EventSink for NullSink {
        fn on_cm_event(&self, _event: crate::fabric::CmEvent) -> CmVerdict {
            CmVerdict::Handled
        }
    }

    fn test_conn() -> (MemFabric, Box<dyn ConnectionId>) {
        let fabric = MemFabric::new(PeerConfig::default());
        let conn = fabric.create_id(Arc::new(NullSink)).unwrap();
        (fabric, conn)
    }

    #[test]
    fn test_unfragmented_buffer_is_one_fragment() {
        let (_fabric, conn) = test_conn();
        let buf = FragmentedBuffer::new(
            conn.as_ref(),
            4096,
            0,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        assert_eq!(buf.fragment_count(), 1);
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.fragment_size(), 4096);
    }

    #[test]
    fn test_fragment_count_is_ceiling() {
        let (_fabric, conn) = test_conn();
        let buf = FragmentedBuffer::new(
            conn.as_ref(),
            4096,
            1000,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        assert_eq!(buf.fragment_count(), 5);
        // Each fragment capacity is bounded by min(fragment_size, total).
        let sges = buf.recv_sges();
        assert!(sges.iter().all(|sge| sge.length <= 1000));
        assert_eq!(sges.iter().map(|sge| sge.length).sum::<u32>(), 4096);
    }

    #[test]
    fn test_pool_buffer_count() {
        let (_fabric, conn) = test_conn();
        let pool = BufferPool::create(
            conn.as_ref(),
            4,
            4096,
            0,
            Direction::FromDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        assert_eq!(pool.count(), 4);
        assert!(pool
            .bufs
            .iter()
            .all(|buf| buf.fragment_count() == 1));
    }

    #[test]
    fn test_zero_count_pool_is_invalid() {
        let (_fabric, conn) = test_conn();
        let res = BufferPool::create(
            conn.as_ref(),
            0,
            4096,
            0,
            Direction::FromDevice,
            AccessFlags::LOCAL_WRITE,
        );
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_fill_and_copy_out_across_fragments() {
        let (fabric, conn) = test_conn();
        let mut buf = FragmentedBuffer::new(
            conn.as_ref(),
            1000,
            256,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();

        let payload: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        let mut src: &[u8] = &payload;
        let filled = buf.fill(&mut src).unwrap();
        assert_eq!(filled, 700);
        assert_eq!(buf.len(), 700);

        // 700 bytes span fragments 0..=2 of 256 bytes each.
        let sges = buf.send_sges();
        assert_eq!(sges.len(), 3);
        assert_eq!(sges[0].length, 256);
        assert_eq!(sges[1].length, 256);
        assert_eq!(sges[2].length, 188);

        let mut out = vec![0u8; 700];
        let n = buf.copy_out(0, &mut out, 700);
        assert_eq!(n, 700);
        assert_eq!(out, payload);
        drop(fabric);
    }

    #[test]
    fn test_copy_out_resumes_at_offset() {
        let (_fabric, conn) = test_conn();
        let mut buf = FragmentedBuffer::new(
            conn.as_ref(),
            512,
            128,
            Direction::FromDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut src: &[u8] = &payload;
        buf.fill(&mut src).unwrap();

        let mut first = vec![0u8; 100];
        let mut second = vec![0u8; 300];
        assert_eq!(buf.copy_out(0, &mut first, 300), 100);
        assert_eq!(buf.copy_out(100, &mut second, 300), 200);
        assert_eq!(&first[..], &payload[..100]);
        assert_eq!(&second[..200], &payload[100..]);
    }

    #[test]
    fn test_fill_copy_fault_is_fatal() {
        struct FaultyReader;
        impl Read for FaultyReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("page gone"))
            }
        }

        let (_fabric, conn) = test_conn();
        let mut buf = FragmentedBuffer::new(
            conn.as_ref(),
            256,
            0,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        let res = buf.fill(&mut FaultyReader);
        assert!(matches!(res, Err(Error::Comm(_))));
    }

    #[test]
    fn test_prepare_control_single_byte_sge() {
        let (_fabric, conn) = test_conn();
        let mut buf = FragmentedBuffer::new(
            conn.as_ref(),
            4096,
            1024,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        buf.prepare_control();
        let sges = buf.send_sges();
        assert_eq!(sges.len(), 1);
        assert_eq!(sges[0].length, 1);
    }

    #[test]
    fn test_release_unregisters_in_reverse_order() {
        let (fabric, conn) = test_conn();
        let pool = BufferPool::create(
            conn.as_ref(),
            2,
            512,
            256,
            Direction::ToDevice,
            AccessFlags::LOCAL_WRITE,
        )
        .unwrap();
        let registered = fabric.registration_log();
        assert_eq!(registered.len(), 4);
        drop(pool);

        let unregistered = fabric.unregistration_log();
        let mut expected = registered;
        expected.reverse();
        assert_eq!(unregistered, expected);
    }

    #[test]
    fn test_buf_index_bounds() {
        assert!(BufIndex::from_wr_id(3, 4).is_some());
        assert!(BufIndex::from_wr_id(4, 4).is_none());
        assert_eq!(BufIndex::wrapping(5, 4).get(), 1);
    }
}
