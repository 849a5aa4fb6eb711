//! Reliable connected byte streams over an RDMA fabric.
//!
//! rcstream turns one reliable-connected queue pair into an ordered,
//! message-fragmenting byte stream with credit-based flow control, so
//! neither side ever posts into a window the receiver has not granted.
//! Each side owns a fixed pool of send and receive buffers; credits are
//! regranted implicitly by traffic in the opposite direction and
//! explicitly by one-byte flow-control packets when a receiver runs its
//! grant counter down to zero.
//!
//! Connections are initiated with a multi-stage handshake (address
//! resolution, route resolution, establishment with a verification blob
//! as private data) and retried transparently when the peer still holds
//! stale state from a dead prior session. A silently dead peer is
//! detected by a one-sided read of its liveness buffer, which succeeds
//! or fails without any involvement of the peer's software.
//!
//! The fabric itself sits behind the traits in [`fabric`]; the
//! [`testing`] module provides a deterministic in-memory implementation.
//!
//! ```no_run
//! use std::net::SocketAddrV4;
//! use rcstream::{CommConfig, MsgFlags, RcStream, testing::{MemFabric, PeerConfig}};
//!
//! # fn main() -> rcstream::Result<()> {
//! let fabric = MemFabric::new(PeerConfig::default());
//! let cfg = CommConfig::new(4, 4096);
//! let dst: SocketAddrV4 = "10.0.0.2:8003".parse().unwrap();
//!
//! let mut stream = RcStream::connect(&fabric, &cfg, dst)?;
//! stream.send(b"hello", MsgFlags::empty())?;
//! stream.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod fabric;
pub mod flow;
pub mod handshake;
pub mod stream;
pub mod testing;

pub use config::{CommConfig, KeyType, TimeoutConfig};
pub use error::{Error, Result};
pub use fabric::{CmEvent, CmVerdict, CompletionSignal, EventSink, Fabric};
pub use handshake::{ConnState, PeerDest};
pub use stream::{ConnectOptions, MsgFlags, PollEvents, RcListener, RcStream};
