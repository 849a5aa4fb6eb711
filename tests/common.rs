//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddrV4;
use std::sync::Once;

use rcstream::testing::{MemFabric, PeerConfig};
use rcstream::{CommConfig, RcStream};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_addr() -> SocketAddrV4 {
    "10.0.0.2:8003".parse().unwrap()
}

/// Standard geometry: four buffers of 4 KiB.
pub fn small_cfg() -> CommConfig {
    CommConfig::new(4, 4096)
}

pub fn connect(cfg: &CommConfig, peer: PeerConfig) -> (MemFabric, RcStream) {
    init_tracing();
    let fabric = MemFabric::new(peer);
    let stream = RcStream::connect(&fabric, cfg, test_addr()).expect("connect");
    (fabric, stream)
}

pub fn connect_default(cfg: &CommConfig) -> (MemFabric, RcStream) {
    connect(cfg, PeerConfig::default())
}
