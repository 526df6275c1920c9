//! Load generation against a tokenization service.
//!
//! Two modes share the same request/response primitive ([`generator::attempt`]):
//! - sweep/count mode (`generator`): a fixed number of independent attempts,
//!   optionally in parallel, one channel per attempt;
//! - duration mode (`throughput`): a tight sequential loop on one channel for
//!   a fixed wall-clock window.

pub mod generator;
pub mod payload;
pub mod report;
pub mod stats;
pub mod throughput;

use crate::link::LinkError;
use crate::protocol::{self, MacAddr};
use thiserror::Error;

/// Who talks to whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub local_mac: MacAddr,
    pub remote_mac: MacAddr,
    pub protocol_id: u16,
    /// First client port; parallel attempts use consecutive ports from here.
    pub client_port: u16,
    pub service_port: u16,
}

impl Addressing {
    /// Whether `raw` is a reply from the service to `client_port`.
    pub fn is_reply(&self, raw: &[u8], client_port: u16) -> bool {
        if protocol::peek_protocol_id(raw) != Some(self.protocol_id) {
            return false;
        }
        match protocol::decode(raw) {
            Ok(frame) => {
                frame.protocol_id == self.protocol_id
                    && frame.src_port() == self.service_port
                    && frame.dst_port() == client_port
            }
            Err(_) => false,
        }
    }
}

/// Benchmark errors
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("attempt task failed: {0}")]
    Task(String),
}
