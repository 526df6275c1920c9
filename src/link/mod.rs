//! Link channels: one endpoint per interface and protocol id.
//!
//! A channel sees every frame of its protocol id on the interface, including
//! replies meant for other channels. Callers re-check protocol id and ports on
//! every received frame; [`recv_matching`] does that against a deadline.
//!
//! The protocol carries no request id, so a channel must never have more than
//! one request outstanding. Concurrency means one channel per in-flight
//! request, each with its own client port.

pub mod raw;
#[cfg(test)]
pub mod wire;

pub use raw::{RawChannel, RawConnector};

use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Link channel errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// Interface missing or no privilege for a raw endpoint. Fatal at startup.
    #[error("cannot open raw endpoint on '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("no matching frame within {0:?}")]
    Timeout(Duration),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("channel is closed")]
    Closed,
}

/// Shortest wait a socket read timeout can express. A shorter nonzero
/// timeout rounds down to zero, which the kernel reads as "wait forever".
pub const MIN_WAIT: Duration = Duration::from_micros(1);

/// Time left before `deadline`, or `None` once less than [`MIN_WAIT`] remains.
pub fn remaining_until(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (remaining >= MIN_WAIT).then_some(remaining)
}

/// A raw frame endpoint.
pub trait Link: Send {
    /// Send one frame. Does not wait for any reply.
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Wait up to `timeout` for the next frame, whatever it is.
    fn recv(&mut self, timeout: Duration) -> Result<Bytes, LinkError>;

    /// Release the endpoint. Safe to call more than once.
    fn close(&mut self);
}

/// Opens fresh channels for callers that want one per attempt.
pub trait Connector: Send + Sync {
    type Link: Link + 'static;

    fn open(&self) -> Result<Self::Link, LinkError>;
}

/// Receive until `accept` takes a frame or `timeout` elapses.
///
/// Rejected frames are dropped. The deadline covers the whole call, not each
/// individual receive.
pub fn recv_matching<L, F>(link: &mut L, timeout: Duration, mut accept: F) -> Result<Bytes, LinkError>
where
    L: Link + ?Sized,
    F: FnMut(&[u8]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let Some(remaining) = remaining_until(deadline) else {
            return Err(LinkError::Timeout(timeout));
        };
        let frame = match link.recv(remaining) {
            Ok(frame) => frame,
            Err(LinkError::Timeout(_)) => return Err(LinkError::Timeout(timeout)),
            Err(e) => return Err(e),
        };
        if accept(&frame) {
            return Ok(frame);
        }
        trace!(len = frame.len(), "Discarding unrelated frame");
    }
}
