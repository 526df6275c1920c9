//! In-process shared wire.
//!
//! Behaves like raw packet sockets on one interface: a frame sent by one
//! endpoint is delivered to every other attached endpoint. Closed endpoints
//! stop receiving, so late replies to them are lost just as on a real link.

use super::{Connector, Link, LinkError, MIN_WAIT};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Wire {
    endpoints: Mutex<Vec<(usize, Sender<Bytes>)>>,
    next_id: AtomicUsize,
}

impl Wire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn attach(self: &Arc<Self>) -> WireEndpoint {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.endpoints.lock().unwrap().push((id, tx));
        WireEndpoint {
            id,
            wire: Arc::clone(self),
            rx,
            closed: false,
        }
    }

    /// Number of endpoints currently attached.
    pub fn attached(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    fn broadcast(&self, from: usize, frame: &[u8]) {
        let frame = Bytes::copy_from_slice(frame);
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.retain(|(id, tx)| *id == from || tx.send(frame.clone()).is_ok());
    }

    fn detach(&self, id: usize) {
        self.endpoints.lock().unwrap().retain(|(other, _)| *other != id);
    }
}

pub struct WireEndpoint {
    id: usize,
    wire: Arc<Wire>,
    rx: Receiver<Bytes>,
    closed: bool,
}

impl Link for WireEndpoint {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        self.wire.broadcast(self.id, frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Bytes, LinkError> {
        // A raw socket would block forever on a timeout this short.
        assert!(
            timeout >= MIN_WAIT,
            "recv timeout {timeout:?} is below the socket resolution"
        );
        if self.closed {
            return Err(LinkError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.wire.detach(self.id);
        }
    }
}

impl Drop for WireEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a new endpoint on the wire per call.
pub struct WireConnector(pub Arc<Wire>);

impl Connector for WireConnector {
    type Link = WireEndpoint;

    fn open(&self) -> Result<WireEndpoint, LinkError> {
        Ok(self.0.attach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_skips_sender() {
        let wire = Wire::new();
        let mut a = wire.attach();
        let mut b = wire.attach();
        let mut c = wire.attach();

        a.send(b"hi").unwrap();
        assert_eq!(&b.recv(Duration::from_millis(100)).unwrap()[..], b"hi");
        assert_eq!(&c.recv(Duration::from_millis(100)).unwrap()[..], b"hi");
        assert!(matches!(
            a.recv(Duration::from_millis(20)),
            Err(LinkError::Timeout(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let wire = Wire::new();
        let mut a = wire.attach();
        assert_eq!(wire.attached(), 1);
        a.close();
        a.close();
        assert_eq!(wire.attached(), 0);
        assert!(matches!(a.send(b"x"), Err(LinkError::Closed)));
        drop(a);
        assert_eq!(wire.attached(), 0);
    }
}
