//! AF_PACKET channel bound to one interface and one EtherType.
//!
//! The kernel filters on EtherType at bind time, but also loops our own
//! transmissions back to the socket as `PACKET_OUTGOING`; those are skipped
//! here. Port filtering is left to the caller.

use super::{remaining_until, Connector, Link, LinkError};
use crate::protocol::MacAddr;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Largest frame we are willing to receive.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Raw link-layer channel.
pub struct RawChannel {
    socket: Option<Socket>,
    interface: String,
    buf: Box<[MaybeUninit<u8>]>,
}

impl RawChannel {
    /// Open a raw endpoint on `interface` receiving frames of `protocol_id`.
    pub fn open(interface: &str, protocol_id: u16) -> Result<Self, LinkError> {
        let open_err = |source: io::Error| LinkError::Open {
            interface: interface.to_string(),
            source,
        };

        let ifindex = interface_index(interface).map_err(open_err)?;
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(protocol_id.to_be()))),
        )
        .map_err(open_err)?;
        socket
            .bind(&link_addr(ifindex, protocol_id))
            .map_err(open_err)?;

        debug!(interface, ifindex, protocol_id = %format_args!("{protocol_id:#06x}"), "Opened raw channel");

        Ok(Self {
            socket: Some(socket),
            interface: interface.to_string(),
            buf: vec![MaybeUninit::uninit(); RECV_BUFFER_SIZE].into_boxed_slice(),
        })
    }
}

impl Link for RawChannel {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::Closed)?;
        let sent = socket.send(frame).map_err(LinkError::Send)?;
        if sent != frame.len() {
            return Err(LinkError::Send(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", frame.len()),
            )));
        }
        trace!(len = frame.len(), "Sent frame");
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Bytes, LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::Closed)?;
        let deadline = Instant::now() + timeout;

        loop {
            let Some(remaining) = remaining_until(deadline) else {
                return Err(LinkError::Timeout(timeout));
            };
            socket
                .set_read_timeout(Some(remaining))
                .map_err(LinkError::Recv)?;

            let (n, from) = match socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(LinkError::Recv(e)),
            };

            if is_outgoing(&from) {
                continue;
            }

            // SAFETY: recv_from initialised the first `n` bytes.
            let data = unsafe { std::slice::from_raw_parts(self.buf.as_ptr() as *const u8, n) };
            trace!(len = n, "Received frame");
            return Ok(Bytes::copy_from_slice(data));
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            trace!(interface = %self.interface, "Closed raw channel");
        }
    }
}

/// Opens a fresh [`RawChannel`] per call.
#[derive(Debug, Clone)]
pub struct RawConnector {
    pub interface: String,
    pub protocol_id: u16,
}

impl Connector for RawConnector {
    type Link = RawChannel;

    fn open(&self) -> Result<RawChannel, LinkError> {
        RawChannel::open(&self.interface, self.protocol_id)
    }
}

fn interface_index(interface: &str) -> io::Result<u32> {
    let name = CString::new(interface)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

fn link_addr(ifindex: u32, protocol_id: u16) -> SockAddr {
    // SAFETY: sockaddr_storage is plain data and large enough for sockaddr_ll.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // SAFETY: the storage is zeroed, aligned for any sockaddr and outlives `sll`.
    let sll = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll) };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = protocol_id.to_be();
    sll.sll_ifindex = ifindex as libc::c_int;
    // SAFETY: storage holds a fully initialised sockaddr_ll of the given length.
    unsafe {
        SockAddr::new(
            storage,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    }
}

fn is_outgoing(from: &SockAddr) -> bool {
    if from.family() != libc::AF_PACKET as libc::sa_family_t {
        return false;
    }
    // SAFETY: family is AF_PACKET, so the address is a sockaddr_ll.
    let sll = unsafe { &*(from.as_ptr() as *const libc::sockaddr_ll) };
    sll.sll_pkttype == libc::PACKET_OUTGOING
}

/// Hardware address of `interface`, from sysfs.
pub fn interface_mac(interface: &str) -> io::Result<MacAddr> {
    let path = Path::new("/sys/class/net").join(interface).join("address");
    std::fs::read_to_string(&path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// MTU of `interface`, from sysfs.
pub fn interface_mtu(interface: &str) -> io::Result<usize> {
    let path = Path::new("/sys/class/net").join(interface).join("mtu");
    std::fs::read_to_string(&path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
