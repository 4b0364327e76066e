//! Per-client connection state, owned by exactly one worker.

use edgepoll_core::chain::ChunkBuffer;

use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

/// An accepted client: its descriptor, peer address and byte buffers.
///
/// `inbound` collects everything the worker has read from the socket and
/// not yet consumed by the read callback. `outbound` is a staging area for
/// callers; nothing in the server drains it.
pub struct Connection {
    fd: RawFd,
    peer: SocketAddrV4,
    inbound: ChunkBuffer,
    outbound: ChunkBuffer,
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddrV4) -> Self {
        Self {
            fd,
            peer,
            inbound: ChunkBuffer::new(),
            outbound: ChunkBuffer::new(),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn inbound(&self) -> &ChunkBuffer {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut ChunkBuffer {
        &mut self.inbound
    }

    pub fn outbound(&self) -> &ChunkBuffer {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut ChunkBuffer {
        &mut self.outbound
    }

    /// Unread inbound bytes.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Drain the inbound buffer into a fresh `Vec`.
    pub fn take_inbound(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.inbound.len()];
        let n = self.inbound.read(&mut out);
        out.truncate(n);
        out
    }

    /// Return both buffers' chunks to the pool.
    pub fn clean(&mut self) {
        self.inbound.clean();
        self.outbound.clean();
    }
}

/// Reads from the inbound buffer. `Ok(0)` means nothing is buffered right
/// now; it does not mean the peer closed.
impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.inbound.read(buf))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
