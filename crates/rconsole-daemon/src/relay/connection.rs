//! Byte-stream connections the relay can pump.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

/// A connected, bidirectional byte stream.
///
/// Methods take `&self` so one pump loop can send while the other receives.
/// `set_nonblocking` affects both directions, so `send` may report
/// `WouldBlock` once the relay has switched the stream over.
pub trait Connection: Sync {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shut down both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}

impl Connection for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}
