use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::error::Result;

/// Transport seam between the protocol engine and the socket.
///
/// Both server backends and the client work through `Box<dyn Stream>`, so
/// tests can drive a [`crate::Session`] over a `UnixStream` pair instead of
/// a real TCP connection.
pub trait Stream: Read + Write + Send + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }
}

impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }
}
