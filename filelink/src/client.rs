//! Blocking client side of the protocol.
//!
//! The client runs a single session to completion and every protocol
//! rejection terminates it, so unlike the server there is no state
//! machine to schedule; the exchange is written out sequentially.

use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::wire::{self, CHUNK_CEILING, PROTOCOL_VERSION, TRANSFER_ACK};

/// Connect to a filelink server.
pub fn connect(address: &str, port: u16) -> Result<Box<dyn Stream>> {
    let stream = TcpStream::connect((address, port)).map_err(Error::Io)?;
    Ok(Box::new(stream))
}

/// Download `filename` into `dest`, refusing files larger than
/// `max_file_size` bytes. Returns the number of file bytes received.
///
/// The size limit is enforced before any file content crosses the wire:
/// an oversized offer is declined with the readiness flag and the
/// destination is never touched.
pub fn download(
    stream: &mut dyn Stream,
    filename: &str,
    max_file_size: u64,
    dest: &Path,
) -> Result<u64> {
    wire::send_byte(stream, PROTOCOL_VERSION)?;
    if !wire::recv_flag(stream)? {
        return Err(Error::VersionMismatch);
    }

    let namebuf = wire::encode_filename(filename)?;
    wire::send_all(stream, &namebuf)?;
    if !wire::recv_flag(stream)? {
        return Err(Error::FileUnavailable);
    }

    let size = wire::recv_size(stream)?;
    debug!(filename, size, "server offers file");
    if size > max_file_size {
        wire::send_flag(stream, false)?;
        return Err(Error::FileTooLarge {
            size,
            limit: max_file_size,
        });
    }
    let mut out = match File::create(dest) {
        Ok(f) => f,
        Err(e) => {
            let _ = wire::send_flag(stream, false);
            return Err(Error::Io(e));
        }
    };
    wire::send_flag(stream, true)?;

    let mut buf = [0u8; CHUNK_CEILING];
    let mut received: u64 = 0;
    while received < size {
        let want = ((size - received).min(CHUNK_CEILING as u64)) as usize;
        wire::recv_exact(stream, &mut buf[..want])?;
        out.write_all(&buf[..want]).map_err(Error::Io)?;
        received += want as u64;
    }
    out.flush().map_err(Error::Io)?;

    wire::send_byte(stream, TRANSFER_ACK)?;
    info!(filename, received, dest = %dest.display(), "transfer complete");
    Ok(received)
}
