//! Per-connection protocol state machine.
//!
//! A [`Session`] owns one accepted connection and walks it through the
//! fixed message exchange described in [`crate::wire`]. The state is a
//! closed sum type: each variant carries exactly the resources its phase
//! needs, and dropping a state drops its file handle. There are no
//! backward transitions; every state can fall through to [`SessionState::Closed`]
//! on failure, which drops only this session.
//!
//! [`Session::advance`] performs at most one state's worth of protocol I/O
//! per call and only when the passed [`Readiness`] covers the direction the
//! current state needs. That is what lets the event loop service every
//! session once per wakeup without blocking or recursion. The one
//! exception in volume is [`SessionState::Streaming`], which pumps up to
//! [`CHUNK_CEILING`] file bytes per call so large transfers still cannot
//! starve other sessions.

use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::paths;
use crate::stream::Stream;
use crate::wire::{self, CHUNK_CEILING, FILENAME_WIRE_LEN, PROTOCOL_VERSION};

/// Which way the next protocol message flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

/// Readiness of a session's socket, as observed by the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// Both directions claimed ready. On a blocking socket this turns the
    /// machine into the plain sequential protocol, which is exactly what
    /// the pooled backend wants.
    pub const BOTH: Readiness = Readiness {
        readable: true,
        writable: true,
    };

    fn covers(&self, direction: Direction) -> bool {
        match direction {
            Direction::Receive => self.readable,
            Direction::Send => self.writable,
        }
    }
}

/// Protocol phase of one connection. Strictly forward.
pub enum SessionState {
    /// Waiting for the client's protocol version byte.
    RecvVersion,
    /// Version byte held; the match verdict is due.
    SendVersionMatch { version: u8 },
    /// Waiting for the fixed-size filename buffer.
    RecvFilename,
    /// Open attempt done; the possibility flag is due. `None` records a
    /// failed open, reported as `false` before dropping the connection.
    SendOpenResult { outcome: Option<(File, u64)> },
    /// Possibility sent; the size is due.
    SendFileSize { file: File, size: u64 },
    /// Size sent; waiting for the client's readiness verdict.
    RecvReady { file: File, size: u64 },
    /// Pumping file bytes, bounded per readiness event.
    Streaming { file: File, size: u64, offset: u64 },
    /// All bytes sent; waiting for the acknowledgement byte.
    RecvFinish,
    /// Terminal. Socket shut down, resources dropped.
    Closed,
}

impl SessionState {
    /// Direction the current phase needs, or `None` once closed.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            SessionState::RecvVersion
            | SessionState::RecvFilename
            | SessionState::RecvReady { .. }
            | SessionState::RecvFinish => Some(Direction::Receive),
            SessionState::SendVersionMatch { .. }
            | SessionState::SendOpenResult { .. }
            | SessionState::SendFileSize { .. }
            | SessionState::Streaming { .. } => Some(Direction::Send),
            SessionState::Closed => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::RecvVersion => "recv-version",
            SessionState::SendVersionMatch { .. } => "send-version-match",
            SessionState::RecvFilename => "recv-filename",
            SessionState::SendOpenResult { .. } => "send-open-result",
            SessionState::SendFileSize { .. } => "send-file-size",
            SessionState::RecvReady { .. } => "recv-ready",
            SessionState::Streaming { .. } => "streaming",
            SessionState::RecvFinish => "recv-finish",
            SessionState::Closed => "closed",
        }
    }
}

/// One accepted connection and its protocol state.
///
/// The session exclusively owns its socket and, while transferring, the
/// open file handle. Reaching [`SessionState::Closed`] shuts the socket
/// down; dropping the session closes it.
pub struct Session {
    stream: Box<dyn Stream>,
    peer: String,
    state: SessionState,
    last_activity: Instant,
}

impl Session {
    pub fn new(stream: Box<dyn Stream>, peer: String) -> Self {
        Session {
            stream,
            peer,
            state: SessionState::RecvVersion,
            last_activity: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Instant of the last completed protocol step.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Drop the connection, e.g. from the idle sweep.
    pub fn close(&mut self) {
        if !self.is_closed() {
            self.state = SessionState::Closed;
            let _ = self.stream.shutdown();
        }
    }

    /// Perform at most one protocol step.
    ///
    /// If `ready` does not cover the direction the current state needs,
    /// the state is left untouched. Any I/O or protocol error drops the
    /// session; errors never propagate to the caller because they are
    /// fatal only to this one connection.
    pub fn advance(&mut self, ready: Readiness, root: &Path) {
        let direction = match self.state.direction() {
            Some(d) => d,
            None => return,
        };
        if !ready.covers(direction) {
            return;
        }

        debug!(peer = %self.peer, state = self.state.name(), "step");

        let state = mem::replace(&mut self.state, SessionState::Closed);
        self.state = match self.step(state, root) {
            Ok(next) => next,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "dropping session");
                SessionState::Closed
            }
        };
        self.last_activity = Instant::now();

        if self.is_closed() {
            let _ = self.stream.shutdown();
        }
    }

    /// Drive the machine to completion on a blocking socket. Used by the
    /// pooled backend; the multiplexed loop calls [`Session::advance`]
    /// directly instead.
    pub fn run_blocking(&mut self, root: &Path) {
        while !self.is_closed() {
            self.advance(Readiness::BOTH, root);
        }
    }

    fn step(&mut self, state: SessionState, root: &Path) -> Result<SessionState> {
        match state {
            SessionState::RecvVersion => {
                let version = wire::recv_byte(&mut self.stream)?;
                Ok(SessionState::SendVersionMatch { version })
            }
            SessionState::SendVersionMatch { version } => {
                let matches = version == PROTOCOL_VERSION;
                wire::send_flag(&mut self.stream, matches)?;
                if !matches {
                    debug!(peer = %self.peer, version, "protocol version mismatch");
                    return Ok(SessionState::Closed);
                }
                Ok(SessionState::RecvFilename)
            }
            SessionState::RecvFilename => {
                let mut buf = [0u8; FILENAME_WIRE_LEN];
                wire::recv_exact(&mut self.stream, &mut buf)?;
                let name = wire::decode_filename(&buf)?;
                let outcome = match open_requested(root, &name) {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        debug!(peer = %self.peer, name = %name, error = %e, "cannot serve file");
                        None
                    }
                };
                Ok(SessionState::SendOpenResult { outcome })
            }
            SessionState::SendOpenResult { outcome } => {
                wire::send_flag(&mut self.stream, outcome.is_some())?;
                match outcome {
                    Some((file, size)) => Ok(SessionState::SendFileSize { file, size }),
                    None => Ok(SessionState::Closed),
                }
            }
            SessionState::SendFileSize { file, size } => {
                wire::send_size(&mut self.stream, size)?;
                Ok(SessionState::RecvReady { file, size })
            }
            SessionState::RecvReady { file, size } => {
                if !wire::recv_flag(&mut self.stream)? {
                    debug!(peer = %self.peer, "client declined transfer");
                    return Ok(SessionState::Closed);
                }
                Ok(SessionState::Streaming {
                    file,
                    size,
                    offset: 0,
                })
            }
            SessionState::Streaming {
                mut file,
                size,
                mut offset,
            } => {
                let mut buf = [0u8; CHUNK_CEILING];
                let mut sent = 0usize;
                while offset < size && sent < CHUNK_CEILING {
                    let want = ((CHUNK_CEILING - sent) as u64).min(size - offset) as usize;
                    file.read_exact(&mut buf[..want])?;
                    wire::send_all(&mut self.stream, &buf[..want])?;
                    offset += want as u64;
                    sent += want;
                }
                if offset == size {
                    // file handle dropped here; only the ack remains
                    Ok(SessionState::RecvFinish)
                } else {
                    Ok(SessionState::Streaming { file, size, offset })
                }
            }
            SessionState::RecvFinish => {
                // The byte's value carries no information; a peer that
                // closed instead of acking gets the same treatment.
                let _ = wire::recv_byte(&mut self.stream);
                debug!(peer = %self.peer, "transfer complete");
                Ok(SessionState::Closed)
            }
            SessionState::Closed => Ok(SessionState::Closed),
        }
    }
}

fn open_requested(root: &Path, name: &str) -> Result<(File, u64)> {
    let path = paths::resolve_under_root(root, name)?;
    let file = File::open(&path).map_err(|_| Error::FileUnavailable)?;
    let size = file.metadata().map_err(|_| Error::FileUnavailable)?.len();
    Ok((file, size))
}
