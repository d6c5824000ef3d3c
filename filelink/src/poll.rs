//! Level-triggered readiness waiting over `select(2)`.
//!
//! Interest sets are rebuilt from scratch every loop iteration: the
//! listener (while capacity remains) plus every live session's descriptor
//! in whichever single direction its state needs. [`Interests`] is the
//! reusable builder; [`Interests::wait`] is the only blocking call in the
//! multiplexed backend.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::machine::Direction;

/// Safe wrapper around `libc::fd_set`.
#[derive(Clone)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        let raw = unsafe {
            let mut raw = MaybeUninit::<libc::fd_set>::zeroed();
            libc::FD_ZERO(raw.as_mut_ptr());
            raw.assume_init()
        };
        FdSet { raw }
    }

    /// Insert a descriptor. Descriptors at or past `FD_SETSIZE` would
    /// index out of the fixed bitmask, so they are refused instead.
    pub fn insert(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(Error::DescriptorOverflow(fd));
        }
        unsafe { libc::FD_SET(fd, &mut self.raw) };
        Ok(())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return false;
        }
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// At least one registered descriptor is ready.
    Ready,
    /// A signal arrived mid-wait; re-check the stop flag and loop.
    Interrupted,
    /// The optional timeout elapsed with nothing ready.
    TimedOut,
}

/// Read/write interest sets for one loop iteration.
pub struct Interests {
    read: FdSet,
    write: FdSet,
    max_fd: RawFd,
}

impl Interests {
    pub fn new() -> Self {
        Interests {
            read: FdSet::new(),
            write: FdSet::new(),
            max_fd: -1,
        }
    }

    pub fn add(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        match direction {
            Direction::Receive => self.read.insert(fd)?,
            Direction::Send => self.write.insert(fd)?,
        }
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.max_fd < 0
    }

    pub fn read_ready(&self, fd: RawFd) -> bool {
        self.read.contains(fd)
    }

    pub fn write_ready(&self, fd: RawFd) -> bool {
        self.write.contains(fd)
    }

    /// Block until a registered descriptor becomes ready, the timeout
    /// elapses, or a signal interrupts the wait. On return the sets hold
    /// the ready descriptors; query them with
    /// [`Interests::read_ready`]/[`Interests::write_ready`].
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Wait> {
        let mut tv = timeout.map(|t| libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        });

        let ret = unsafe {
            libc::select(
                self.max_fd + 1,
                self.read.as_mut_ptr(),
                self.write.as_mut_ptr(),
                ptr::null_mut(),
                tv.as_mut()
                    .map(|tv| tv as *mut libc::timeval)
                    .unwrap_or(ptr::null_mut()),
            )
        };

        match ret {
            -1 => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    Ok(Wait::Interrupted)
                } else {
                    Err(err.into())
                }
            }
            0 => Ok(Wait::TimedOut),
            _ => Ok(Wait::Ready),
        }
    }
}

impl Default for Interests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_set_membership() {
        let mut set = FdSet::new();
        assert!(!set.contains(0));
        set.insert(0).unwrap();
        set.insert(5).unwrap();
        assert!(set.contains(0));
        assert!(set.contains(5));
        assert!(!set.contains(4));
    }

    #[test]
    fn test_fd_set_refuses_oversized_descriptors() {
        let mut set = FdSet::new();
        let err = set.insert(libc::FD_SETSIZE as RawFd).unwrap_err();
        assert!(matches!(err, Error::DescriptorOverflow(_)));
        assert!(matches!(
            set.insert(-1),
            Err(Error::DescriptorOverflow(-1))
        ));
    }

    #[test]
    fn test_wait_sees_readable_data() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();

        let mut interests = Interests::new();
        interests.add(b.as_raw_fd(), Direction::Receive).unwrap();
        let outcome = interests.wait(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(outcome, Wait::Ready);
        assert!(interests.read_ready(b.as_raw_fd()));
        assert!(!interests.write_ready(b.as_raw_fd()));
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let (a, _b) = UnixStream::pair().unwrap();

        let mut interests = Interests::new();
        interests.add(a.as_raw_fd(), Direction::Receive).unwrap();
        let outcome = interests.wait(Some(Duration::from_millis(20))).unwrap();

        assert_eq!(outcome, Wait::TimedOut);
        assert!(!interests.read_ready(a.as_raw_fd()));
    }

    #[test]
    fn test_idle_socket_is_writable() {
        let (a, _b) = UnixStream::pair().unwrap();

        let mut interests = Interests::new();
        interests.add(a.as_raw_fd(), Direction::Send).unwrap();
        let outcome = interests.wait(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(outcome, Wait::Ready);
        assert!(interests.write_ready(a.as_raw_fd()));
    }
}
