//! Raw inotify session: watch registration and buffered event decoding
//!
//! Binds the kernel notification API directly through libc. The session owns
//! the inotify descriptor, the read buffer, and a cancellation eventfd that
//! unblocks an in-progress read when the watcher is stopped.
//!
//! Wire layout of one kernel record (little-endian):
//!
//! ```text
//! offset 0:  i32  watch descriptor
//! offset 4:  u32  mask
//! offset 8:  u32  cookie (pairs IN_MOVED_FROM/IN_MOVED_TO; 0 if unused)
//! offset 12: u32  name length
//! offset 16: name bytes, NUL-padded
//! ```

use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::error::WatchError;

/// Floor on the event buffer: one maximal record is 16 bytes of header plus
/// NAME_MAX (255) bytes of NUL-padded name, so 4 KiB always holds several.
pub const MIN_BUFFER_CAPACITY: usize = 4096;

/// Default event buffer size
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Fixed-size prefix of every kernel record
const EVENT_HEADER_LEN: usize = 16;

bitflags! {
    /// inotify event mask bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const IN_ACCESS = 0x0000_0001;
        const IN_MODIFY = 0x0000_0002;
        const IN_ATTRIB = 0x0000_0004;
        const IN_CLOSE_WRITE = 0x0000_0008;
        const IN_MOVED_FROM = 0x0000_0040;
        const IN_MOVED_TO = 0x0000_0080;
        const IN_CREATE = 0x0000_0100;
        const IN_DELETE = 0x0000_0200;
        const IN_DELETE_SELF = 0x0000_0400;
        const IN_MOVE_SELF = 0x0000_0800;
        const IN_UNMOUNT = 0x0000_2000;
        const IN_Q_OVERFLOW = 0x0000_4000;
        const IN_IGNORED = 0x0000_8000;
        const IN_ONLYDIR = 0x0100_0000;
        const IN_DONT_FOLLOW = 0x0200_0000;
        const IN_EXCL_UNLINK = 0x0400_0000;
        const IN_ISDIR = 0x4000_0000;
    }
}

/// One decoded kernel event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Watch descriptor the event was reported against (-1 for queue overflow)
    pub wd: i32,
    /// Event mask
    pub mask: EventMask,
    /// Rename-correlation cookie (0 if unused)
    pub cookie: u32,
    /// Entry name relative to the watched directory, if any
    pub name: Option<OsString>,
}

impl RawEvent {
    /// Whether the subject of the event is a directory
    pub fn is_dir(&self) -> bool {
        self.mask.contains(EventMask::IN_ISDIR)
    }
}

/// Cancellation signal shared between the processing loop and the facade
///
/// Wraps an eventfd: writing it makes the fd readable, which wakes the
/// session's poll-based blocking read. The flag is also checked directly at
/// the top of each loop iteration.
pub struct Canceller {
    fd: RawFd,
    flagged: AtomicBool,
}

impl Canceller {
    fn new() -> std::io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            flagged: AtomicBool::new(false),
        })
    }

    /// Request cancellation; idempotent and callable from any thread
    pub fn cancel(&self) {
        self.flagged.store(true, Ordering::SeqCst);
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            trace!("eventfd wakeup write failed: {}", std::io::Error::last_os_error());
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }
}

impl Drop for Canceller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Outcome of a buffer refill attempt
enum Fill {
    /// Fresh bytes were read into the buffer
    Data,
    /// The poll window elapsed without data
    TimedOut,
    /// Cancellation was signalled (end of stream)
    Cancelled,
}

/// One open inotify session
///
/// The buffer, read cursor and valid length are owned exclusively by the
/// processing loop; registration calls only touch the descriptor and take
/// `&self`.
pub struct Session {
    fd: RawFd,
    cancel: Arc<Canceller>,
    buffer: Vec<u8>,
    cursor: usize,
    valid: usize,
}

impl Session {
    /// Open a new inotify session with the given buffer capacity
    ///
    /// The capacity is clamped to [`MIN_BUFFER_CAPACITY`]. Distinguishes the
    /// per-user instance cap (EMFILE/ENFILE) from other creation failures.
    pub fn open(capacity: usize) -> Result<Self, WatchError> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) => WatchError::InstanceLimitExceeded,
                _ => WatchError::SessionCreateFailed(err),
            });
        }

        let cancel = match Canceller::new() {
            Ok(c) => Arc::new(c),
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(WatchError::SessionCreateFailed(err));
            }
        };

        debug!("opened inotify session (fd {})", fd);
        Ok(Self {
            fd,
            cancel,
            buffer: vec![0u8; capacity.max(MIN_BUFFER_CAPACITY)],
            cursor: 0,
            valid: 0,
        })
    }

    /// Handle used to cancel this session from another thread
    pub fn canceller(&self) -> Arc<Canceller> {
        Arc::clone(&self.cancel)
    }

    /// Register a watch on `path` with the given mask
    ///
    /// Returns the kernel watch descriptor. Registering a path that is
    /// already watched returns the existing descriptor.
    pub fn add_watch(&self, path: &Path, mask: EventMask) -> Result<i32, WatchError> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            WatchError::NotFound(path.to_path_buf())
        })?;
        let wd = unsafe { libc::inotify_add_watch(self.fd, cpath.as_ptr(), mask.bits()) };
        if wd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOSPC) => WatchError::WatchLimitExceeded,
                Some(libc::ENOENT) => WatchError::NotFound(path.to_path_buf()),
                _ => WatchError::WatchFailed {
                    path: path.to_path_buf(),
                    source: err,
                },
            });
        }
        trace!("added watch {} on {}", wd, path.display());
        Ok(wd)
    }

    /// Deregister a watch descriptor
    ///
    /// Removing a descriptor the kernel has already invalidated (EINVAL) is
    /// treated as success.
    pub fn remove_watch(&self, wd: i32) -> Result<(), WatchError> {
        let ret = unsafe { libc::inotify_rm_watch(self.fd, wd) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(WatchError::RemoveFailed { wd, source: err });
            }
        }
        Ok(())
    }

    /// Whether undecoded bytes remain in the read buffer
    pub fn has_buffered_data(&self) -> bool {
        self.cursor < self.valid
    }

    /// Poll the kernel for more event data within `timeout`
    ///
    /// Any data that arrives is read into the buffer. Returns false on
    /// timeout or cancellation.
    pub fn poll_for_data(&mut self, timeout: Duration) -> Result<bool, WatchError> {
        match self.fill(Some(timeout))? {
            Fill::Data => Ok(true),
            Fill::TimedOut | Fill::Cancelled => Ok(false),
        }
    }

    /// Decode the next complete event record
    ///
    /// Blocks (read-decode loop) until a record is available or the session
    /// is cancelled. Returns `Ok(None)` on cancellation (end of stream).
    /// Interrupted reads are retried in place; a record split across reads is
    /// compacted to the front of the buffer and completed by the next read.
    pub fn next_event(&mut self) -> Result<Option<RawEvent>, WatchError> {
        loop {
            if let Some(event) = self.decode_one() {
                return Ok(Some(event));
            }
            match self.fill(None)? {
                Fill::Data => continue,
                Fill::Cancelled => return Ok(None),
                // Cannot time out with an infinite wait; treat as retry
                Fill::TimedOut => continue,
            }
        }
    }

    /// Decode one record from the buffer, or compact a partial record and
    /// return None to request a refill
    fn decode_one(&mut self) -> Option<RawEvent> {
        let avail = self.valid - self.cursor;
        if avail == 0 {
            self.cursor = 0;
            self.valid = 0;
            return None;
        }
        match parse_record(&self.buffer[self.cursor..self.valid]) {
            Some((event, consumed)) => {
                self.cursor += consumed;
                Some(event)
            }
            None => {
                self.compact();
                None
            }
        }
    }

    /// Move the partial tail of the buffer to the front so the next read can
    /// complete the split record
    fn compact(&mut self) {
        self.buffer.copy_within(self.cursor..self.valid, 0);
        self.valid -= self.cursor;
        self.cursor = 0;
    }

    /// Wait for readability (inotify fd or cancel eventfd) and read fresh
    /// bytes into the buffer
    fn fill(&mut self, timeout: Option<Duration>) -> Result<Fill, WatchError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Fill::Cancelled);
            }

            // A read that exactly filled the buffer and was then fully
            // decoded leaves cursor == valid == capacity; reset so the next
            // read has room instead of a zero-length read
            if self.cursor == self.valid {
                self.cursor = 0;
                self.valid = 0;
            }

            let mut fds = [
                libc::pollfd {
                    fd: self.fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.cancel.fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let timeout_ms = match timeout {
                Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
                None => -1,
            };

            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(WatchError::Read(err));
            }
            if ready == 0 {
                return Ok(Fill::TimedOut);
            }
            if fds[1].revents != 0 {
                return Ok(Fill::Cancelled);
            }
            if fds[0].revents == 0 {
                continue;
            }

            let spare = self.buffer.len() - self.valid;
            let read = unsafe {
                libc::read(
                    self.fd,
                    self.buffer[self.valid..].as_mut_ptr() as *mut libc::c_void,
                    spare,
                )
            };
            if read < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    // Interrupted or spurious wakeup: retry
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => return Err(WatchError::Read(err)),
                }
            }
            if read == 0 {
                // Descriptor closed underneath us
                return Ok(Fill::Cancelled);
            }
            self.valid += read as usize;
            return Ok(Fill::Data);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Parse one record from the front of `buf`
///
/// Returns the decoded event and the number of bytes consumed, or None if
/// the slice does not hold a complete record.
pub(crate) fn parse_record(buf: &[u8]) -> Option<(RawEvent, usize)> {
    if buf.len() < EVENT_HEADER_LEN {
        return None;
    }
    let wd = read_i32_le(buf, 0);
    let mask = EventMask::from_bits_retain(read_u32_le(buf, 4));
    let cookie = read_u32_le(buf, 8);
    let name_len = read_u32_le(buf, 12) as usize;
    let total = EVENT_HEADER_LEN + name_len;
    if buf.len() < total {
        return None;
    }

    let raw_name = &buf[EVENT_HEADER_LEN..total];
    let end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
    let name = if end > 0 {
        Some(OsString::from_vec(raw_name[..end].to_vec()))
    } else {
        None
    };

    Some((
        RawEvent {
            wd,
            mask,
            cookie,
            name,
        },
        total,
    ))
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    read_u32_le(buf, offset) as i32
}
