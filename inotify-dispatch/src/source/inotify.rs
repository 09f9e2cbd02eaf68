//! Kernel inotify source.
//!
//! The inotify descriptor is non-blocking and polled together with the read
//! end of a pipe. `close` writes to the pipe, which wakes a reader blocked in
//! `poll`, then closes the inotify descriptor once the reader has let go of
//! it. The kernel drops every watch of the instance at that point. The pipe
//! is released when the source is dropped.

use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ResourceLimit, Result, WatchError};
use crate::event::{EventMask, RawEvent, WatchDescriptor};
use crate::source::EventSource;
use crate::tunables::kernel_limits;
use crate::wire::{self, HEADER_SIZE};

// Room for one record carrying a maximal file name.
const MIN_READ_BUFFER: usize = HEADER_SIZE + libc::NAME_MAX as usize + 1;

/// Event source backed by an inotify instance.
pub struct InotifySource {
    // Readers hold the read lock across poll and read; close takes the write
    // lock to release the descriptor.
    inotify: RwLock<Option<OwnedFd>>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    closed: AtomicBool,
}

impl InotifySource {
    /// Create an inotify instance.
    pub fn open() -> Result<Self> {
        let limits = kernel_limits();

        // SAFETY: plain syscall; the returned descriptor is owned below.
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EMFILE) {
                warn!("inotify instance limit reached (max_user_instances={:?})", limits.max_user_instances);
            }
            return Err(init_error(err));
        }
        // SAFETY: `fd` is a fresh descriptor nothing else owns.
        let inotify = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut pipe: [RawFd; 2] = [-1; 2];
        // SAFETY: `pipe` has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(init_error(io::Error::last_os_error()));
        }
        // SAFETY: both descriptors were just created and are owned here only.
        let (wake_read, wake_write) = unsafe { (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1])) };

        info!("opened inotify instance on fd {fd}");
        Ok(Self {
            inotify: RwLock::new(Some(inotify)),
            wake_read,
            wake_write,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns true while the inotify descriptor is open.
    pub fn is_open(&self) -> bool {
        self.inotify.read().is_some()
    }

    /// Wait for `inotify` to become readable. Returns false if the wakeup
    /// pipe fired first.
    fn wait_readable(&self, inotify: &OwnedFd) -> io::Result<bool> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: inotify.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake_read.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` is a valid array of two pollfd structs.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            if fds[1].revents != 0 || self.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(true);
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(io::Error::other("inotify descriptor reported an error"));
            }
        }
    }

    fn available(inotify: &OwnedFd) -> io::Result<usize> {
        let mut available: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int through the pointer.
        let rc = unsafe {
            libc::ioctl(
                inotify.as_raw_fd(),
                libc::FIONREAD,
                std::ptr::addr_of_mut!(available),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(available).unwrap_or(0))
    }
}

fn init_error(err: io::Error) -> WatchError {
    match err.raw_os_error() {
        Some(libc::EMFILE) => ResourceLimit::UserInstances.into(),
        Some(libc::ENFILE) => ResourceLimit::SystemDescriptors.into(),
        Some(libc::ENOMEM) => ResourceLimit::KernelMemory.into(),
        _ => err.into(),
    }
}

impl EventSource for InotifySource {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        let guard = self.inotify.read();
        let Some(inotify) = guard.as_ref() else {
            return Err(WatchError::NotActive);
        };
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            WatchError::invalid_argument(format!("path contains a NUL byte: {}", path.display()))
        })?;

        // SAFETY: `c_path` is a valid NUL-terminated string for the call.
        let wd = unsafe { libc::inotify_add_watch(inotify.as_raw_fd(), c_path.as_ptr(), mask.bits()) };
        if wd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOSPC) => {
                    warn!(
                        "inotify watch limit reached (max_user_watches={:?})",
                        kernel_limits().max_user_watches
                    );
                    ResourceLimit::UserWatches.into()
                }
                Some(libc::ENOMEM) => ResourceLimit::KernelMemory.into(),
                _ => err.into(),
            });
        }
        Ok(WatchDescriptor::new(wd))
    }

    fn remove_watch(&self, wd: WatchDescriptor) -> Result<()> {
        let guard = self.inotify.read();
        let Some(inotify) = guard.as_ref() else {
            return Err(WatchError::NotActive);
        };
        // SAFETY: plain syscall on an owned descriptor.
        if unsafe { libc::inotify_rm_watch(inotify.as_raw_fd(), wd.raw()) } < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINVAL) => WatchError::InvalidDescriptor(wd),
                _ => err.into(),
            });
        }
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<RawEvent>>> {
        loop {
            let guard = self.inotify.read();
            let Some(inotify) = guard.as_ref() else {
                return Ok(None);
            };
            if self.closed.load(Ordering::Acquire) || !self.wait_readable(inotify)? {
                return Ok(None);
            }

            let mut buf = vec![0u8; Self::available(inotify)?.max(MIN_READ_BUFFER)];
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
            let n = unsafe { libc::read(inotify.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    ErrorKind::Interrupted | ErrorKind::WouldBlock => continue,
                    _ => return Err(err.into()),
                }
            }

            buf.truncate(usize::try_from(n).unwrap_or(0));
            if buf.is_empty() {
                continue;
            }
            return wire::decode(&buf).map(Some);
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack value.
        let n = unsafe { libc::write(self.wake_write.as_raw_fd(), std::ptr::addr_of!(byte).cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already has a wakeup pending.
            if err.kind() != ErrorKind::WouldBlock {
                return Err(err.into());
            }
        }

        // Waits for a reader woken above to leave poll.
        let Some(inotify) = self.inotify.write().take() else {
            return Ok(());
        };
        let fd = inotify.into_raw_fd();
        // SAFETY: `fd` came out of the OwnedFd above and is closed exactly once.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!("inotify source closed fd {fd}");
        Ok(())
    }
}
