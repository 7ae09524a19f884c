//! Thin wrapper over the kernel readiness interface (epoll).
//!
//! Split the way mio splits `Poll` from `Registry`: the [`Epoller`] owns
//! the event buffer and is the only thing that waits, while the cloneable
//! [`Registry`] handle performs `add`/`modify`/`delete` and is safe to
//! share with worker threads that re-arm interest after finishing a task.
//! Oneshot and edge-triggering are the kernel's own `EPOLLONESHOT` /
//! `EPOLLET`: a oneshot fd goes quiet after one event until `modify`
//! re-arms it.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Set of readiness conditions an fd is registered for, or was reported
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// Data can be read.
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// Data can be written.
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// The fd hung up.
    pub const HANGUP: Interest = Interest(libc::EPOLLHUP as u32);
    /// The peer closed its writing half.
    pub const PEER_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Error condition on the fd.
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    /// Mute the fd after one event until it is re-armed.
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    /// Report transitions instead of levels.
    pub const EDGE_TRIGGERED: Interest = Interest(libc::EPOLLET as u32);

    /// True when any bit of `other` is present in `self`.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Shareable handle performing interest-set changes on the epoll fd.
/// `epoll_ctl` is thread-safe, so workers may re-arm while the reactor
/// waits.
#[derive(Debug)]
pub struct Registry {
    epfd: OwnedFd,
}

impl Registry {
    /// Starts watching `fd` with `interest`.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replaces `fd`'s interest set, re-arming a oneshot registration.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Stops watching `fd`.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            // SAFETY: a null event pointer is allowed (and on old kernels
            // required to be non-null only pre-2.6.9) for EPOLL_CTL_DEL.
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        // SAFETY: `event` is a valid epoll_event for the duration of the
        // call and `epfd` is a live epoll descriptor.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Owner of the epoll instance and the ready-event buffer.
pub struct Epoller {
    registry: Arc<Registry>,
    events: Vec<libc::epoll_event>,
}

impl std::fmt::Debug for Epoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoller")
            .field("registry", &self.registry)
            .field("capacity", &self.events.len())
            .finish()
    }
}

impl Epoller {
    /// Creates an epoll instance reporting at most `max_events` per wait.
    pub fn new(max_events: usize) -> io::Result<Epoller> {
        let fd = unsafe {
            // SAFETY: plain syscall; the result is checked below.
            libc::epoll_create1(libc::EPOLL_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Epoller {
            registry: Arc::new(Registry { epfd }),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// The shareable ctl handle.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Blocks until events arrive or `timeout` passes (`None` waits
    /// forever). Returns the number of ready events; an interrupted wait
    /// counts as zero.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let millis: libc::c_int = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        // SAFETY: `events` stays alive and correctly sized for the call.
        let count = unsafe {
            libc::epoll_wait(
                self.registry.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                millis,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(count as usize)
    }

    /// The fd behind ready event `i` of the last wait.
    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    /// The readiness bits of ready event `i` of the last wait.
    pub fn event_ready(&self, i: usize) -> Interest {
        Interest(self.events[i].events)
    }
}

/// Wakes a blocked [`Epoller::wait`] from another thread via an eventfd
/// registered level-triggered with the epoll instance.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    /// Creates the eventfd and registers it with `registry`.
    pub fn new(registry: &Registry) -> io::Result<Waker> {
        let fd = unsafe {
            // SAFETY: plain syscall; the result is checked below.
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        registry.add(owned.as_raw_fd(), Interest::READABLE)?;
        Ok(Waker { fd: owned })
    }

    /// The eventfd, for recognizing wake events in the reactor loop.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Makes the next (or current) `wait` return immediately. A saturated
    /// eventfd counter still wakes the reactor, so that case is not an
    /// error.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a live stack variable.
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears the eventfd counter after a wake has been observed.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        // SAFETY: reads 8 bytes into a live stack variable.
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut count as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}
