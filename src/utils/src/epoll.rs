// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Minimal safe wrapper over the epoll syscalls.
//!
//! Events carry a caller supplied `u64` token so a waiter can find the
//! object a readiness notification belongs to without keeping fd maps.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// The associated fd is readable.
pub const EVENT_IN: u32 = libc::EPOLLIN as u32;
/// Error condition on the associated fd.
pub const EVENT_ERR: u32 = libc::EPOLLERR as u32;
/// Hang up on the associated fd. Reported even when not requested.
pub const EVENT_HUP: u32 = libc::EPOLLHUP as u32;

/// One readiness notification returned by [`Epoll::wait`].
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct EpollEvent(libc::epoll_event);

impl EpollEvent {
    pub fn new(events: u32, data: u64) -> Self {
        EpollEvent(libc::epoll_event { events, u64: data })
    }

    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Mask of `EVENT_*` bits pending on the fd.
    pub fn events(&self) -> u32 {
        self.0.events
    }

    /// The token registered with the fd.
    pub fn data(&self) -> u64 {
        self.0.u64
    }
}

/// Owned epoll instance.
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        // Safe because we check the return value.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { fd })
    }

    /// Registers `fd` for the events in `mask`, tagged with `token`.
    pub fn add(&self, fd: RawFd, mask: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, EpollEvent::new(mask, token))
    }

    /// Removes `fd` from the interest list.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EpollEvent::empty())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mut event: EpollEvent) -> io::Result<()> {
        // Safe because the event pointer is valid for the duration of the call
        // and we check the return value.
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event.0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks up to `timeout_ms` (-1 for no timeout) and fills `events` with
    /// pending notifications, returning how many were written.
    pub fn wait(&self, timeout_ms: i32, events: &mut [EpollEvent]) -> io::Result<usize> {
        // Safe because the events buffer outlives the call and the kernel
        // writes at most `events.len()` entries into it.
        let ret = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr() as *mut libc::epoll_event,
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // Safe because the fd is owned by this struct.
        unsafe { libc::close(self.fd) };
    }
}
