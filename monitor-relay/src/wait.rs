// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-object wait over event file descriptors

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use log::warn;
use vmm_sys_util::eventfd::EventFd;

/// Result of one [`Waiter::wait`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Tokens of every ready descriptor
    Signaled(Vec<u64>),
    TimedOut,
}

impl WaitOutcome {
    pub(crate) fn contains(&self, token: u64) -> bool {
        matches!(self, WaitOutcome::Signaled(tokens) if tokens.contains(&token))
    }
}

/// Blocks until one of a fixed set of descriptors becomes readable
pub(crate) struct Waiter {
    epoll_file: File,
    events: Vec<epoll::Event>,
}

impl Waiter {
    pub(crate) fn new(sources: &[(RawFd, u64)]) -> io::Result<Self> {
        let epoll_fd = epoll::create(true)?;
        // SAFETY: epoll_fd is a freshly created, valid descriptor we own.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };

        for &(fd, token) in sources {
            epoll::ctl(
                epoll_file.as_raw_fd(),
                epoll::ControlOptions::EPOLL_CTL_ADD,
                fd,
                epoll::Event::new(epoll::Events::EPOLLIN, token),
            )?;
        }

        Ok(Self {
            epoll_file,
            events: vec![epoll::Event::new(epoll::Events::empty(), 0); sources.len().max(1)],
        })
    }

    /// Wait up to `timeout`, or forever when `None`
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };

        let num_events = loop {
            match epoll::wait(self.epoll_file.as_raw_fd(), timeout_ms, &mut self.events[..]) {
                Ok(n) => break n,
                // Retry on EINTR, the wait window restarts
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if num_events == 0 {
            return Ok(WaitOutcome::TimedOut);
        }

        Ok(WaitOutcome::Signaled(
            self.events[..num_events].iter().map(|e| e.data).collect(),
        ))
    }
}

/// Reset an auto-reset event after it woke a waiter
pub(crate) fn consume(evt: &EventFd) {
    match evt.read() {
        Ok(_) => {}
        // Someone else already drained it
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => warn!("Failed to reset event {}: {e}", evt.as_raw_fd()),
    }
}
