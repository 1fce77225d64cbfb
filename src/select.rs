//! The I/O-readiness multiplexer.
//!
//! User-level elements register descriptor interest with the master; one
//! router thread at a time holds the poller and blocks in it for at most
//! the delay until the next timer, while the others park on their own
//! condvars. A wake-up [`mio::Waker`] registered alongside the descriptors
//! lets any thread interrupt the poller, so scheduling a task onto a
//! sleeping pool never waits out the timeout.
//!
//! Registration is serialized by the binding-table lock, separate from the
//! poller lock, so descriptor churn does not stall a blocked poll (the
//! registry is cloned out of the poller for that reason). Dispatch runs
//! with no locks held: ready events are collected first, then each bound
//! element's `selected` is invoked.

use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::counters;
use crate::element::Element;
use crate::thread::RouterThread;

/// Readiness event classes a descriptor can be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectMask(u8);

impl SelectMask {
    pub const READ: SelectMask = SelectMask(0b01);
    pub const WRITE: SelectMask = SelectMask(0b10);
    pub const BOTH: SelectMask = SelectMask(0b11);

    pub fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SelectMask {
    type Output = SelectMask;

    fn bitor(self, rhs: SelectMask) -> SelectMask {
        SelectMask(self.0 | rhs.0)
    }
}

const WAKE_TOKEN: Token = Token(usize::MAX);
const NOT_POLLING: i32 = i32::MIN;

/// Handle for kicking a thread out of a blocked poll.
pub(crate) struct IoWake {
    waker: Waker,
    /// Id of the thread currently blocked in the poller.
    polling: AtomicI32,
}

impl IoWake {
    /// Wakes the poller only if `thread_id` is the thread inside it.
    pub(crate) fn wake_if_polling(&self, thread_id: i32) {
        if self.polling.load(Ordering::Acquire) == thread_id {
            let _ = self.waker.wake();
        }
    }

    /// Wakes the poller whichever thread holds it.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

struct FdBinding {
    fd: RawFd,
    read: Option<Arc<dyn Element>>,
    write: Option<Arc<dyn Element>>,
}

impl FdBinding {
    fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Bindings {
    by_fd: HashMap<RawFd, usize>,
    slots: Slab<FdBinding>,
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// The registered-descriptor set and its poller.
pub(crate) struct SelectSet {
    registry: Registry,
    io: Arc<IoWake>,
    bindings: Mutex<Bindings>,
    poller: Mutex<Poller>,
}

impl SelectSet {
    pub(crate) fn new() -> io::Result<SelectSet> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(SelectSet {
            registry,
            io: Arc::new(IoWake {
                waker,
                polling: AtomicI32::new(NOT_POLLING),
            }),
            bindings: Mutex::new(Bindings {
                by_fd: HashMap::new(),
                slots: Slab::new(),
            }),
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(1024),
            }),
        })
    }

    pub(crate) fn io_handle(&self) -> Arc<IoWake> {
        self.io.clone()
    }

    /// Binds `element` to readiness events on `fd`. Each descriptor takes
    /// at most one read-side and one write-side element; a second element
    /// claiming an occupied side is rejected with `AlreadyExists`.
    pub(crate) fn add_select(
        &self,
        fd: RawFd,
        element: &Arc<dyn Element>,
        mask: SelectMask,
    ) -> io::Result<()> {
        if mask.is_empty() {
            return Ok(());
        }
        let mut bindings = self.bindings.lock();
        let (slot, existed) = match bindings.by_fd.get(&fd) {
            Some(&slot) => (slot, true),
            None => {
                let slot = bindings.slots.insert(FdBinding {
                    fd,
                    read: None,
                    write: None,
                });
                bindings.by_fd.insert(fd, slot);
                (slot, false)
            }
        };

        let binding = &mut bindings.slots[slot];
        let prev_read = binding.read.clone();
        let prev_write = binding.write.clone();

        let conflict = (mask.readable()
            && prev_read
                .as_ref()
                .is_some_and(|e| !Arc::ptr_eq(e, element)))
            || (mask.writable()
                && prev_write
                    .as_ref()
                    .is_some_and(|e| !Arc::ptr_eq(e, element)));
        if conflict {
            if !existed {
                bindings.slots.remove(slot);
                bindings.by_fd.remove(&fd);
            }
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already selected by another element"),
            ));
        }

        if mask.readable() {
            binding.read = Some(element.clone());
        }
        if mask.writable() {
            binding.write = Some(element.clone());
        }
        let interest = binding.interest().expect("non-empty mask");

        let result = if existed {
            self.registry
                .reregister(&mut SourceFd(&fd), Token(slot), interest)
        } else {
            self.registry
                .register(&mut SourceFd(&fd), Token(slot), interest)
        };
        if let Err(e) = result {
            // Registration failed (bad descriptor, resource exhaustion):
            // roll the table back and report; the caller skips this fd.
            let binding = &mut bindings.slots[slot];
            binding.read = prev_read;
            binding.write = prev_write;
            if binding.interest().is_none() {
                bindings.slots.remove(slot);
                bindings.by_fd.remove(&fd);
            }
            tracing::warn!(fd, error = %e, "descriptor registration failed");
            return Err(e);
        }
        Ok(())
    }

    /// Drops `element`'s claim on the masked sides of `fd`, deregistering
    /// the descriptor once no side remains bound.
    pub(crate) fn remove_select(
        &self,
        fd: RawFd,
        element: &Arc<dyn Element>,
        mask: SelectMask,
    ) -> io::Result<()> {
        let mut bindings = self.bindings.lock();
        let Some(&slot) = bindings.by_fd.get(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not selected"),
            ));
        };
        let binding = &mut bindings.slots[slot];
        if mask.readable() && binding.read.as_ref().is_some_and(|e| Arc::ptr_eq(e, element)) {
            binding.read = None;
        }
        if mask.writable() && binding.write.as_ref().is_some_and(|e| Arc::ptr_eq(e, element)) {
            binding.write = None;
        }
        match binding.interest() {
            Some(interest) => self
                .registry
                .reregister(&mut SourceFd(&fd), Token(slot), interest),
            None => {
                bindings.slots.remove(slot);
                bindings.by_fd.remove(&fd);
                self.registry.deregister(&mut SourceFd(&fd))
            }
        }
    }

    /// Blocks in the poller for at most `timeout` (`None` = until woken)
    /// and dispatches ready descriptors to their bound elements. Returns
    /// false without blocking when another thread already holds the
    /// poller.
    pub(crate) fn run_selects(&self, timeout: Option<Duration>, thread: &RouterThread) -> bool {
        let Some(mut guard) = self.poller.try_lock() else {
            return false;
        };
        self.io.polling.store(thread.id(), Ordering::Release);
        // A wake that raced in before we published ourselves as the
        // poller would otherwise be lost until the timeout; once the flag
        // is published, wakes reach us through the mio waker.
        let timeout = if thread.take_wake_pending() {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        let poller = &mut *guard;
        let result = poller.poll.poll(&mut poller.events, timeout);
        self.io.polling.store(NOT_POLLING, Ordering::Release);
        counters::inc_polls();
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::Interrupted {
                tracing::warn!(error = %e, "i/o poll failed");
            }
            return true;
        }

        let mut ready: Vec<(usize, bool, bool)> = Vec::new();
        for event in poller.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable() || event.is_write_closed();
            if readable || writable {
                ready.push((event.token().0, readable, writable));
            }
        }
        drop(guard);

        for (slot, readable, writable) in ready {
            let (fd, read, write) = {
                let bindings = self.bindings.lock();
                match bindings.slots.get(slot) {
                    // The binding may have been removed since the poll.
                    None => continue,
                    Some(binding) => (
                        binding.fd,
                        if readable { binding.read.clone() } else { None },
                        if writable { binding.write.clone() } else { None },
                    ),
                }
            };
            if let Some(element) = read {
                element.selected(fd, SelectMask::READ);
            }
            if let Some(element) = write {
                element.selected(fd, SelectMask::WRITE);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_bits() {
        assert!(SelectMask::READ.readable());
        assert!(!SelectMask::READ.writable());
        assert!(SelectMask::BOTH.readable() && SelectMask::BOTH.writable());
        assert_eq!(SelectMask::READ | SelectMask::WRITE, SelectMask::BOTH);
    }
}
