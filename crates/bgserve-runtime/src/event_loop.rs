//! # EventLoop: the dispatch thread's input-source table
//!
//! A minimal cooperative event loop in the shape hosts usually provide:
//! file descriptors are registered with a handler, and each `run_once`
//! polls them and calls the handlers of the ready ones, one at a time, on
//! the calling thread.
//!
//! The loop is `!Send`. Everything registered with it runs on the thread
//! that owns it, which is what lets log callbacks touch host state that
//! is not thread-safe.
//!
//! Handlers may add or remove sources (including themselves) while being
//! dispatched. A source removed mid-round is not dispatched later in that
//! round.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::channel::poll_timeout;

/// Identifies one registered input source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(u64);

struct InputSource {
    id: InputId,
    fd: RawFd,
    handler: Rc<dyn Fn()>,
}

struct LoopInner {
    sources: RefCell<Vec<InputSource>>,
    next_id: Cell<u64>,
}

/// Cooperative single-threaded event loop. Clones share the same table.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("sources", &self.len()).finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner {
                sources: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Call `handler` whenever `fd` is readable or hung up
    pub fn add_input_handler<F>(&self, fd: RawFd, handler: F) -> InputId
    where
        F: Fn() + 'static,
    {
        let id = InputId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner.sources.borrow_mut().push(InputSource {
            id,
            fd,
            handler: Rc::new(handler),
        });
        trace!(fd, input = id.0, "input handler added");
        id
    }

    /// Returns false if `id` was not registered
    pub fn remove_input_handler(&self, id: InputId) -> bool {
        let mut sources = self.inner.sources.borrow_mut();
        match sources.iter().position(|s| s.id == id) {
            Some(idx) => {
                let source = sources.remove(idx);
                trace!(fd = source.fd, input = id.0, "input handler removed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: InputId) -> bool {
        self.inner.sources.borrow().iter().any(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout` for input, dispatch every ready handler once.
    ///
    /// `None` waits until something is ready. With no sources this just
    /// sleeps for `timeout`. Returns the number of handlers called.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let (ids, mut pfds): (Vec<InputId>, Vec<libc::pollfd>) = self
            .inner
            .sources
            .borrow()
            .iter()
            .map(|s| {
                (
                    s.id,
                    libc::pollfd {
                        fd: s.fd,
                        events: libc::POLLIN,
                        revents: 0,
                    },
                )
            })
            .unzip();

        let ret = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                poll_timeout(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        let mut dispatched = 0;
        for (id, pfd) in ids.iter().zip(&pfds) {
            if pfd.revents & ready == 0 {
                continue;
            }
            // Re-resolve: an earlier handler may have removed this source
            let handler = self
                .inner
                .sources
                .borrow()
                .iter()
                .find(|s| s.id == *id)
                .map(|s| Rc::clone(&s.handler));
            if let Some(handler) = handler {
                handler();
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Dispatch until nothing is ready within `idle`
    pub fn run_until_idle(&self, idle: Duration) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.run_once(Some(idle))? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_empty_loop_sleeps() {
        let ev = EventLoop::new();
        assert!(ev.is_empty());
        assert_eq!(ev.run_once(Some(Duration::from_millis(1))).unwrap(), 0);
    }

    #[test]
    fn test_ready_fd_dispatches_handler() {
        let ev = EventLoop::new();
        let (rx, tx) = pipe().unwrap();
        let rx = Rc::new(File::from(rx));
        let got = Rc::new(RefCell::new(Vec::new()));

        let (r, g) = (rx.clone(), got.clone());
        ev.add_input_handler(rx.as_raw_fd(), move || {
            let mut buf = [0u8; 16];
            let n = (&*r).read(&mut buf).unwrap();
            g.borrow_mut().extend_from_slice(&buf[..n]);
        });

        assert_eq!(ev.run_once(Some(Duration::ZERO)).unwrap(), 0);
        File::from(tx).write_all(b"hi").unwrap();
        assert_eq!(ev.run_once(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(&*got.borrow(), b"hi");
    }

    #[test]
    fn test_handler_can_remove_itself() {
        let ev = EventLoop::new();
        let (rx, tx) = pipe().unwrap();
        let calls = Rc::new(Cell::new(0));
        let slot: Rc<Cell<Option<InputId>>> = Rc::new(Cell::new(None));

        let (ev2, c, s) = (ev.clone(), calls.clone(), slot.clone());
        let id = ev.add_input_handler(rx.as_raw_fd(), move || {
            c.set(c.get() + 1);
            if let Some(id) = s.get() {
                assert!(ev2.remove_input_handler(id));
            }
        });
        slot.set(Some(id));

        File::from(tx).write_all(b"x").unwrap();
        ev.run_once(Some(Duration::from_secs(1))).unwrap();
        // Data still unread, but the source is gone
        assert_eq!(ev.run_once(Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(calls.get(), 1);
        assert!(!ev.contains(id));
        assert!(!ev.remove_input_handler(id));
        drop(rx);
    }

    #[test]
    fn test_removed_source_skipped_in_same_round() {
        let ev = EventLoop::new();
        let (rx_a, tx_a) = pipe().unwrap();
        let (rx_b, tx_b) = pipe().unwrap();
        let b_calls = Rc::new(Cell::new(0));
        let b_id: Rc<Cell<Option<InputId>>> = Rc::new(Cell::new(None));

        let (ev2, bid) = (ev.clone(), b_id.clone());
        ev.add_input_handler(rx_a.as_raw_fd(), move || {
            if let Some(id) = bid.get() {
                ev2.remove_input_handler(id);
            }
        });
        let bc = b_calls.clone();
        b_id.set(Some(ev.add_input_handler(rx_b.as_raw_fd(), move || bc.set(bc.get() + 1))));

        File::from(tx_a).write_all(b"a").unwrap();
        File::from(tx_b).write_all(b"b").unwrap();
        assert_eq!(ev.run_once(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(b_calls.get(), 0);
        drop((rx_a, rx_b));
    }
}
