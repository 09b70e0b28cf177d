//! # Log delivery bridge
//!
//! Worker threads never call into the host. An embedded runtime only
//! writes log lines into a pipe. The read end is registered with the
//! dispatch thread's [`EventLoop`], and the handler's trampoline turns
//! "fd readable" into callback invocations on that thread.
//!
//! ## Delivery
//!
//! - Each dispatch reads at most one buffer (`log_buffer_size` bytes).
//! - Bytes are framed into lines; every complete line, `\n` included, is
//!   one callback. A line split across writes or reads is reassembled.
//!   Bursts larger than the buffer take several dispatches; nothing is
//!   truncated.
//! - End of stream flushes any unterminated tail as a final message and
//!   deactivates the handler.
//! - A dispatch that finds the handler already dispatching (the callback
//!   pumped the event loop) does nothing.
//! - Callback errors and panics are contained and counted. They are never
//!   reported to the host.
//!
//! ## Ownership
//!
//! A [`LogHandlerRef`] exclusively owns its callback, user data and read
//! end. The bridge keeps only metadata (id, fd, server) under its lock and
//! the event loop keeps only a weak reference. Removing a handler
//! deregisters it from the event loop before unlinking it, then drops the
//! callback and user data. Dropping the last `LogHandlerRef` does the same.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::{set_nonblocking, LineBuffer};
use crate::config::HostConfig;
use crate::event_loop::{EventLoop, InputId};

/// Log callback: `(handler, message, user_data)`
pub type LogCallback =
    Box<dyn FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>>>;

/// Opaque value handed back to the callback on every message
pub type UserData = Box<dyn Any>;

/// Registered handler, as listed by [`LogBridge::handlers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHandlerInfo {
    pub id: u64,
    pub fd: RawFd,
    /// Service the handler drains, if it was attached by `start`
    pub server: Option<u64>,
}

struct BridgeShared {
    /// Newest first
    nodes: Mutex<Vec<LogHandlerInfo>>,
    next_id: Cell<u64>,
    buffer_size: usize,
    max_line: usize,
}

impl BridgeShared {
    fn unlink(&self, id: u64) -> bool {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|n| n.id != id);
        nodes.len() != before
    }
}

/// Registry of log handlers bound to one event loop
#[derive(Clone)]
pub struct LogBridge {
    event_loop: EventLoop,
    shared: Rc<BridgeShared>,
}

impl LogBridge {
    pub fn new(event_loop: EventLoop, config: &HostConfig) -> Self {
        Self::with_limits(event_loop, config.log_buffer_size, config.max_log_line)
    }

    pub fn with_limits(event_loop: EventLoop, buffer_size: usize, max_line: usize) -> Self {
        Self {
            event_loop,
            shared: Rc::new(BridgeShared {
                nodes: Mutex::new(Vec::new()),
                next_id: Cell::new(1),
                buffer_size: buffer_size.max(1),
                max_line: max_line.max(1),
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Deliver lines read from `fd` to `callback` on the dispatch thread
    pub fn register_log_handler<F>(
        &self,
        fd: OwnedFd,
        callback: F,
        user_data: Option<UserData>,
    ) -> io::Result<LogHandlerRef>
    where
        F: FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>> + 'static,
    {
        self.register(fd, Box::new(callback), user_data, None)
    }

    /// Same as `register_log_handler`, tagged with the service it drains
    pub fn attach(
        &self,
        server: u64,
        fd: OwnedFd,
        callback: LogCallback,
        user_data: Option<UserData>,
    ) -> io::Result<LogHandlerRef> {
        self.register(fd, callback, user_data, Some(server))
    }

    fn register(
        &self,
        fd: OwnedFd,
        callback: LogCallback,
        user_data: Option<UserData>,
        server: Option<u64>,
    ) -> io::Result<LogHandlerRef> {
        let raw = fd.as_raw_fd();
        set_nonblocking(raw)?;

        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);

        let inner = Rc::new(HandlerInner {
            id,
            fd: raw,
            server,
            reader: File::from(fd),
            callback: RefCell::new(Some(callback)),
            user_data: RefCell::new(user_data),
            input: Cell::new(None),
            active: Cell::new(true),
            in_progress: Cell::new(false),
            lines: RefCell::new(LineBuffer::new(self.shared.max_line)),
            buffer_size: self.shared.buffer_size,
            delivered: Cell::new(0),
            failures: Cell::new(0),
            event_loop: self.event_loop.clone(),
            shared: Rc::clone(&self.shared),
        });

        self.shared
            .nodes
            .lock()
            .insert(0, LogHandlerInfo { id, fd: raw, server });

        let weak: Weak<HandlerInner> = Rc::downgrade(&inner);
        let input = self.event_loop.add_input_handler(raw, move || {
            if let Some(inner) = weak.upgrade() {
                LogHandlerRef { inner }.dispatch();
            }
        });
        inner.input.set(Some(input));

        debug!(handler = id, fd = raw, server, "log handler registered");
        Ok(LogHandlerRef { inner })
    }

    /// Returns whether a registered handler was removed
    pub fn remove_log_handler(&self, handler: &LogHandlerRef) -> bool {
        handler.remove()
    }

    /// Registered handlers, newest first
    pub fn handlers(&self) -> Vec<LogHandlerInfo> {
        self.shared.nodes.lock().clone()
    }

    /// Handler draining `server`, if one is registered
    pub fn handler_for(&self, server: u64) -> Option<LogHandlerInfo> {
        self.shared
            .nodes
            .lock()
            .iter()
            .find(|n| n.server == Some(server))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct HandlerInner {
    id: u64,
    fd: RawFd,
    server: Option<u64>,
    reader: File,
    callback: RefCell<Option<LogCallback>>,
    user_data: RefCell<Option<UserData>>,
    input: Cell<Option<InputId>>,
    active: Cell<bool>,
    in_progress: Cell<bool>,
    lines: RefCell<LineBuffer>,
    buffer_size: usize,
    delivered: Cell<u64>,
    failures: Cell<u64>,
    event_loop: EventLoop,
    shared: Rc<BridgeShared>,
}

impl HandlerInner {
    /// Deregister from the event loop, unlink, release pinned values.
    /// Returns whether the handler was still registered.
    fn detach(&self) -> bool {
        self.active.set(false);
        if let Some(input) = self.input.take() {
            self.event_loop.remove_input_handler(input);
        }
        let unlinked = self.shared.unlink(self.id);
        // Mid-dispatch these are borrowed; dispatch drops them on the way out
        self.release_pinned();
        if unlinked {
            debug!(handler = self.id, server = self.server, "log handler removed");
        }
        unlinked
    }

    fn release_pinned(&self) {
        if let Ok(mut cb) = self.callback.try_borrow_mut() {
            cb.take();
        }
        if let Ok(mut data) = self.user_data.try_borrow_mut() {
            data.take();
        }
    }
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        self.detach();
    }
}

/// What one dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pump {
    /// Nothing to read, or not allowed to read now
    Idle,
    /// Read this many bytes
    Read(usize),
    /// End of stream or read error; handler deactivated
    Closed,
}

struct InProgress<'a>(&'a Cell<bool>);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Handle to a registered log handler. Clones share the handler.
#[derive(Clone)]
pub struct LogHandlerRef {
    inner: Rc<HandlerInner>,
}

impl PartialEq for LogHandlerRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for LogHandlerRef {}

impl fmt::Debug for LogHandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandlerRef")
            .field("id", &self.inner.id)
            .field("fd", &self.inner.fd)
            .field("server", &self.inner.server)
            .field("active", &self.inner.active.get())
            .finish()
    }
}

impl LogHandlerRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    #[inline]
    pub fn server(&self) -> Option<u64> {
        self.inner.server
    }

    /// Registered and not yet at end of stream
    #[inline]
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    /// Messages the callback accepted
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.get()
    }

    /// Messages whose callback returned an error or panicked
    pub fn callback_failures(&self) -> u64 {
        self.inner.failures.get()
    }

    /// Stop delivery and release the callback. Returns false if the
    /// handler was already removed.
    pub fn remove(&self) -> bool {
        self.inner.detach()
    }

    /// Read and deliver everything currently in the pipe.
    ///
    /// Used after a worker is joined, so the last lines are not lost when
    /// the handler is removed. Returns the number of messages delivered.
    pub fn drain(&self) -> u64 {
        let before = self.delivered() + self.callback_failures();
        while let Pump::Read(_) = self.dispatch() {}
        self.delivered() + self.callback_failures() - before
    }

    /// The trampoline: one bounded read, then one callback per message
    fn dispatch(&self) -> Pump {
        let inner = &*self.inner;
        if !inner.active.get() || inner.in_progress.get() {
            return Pump::Idle;
        }
        inner.in_progress.set(true);
        let guard = InProgress(&inner.in_progress);

        let mut buf = vec![0u8; inner.buffer_size];
        let read = loop {
            match (&inner.reader).read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let mut messages = Vec::new();
        let pump = match read {
            Ok(0) => {
                inner.lines.borrow_mut().finish(|l| messages.push(text(l)));
                Pump::Closed
            }
            Ok(n) => {
                inner.lines.borrow_mut().push(&buf[..n], |l| messages.push(text(l)));
                Pump::Read(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Pump::Idle,
            Err(e) => {
                debug!(handler = inner.id, error = %e, "log read failed");
                inner.lines.borrow_mut().finish(|l| messages.push(text(l)));
                Pump::Closed
            }
        };

        for message in &messages {
            if !inner.active.get() {
                break;
            }
            self.invoke(message);
        }

        if pump == Pump::Closed && inner.active.get() {
            trace!(handler = inner.id, "log stream closed");
            inner.detach();
        }
        drop(guard);
        if !inner.active.get() {
            inner.release_pinned();
        }
        pump
    }

    fn invoke(&self, message: &str) {
        let inner = &*self.inner;
        let mut slot = inner.callback.borrow_mut();
        let Some(callback) = slot.as_mut() else {
            return;
        };
        let data = inner.user_data.borrow();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            callback(self, message, data.as_deref())
        }));
        match outcome {
            Ok(Ok(())) => inner.delivered.set(inner.delivered.get() + 1),
            // Contained: the host never sees callback failures
            Ok(Err(_)) | Err(_) => inner.failures.set(inner.failures.get() + 1),
        }
    }
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe;
    use std::io::Write;
    use std::time::Duration;

    type Seen = Rc<RefCell<Vec<String>>>;

    fn bridge(buffer: usize) -> LogBridge {
        LogBridge::with_limits(EventLoop::new(), buffer, 1 << 16)
    }

    fn recorder(seen: &Seen) -> impl FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>> {
        let seen = seen.clone();
        move |_h, msg, _u| {
            seen.borrow_mut().push(msg.to_string());
            Ok(())
        }
    }

    fn pump(bridge: &LogBridge) {
        bridge.event_loop().run_until_idle(Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn test_k_messages_k_callbacks_in_order() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let h = b.register_log_handler(rx, recorder(&seen), None).unwrap();

        let msgs: Vec<String> = (0..50).map(|i| format!("line {i} ünïcode\n")).collect();
        for m in &msgs {
            tx.write_all(m.as_bytes()).unwrap();
        }
        pump(&b);

        assert_eq!(*seen.borrow(), msgs);
        assert_eq!(h.delivered(), 50);
        assert!(h.is_active());
    }

    #[test]
    fn test_split_writes_are_reassembled() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let _h = b.register_log_handler(rx, recorder(&seen), None).unwrap();

        for chunk in ["Serv", "ing 2 dir", "ectories\nShut", "down\n"] {
            tx.write_all(chunk.as_bytes()).unwrap();
            pump(&b);
        }
        assert_eq!(*seen.borrow(), vec!["Serving 2 directories\n", "Shutdown\n"]);
    }

    #[test]
    fn test_burst_larger_than_buffer_is_not_truncated() {
        let b = bridge(16);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let _h = b.register_log_handler(rx, recorder(&seen), None).unwrap();

        let long = format!("{}\n", "x".repeat(100));
        let burst = format!("{long}short\n{long}");
        tx.write_all(burst.as_bytes()).unwrap();
        pump(&b);

        assert_eq!(*seen.borrow(), vec![long.clone(), "short\n".to_string(), long]);
    }

    #[test]
    fn test_remove_stops_delivery() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let h = b.register_log_handler(rx, recorder(&seen), None).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.event_loop().len(), 1);

        assert!(b.remove_log_handler(&h));
        assert!(!b.remove_log_handler(&h));
        assert!(b.is_empty());
        assert!(b.event_loop().is_empty());

        tx.write_all(b"after removal\n").unwrap();
        pump(&b);
        assert!(h.drain() == 0);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_end_of_stream_flushes_tail_and_deactivates() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let seen: Seen = Rc::default();
        let h = b.register_log_handler(rx, recorder(&seen), None).unwrap();

        {
            let mut tx = File::from(tx);
            tx.write_all(b"one\ntwo").unwrap();
        }
        pump(&b);

        assert_eq!(*seen.borrow(), vec!["one\n", "two"]);
        assert!(!h.is_active());
        assert!(b.is_empty());
        assert!(b.event_loop().is_empty());
        assert!(!h.remove());
    }

    #[test]
    fn test_drain_delivers_without_event_loop() {
        let b = bridge(8);
        let (rx, tx) = pipe().unwrap();
        let seen: Seen = Rc::default();
        let h = b.register_log_handler(rx, recorder(&seen), None).unwrap();
        {
            let mut tx = File::from(tx);
            tx.write_all(b"final words\nbye\n").unwrap();
        }
        assert_eq!(h.drain(), 2);
        assert_eq!(*seen.borrow(), vec!["final words\n", "bye\n"]);
        assert!(!h.is_active());
    }

    #[test]
    fn test_callback_failures_are_contained() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let s = seen.clone();
        let h = b
            .register_log_handler(
                rx,
                move |_h, msg, _u| {
                    match msg {
                        "err\n" => return Err("callback refused".into()),
                        "panic\n" => panic!("callback blew up"),
                        _ => s.borrow_mut().push(msg.to_string()),
                    }
                    Ok(())
                },
                None,
            )
            .unwrap();

        tx.write_all(b"a\nerr\npanic\nb\n").unwrap();
        pump(&b);

        assert_eq!(*seen.borrow(), vec!["a\n", "b\n"]);
        assert_eq!(h.delivered(), 2);
        assert_eq!(h.callback_failures(), 2);
        assert!(h.is_active());
    }

    #[test]
    fn test_reentrant_pump_is_skipped() {
        let b = bridge(4);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let (s, ev) = (seen.clone(), b.event_loop().clone());
        let _h = b
            .register_log_handler(
                rx,
                move |_h, msg, _u| {
                    // Pumping from inside the callback must not nest
                    ev.run_once(Some(Duration::ZERO)).unwrap();
                    s.borrow_mut().push(msg.to_string());
                    Ok(())
                },
                None,
            )
            .unwrap();

        tx.write_all(b"abc\ndef\nghi\n").unwrap();
        pump(&b);
        assert_eq!(*seen.borrow(), vec!["abc\n", "def\n", "ghi\n"]);
    }

    #[test]
    fn test_user_data_reaches_callback_and_is_released() {
        struct Marker(Rc<Cell<bool>>);
        impl Drop for Marker {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let dropped = Rc::new(Cell::new(false));
        let hits = Rc::new(Cell::new(0));
        let hc = hits.clone();
        let h = b
            .register_log_handler(
                rx,
                move |_h, _msg, user| {
                    assert!(user.is_some_and(|u| u.is::<Marker>()));
                    hc.set(hc.get() + 1);
                    Ok(())
                },
                Some(Box::new(Marker(dropped.clone()))),
            )
            .unwrap();

        tx.write_all(b"x\n").unwrap();
        pump(&b);
        assert_eq!(hits.get(), 1);
        assert!(!dropped.get());

        h.remove();
        assert!(dropped.get());
    }

    #[test]
    fn test_callback_removing_itself_stops_batch() {
        let b = bridge(4096);
        let (rx, tx) = pipe().unwrap();
        let mut tx = File::from(tx);
        let seen: Seen = Rc::default();
        let s = seen.clone();
        let h = b
            .register_log_handler(
                rx,
                move |me, msg, _u| {
                    s.borrow_mut().push(msg.to_string());
                    me.remove();
                    Ok(())
                },
                None,
            )
            .unwrap();

        tx.write_all(b"first\nsecond\n").unwrap();
        pump(&b);
        assert_eq!(*seen.borrow(), vec!["first\n"]);
        assert!(!h.is_active());
        assert!(b.is_empty());
    }

    #[test]
    fn test_dropping_last_ref_deregisters() {
        let b = bridge(4096);
        let (rx, _tx) = pipe().unwrap();
        let h = b.register_log_handler(rx, |_h, _m, _u| Ok(()), None).unwrap();
        let other = h.clone();
        drop(h);
        assert_eq!(b.len(), 1);
        drop(other);
        assert!(b.is_empty());
        assert!(b.event_loop().is_empty());
    }

    #[test]
    fn test_handlers_listed_newest_first() {
        let b = bridge(4096);
        let (rx1, _tx1) = pipe().unwrap();
        let (rx2, _tx2) = pipe().unwrap();
        let h1 = b.register_log_handler(rx1, |_h, _m, _u| Ok(()), None).unwrap();
        let quiet: LogCallback =
            Box::new(|_h: &LogHandlerRef, _m: &str, _u: Option<&dyn Any>| -> Result<(), Box<dyn Error>> { Ok(()) });
        let h2 = b.attach(42, rx2, quiet, None).unwrap();

        let ids: Vec<u64> = b.handlers().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![h2.id(), h1.id()]);
        assert_eq!(b.handler_for(42).map(|i| i.id), Some(h2.id()));
        assert_eq!(h2.server(), Some(42));
        assert!(b.handler_for(7).is_none());
    }
}
