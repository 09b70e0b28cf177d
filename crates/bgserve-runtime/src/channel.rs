//! Pipes between the host and a worker
//!
//! Every service owns three unidirectional pipes:
//!
//! - shutdown: host writes one sentinel byte, runtime wakes and stops
//! - log: runtime writes lines, host drains them on its dispatch thread
//! - auth: host writes command lines, runtime applies them
//!
//! Host-side ends are non-blocking. The shutdown sender never waits. The
//! command sender waits for room while the runtime still has the pipe open
//! and fails only once it is closed. Both ends are close-on-exec.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use bgserve_core::constants::SHUTDOWN_SENTINEL;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;

/// Create a close-on-exec pipe, `(read_end, write_end)`
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

/// Put `fd` in non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Wait until `fd` is readable (or hung up), up to `timeout`.
///
/// `None` waits forever. Returns false on timeout.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    wait_for(fd, libc::POLLIN, timeout)
}

/// Wait until `fd` has room for a write (or the reader is gone)
pub fn wait_writable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    wait_for(fd, libc::POLLOUT, timeout)
}

fn wait_for(fd: BorrowedFd<'_>, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, poll_timeout(timeout)) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

/// Milliseconds for `poll(2)`, rounding up so short waits still wait
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Host side of the shutdown channel
#[derive(Debug)]
pub struct SignalSender {
    file: File,
}

impl SignalSender {
    /// Wrap a write end, switching it to non-blocking
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { file: File::from(fd) })
    }

    /// Write the sentinel byte.
    ///
    /// A full pipe means a sentinel is already pending, so `EAGAIN` counts
    /// as success. `EPIPE` means the runtime already closed its end;
    /// callers treat that as harmless.
    pub fn signal(&self) -> io::Result<()> {
        loop {
            match (&self.file).write(&[SHUTDOWN_SENTINEL]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for SignalSender {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Create a shutdown channel: `(runtime read end, host sender)`
pub fn signal_channel() -> io::Result<(OwnedFd, SignalSender)> {
    let (rx, tx) = pipe()?;
    Ok((rx, SignalSender::new(tx)?))
}

/// Host side of a line-oriented command stream
#[derive(Debug)]
pub struct CommandSender {
    file: File,
}

impl CommandSender {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { file: File::from(fd) })
    }

    /// Write what fits without waiting. Returns the number of bytes taken.
    pub fn try_send(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match (&self.file).write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Write all of `bytes`, waiting for the reader whenever the pipe is
    /// full. Fails only when the pipe is closed (`EPIPE`) or unusable.
    pub fn send_all(&self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let n = self.try_send(bytes)?;
            bytes = &bytes[n..];
            if !bytes.is_empty() {
                wait_writable(self.file.as_fd(), None)?;
            }
        }
        Ok(())
    }

    /// Write one complete line
    #[inline]
    pub fn send_line(&self, line: &str) -> io::Result<()> {
        self.send_all(line.as_bytes())
    }
}

/// Splits a byte stream into newline-terminated lines
///
/// Bytes after the last newline are carried into the next `push`. A carry
/// that reaches `max_line` bytes is flushed as one unterminated chunk.
#[derive(Debug)]
pub struct LineBuffer {
    carry: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            carry: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Feed `bytes`, calling `emit` once per complete line (newline included)
    pub fn push<F: FnMut(&[u8])>(&mut self, mut bytes: &[u8], mut emit: F) {
        while let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            let (line, rest) = bytes.split_at(pos + 1);
            if self.carry.is_empty() {
                emit(line);
            } else {
                self.carry.extend_from_slice(line);
                emit(&self.carry);
                self.carry.clear();
            }
            bytes = rest;
        }
        self.carry.extend_from_slice(bytes);
        while self.carry.len() >= self.max_line {
            let chunk: Vec<u8> = self.carry.drain(..self.max_line).collect();
            emit(&chunk);
        }
    }

    /// Emit whatever is left, at end of stream
    pub fn finish<F: FnMut(&[u8])>(&mut self, mut emit: F) {
        if !self.carry.is_empty() {
            emit(&self.carry);
            self.carry.clear();
        }
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Read;

    fn collect(buf: &mut LineBuffer, input: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        buf.push(input, |l| out.push(String::from_utf8_lossy(l).into_owned()));
        out
    }

    #[test]
    fn test_signal_is_readable_by_runtime() {
        let (rx, tx) = signal_channel().unwrap();
        assert!(!wait_readable(rx.as_fd(), Some(Duration::ZERO)).unwrap());

        tx.signal().unwrap();
        assert!(wait_readable(rx.as_fd(), Some(Duration::from_secs(1))).unwrap());

        let mut byte = [0u8; 1];
        File::from(rx).read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], SHUTDOWN_SENTINEL);
    }

    #[test]
    fn test_signal_twice_is_harmless() {
        let (_rx, tx) = signal_channel().unwrap();
        tx.signal().unwrap();
        tx.signal().unwrap();
    }

    #[test]
    fn test_signal_after_reader_closed_is_an_error_not_a_crash() {
        crate::signal::ignore_sigpipe();
        let (rx, tx) = signal_channel().unwrap();
        drop(rx);
        let err = tx.signal().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_command_sender_writes_whole_lines() {
        let (rx, tx) = pipe().unwrap();
        let tx = CommandSender::new(tx).unwrap();
        tx.send_line("ADD:k\n").unwrap();
        tx.send_line("CLEAR\n").unwrap();
        drop(tx);

        let mut text = String::new();
        File::from(rx).read_to_string(&mut text).unwrap();
        assert_eq!(text, "ADD:k\nCLEAR\n");
    }

    #[test]
    fn test_command_sender_waits_for_slow_reader() {
        let (rx, tx) = pipe().unwrap();
        let tx = CommandSender::new(tx).unwrap();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut text = String::new();
            File::from(rx).read_to_string(&mut text).unwrap();
            text
        });

        // Several times the pipe capacity
        let line = format!("ADD:{}\n", "k".repeat(300 * 1024));
        tx.send_line(&line).unwrap();
        tx.send_line("CLEAR\n").unwrap();
        drop(tx);

        let text = reader.join().unwrap();
        assert_eq!(text.len(), line.len() + "CLEAR\n".len());
        assert!(text.ends_with("k\nCLEAR\n"));
    }

    #[test]
    fn test_command_sender_try_send_stops_at_full_pipe() {
        let (rx, tx) = pipe().unwrap();
        let tx = CommandSender::new(tx).unwrap();
        let big = vec![b'x'; 1024 * 1024];
        let n = tx.try_send(&big).unwrap();
        assert!(n > 0 && n < big.len());
        assert_eq!(tx.try_send(b"more").unwrap(), 0);
        drop(rx);
    }

    #[test]
    fn test_command_sender_fails_once_reader_closed() {
        crate::signal::ignore_sigpipe();
        let (rx, tx) = pipe().unwrap();
        let tx = CommandSender::new(tx).unwrap();
        drop(rx);
        let err = tx.send_line("ADD:k\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_line_buffer_joins_split_writes() {
        let mut buf = LineBuffer::new(1024);
        assert!(collect(&mut buf, b"hel").is_empty());
        assert_eq!(collect(&mut buf, b"lo\nwor"), vec!["hello\n"]);
        assert_eq!(collect(&mut buf, b"ld\n\nx\n"), vec!["world\n", "\n", "x\n"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_line_buffer_flushes_tail_and_overlong() {
        let mut buf = LineBuffer::new(4);
        assert_eq!(collect(&mut buf, b"abcdefg"), vec!["abcd"]);
        assert_eq!(buf.pending(), 3);

        let mut tail = Vec::new();
        buf.finish(|l| tail.push(l.to_vec()));
        assert_eq!(tail, vec![b"efg".to_vec()]);
        assert_eq!(buf.pending(), 0);
    }

    proptest! {
        #[test]
        fn test_line_buffer_ignores_write_boundaries(
            lines in proptest::collection::vec("[a-z ]{0,20}", 1..12),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let stream: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let bytes = stream.as_bytes();
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();

            let mut buf = LineBuffer::new(1024);
            let mut got = Vec::new();
            for w in points.windows(2) {
                got.extend(collect(&mut buf, &bytes[w[0]..w[1]]));
            }
            let want: Vec<String> = lines.iter().map(|l| format!("{l}\n")).collect();
            prop_assert_eq!(got, want);
            prop_assert_eq!(buf.pending(), 0);
        }
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), -1);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout(Some(Duration::from_micros(10))), 1);
        assert_eq!(poll_timeout(Some(Duration::from_millis(200))), 200);
    }
}
