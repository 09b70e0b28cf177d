//! Reference embedded runtime speaking only the pipe protocol
//!
//! `PipeRuntime` serves no HTTP. It does everything else a real runtime
//! does at the boundary: announces its mounts on the log channel, applies
//! auth commands to an authoritative key set, and returns once the
//! shutdown channel becomes readable. It backs the demo binary and the
//! tests, and exposes the authoritative keys so the host mirror can be
//! checked against them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use bgserve_core::auth::{AuthCommand, KeyMirror};
use bgserve_core::runtime::{EmbeddedRuntime, RuntimeResult, ServeParams};
use parking_lot::Mutex;
use tracing::{info, trace};

use crate::channel::{set_nonblocking, LineBuffer};

const AUTH_LINE_MAX: usize = 4096;

/// Embedded runtime that only talks over its three descriptors
#[derive(Debug, Default)]
pub struct PipeRuntime {
    keys: Mutex<HashMap<u64, KeyMirror>>,
}

impl PipeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative keys of `server`, as last applied by its worker.
    /// Kept after the worker exits.
    pub fn remote_keys(&self, server: u64) -> Option<Vec<String>> {
        self.keys.lock().get(&server).map(|m| m.keys().to_vec())
    }

    fn apply(&self, server: u64, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        match AuthCommand::parse_line(&line) {
            Some(cmd) => {
                trace!(server, action = %cmd.action(), "auth command applied");
                self.keys.lock().entry(server).or_default().apply(&cmd);
            }
            None => trace!(server, "malformed auth line ignored"),
        }
    }
}

/// Log destination: the log pipe, the tracing console, or nowhere
struct LogOut {
    server: u64,
    pipe: Option<File>,
    silent: bool,
}

impl LogOut {
    fn line(&mut self, msg: &str) {
        if self.silent {
            return;
        }
        match self.pipe.as_mut() {
            Some(pipe) => {
                if pipe.write_all(format!("{msg}\n").as_bytes()).is_err() {
                    // Host went away; keep serving without logs
                    self.pipe = None;
                }
            }
            None => info!(server = self.server, "{msg}"),
        }
    }
}

/// Auth read end plus its line framing
struct AuthIn {
    file: File,
    lines: LineBuffer,
}

impl AuthIn {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            file: File::from(fd),
            lines: LineBuffer::new(AUTH_LINE_MAX),
        })
    }

    /// Apply everything readable now. Returns false at end of stream.
    fn drain(&mut self, rt: &PipeRuntime, server: u64) -> bool {
        let mut buf = [0u8; 1024];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => self.lines.push(&buf[..n], |l| rt.apply(server, l)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }
}

impl EmbeddedRuntime for PipeRuntime {
    fn serve(&self, params: ServeParams) -> RuntimeResult {
        let server = params.server_id;
        let scheme = params.scheme();
        let mut log = LogOut {
            server,
            pipe: params.log.map(File::from),
            silent: params.silent,
        };
        for m in &params.mounts {
            log.line(&format!(
                "Registered handler for directory {:?} at prefix {:?}",
                m.dir, m.prefix
            ));
        }
        log.line(&format!(
            "Serving {} directories on {}://{}",
            params.mounts.len(),
            scheme,
            params.addr
        ));

        self.keys.lock().entry(server).or_default();
        let mut auth = params.auth.map(AuthIn::new).transpose()?;

        loop {
            let mut pfds = [
                libc::pollfd {
                    fd: params.shutdown.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    // Negative fds are ignored by poll(2)
                    fd: auth.as_ref().map_or(-1, |a| a.file.as_raw_fd()),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            // Commands written before the shutdown signal are applied first
            if pfds[1].revents != 0 {
                if let Some(a) = auth.as_mut() {
                    if !a.drain(self, server) {
                        auth = None;
                    }
                }
            }
            if pfds[0].revents != 0 {
                break;
            }
        }

        if let Some(a) = auth.as_mut() {
            a.drain(self, server);
        }
        log.line("Shutdown signal received, stopping server");
        Ok(())
    }
}
