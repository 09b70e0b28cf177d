//! Host side of the auth channel
//!
//! Two tiers: the embedded runtime holds the authoritative key set, the
//! host holds a [`KeyMirror`] updated with every command it sends. Sends
//! are fire-and-forget but never lossy while the runtime has the pipe
//! open: a full pipe makes the sender wait for the reader. Only a failed
//! write (the runtime closed its end) drops the channel and flips the
//! status to `Broken`; from then on only the mirror changes.
//!
//! Before the worker exists nothing reads the pipe, so [`AuthContext::prime`]
//! writes what fits and keeps the rest in a backlog that
//! [`AuthContext::flush`] sends once the worker runs.

use bgserve_core::auth::{self, AuthCommand, KeyMirror};
use bgserve_core::error::ServeResult;
use bgserve_core::state::AuthStatus;
use tracing::{debug, trace, warn};

use crate::channel::CommandSender;

pub struct AuthContext {
    server: u64,
    sender: Option<CommandSender>,
    /// Encoded commands not yet written, in order
    backlog: Vec<u8>,
    mirror: KeyMirror,
    broken: bool,
}

impl AuthContext {
    pub fn new(server: u64, sender: CommandSender) -> Self {
        Self {
            server,
            sender: Some(sender),
            backlog: Vec::new(),
            mirror: KeyMirror::new(),
            broken: false,
        }
    }

    /// Mirror-only context with no channel behind it
    pub fn detached(server: u64) -> Self {
        Self {
            server,
            sender: None,
            backlog: Vec::new(),
            mirror: KeyMirror::new(),
            broken: true,
        }
    }

    /// Send `cmd` if the channel is open, then update the mirror regardless.
    ///
    /// Waits while the pipe is full.
    pub fn apply(&mut self, cmd: &AuthCommand) -> AuthStatus {
        self.enqueue(cmd);
        self.flush()
    }

    /// `ADD` every key. Empty keys are skipped; a key with a line break
    /// rejects the whole batch before anything is sent.
    pub fn seed<I, K>(&mut self, keys: I) -> ServeResult<AuthStatus>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.prime(keys)?;
        Ok(self.flush())
    }

    /// Like `seed`, without waiting: what does not fit in the pipe stays
    /// in the backlog until `flush`.
    pub fn prime<I, K>(&mut self, keys: I) -> ServeResult<AuthStatus>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<K> = keys.into_iter().filter(|k| !k.as_ref().is_empty()).collect();
        for k in &keys {
            auth::validate_key(k.as_ref())?;
        }
        for k in &keys {
            self.enqueue(&AuthCommand::Add(k.as_ref().to_string()));
        }
        Ok(self.status())
    }

    /// Write the backlog, waiting for the reader as needed
    pub fn flush(&mut self) -> AuthStatus {
        if self.backlog.is_empty() {
            return self.status();
        }
        if let Some(sender) = &self.sender {
            match sender.send_all(&self.backlog) {
                Ok(()) => debug!(server = self.server, bytes = self.backlog.len(), "auth backlog flushed"),
                Err(e) => self.degrade(&e),
            }
        }
        self.backlog.clear();
        self.status()
    }

    /// Bytes accepted but not yet written to the pipe
    #[inline]
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// The mirror; the runtime may disagree if the channel broke
    pub fn keys(&self) -> Vec<String> {
        self.mirror.keys().to_vec()
    }

    pub fn status(&self) -> AuthStatus {
        if self.broken {
            AuthStatus::Broken
        } else {
            AuthStatus::Synced
        }
    }

    /// Close the channel; the mirror stays readable
    pub fn detach(&mut self) {
        self.backlog.clear();
        if self.sender.take().is_some() {
            self.broken = true;
        }
    }

    /// Mirror `cmd` and write it now if nothing is queued ahead of it
    fn enqueue(&mut self, cmd: &AuthCommand) {
        if let Some(sender) = &self.sender {
            let line = cmd.to_line();
            let taken = if self.backlog.is_empty() {
                sender.try_send(line.as_bytes())
            } else {
                Ok(0)
            };
            match taken {
                Ok(n) => {
                    self.backlog.extend_from_slice(&line.as_bytes()[n..]);
                    trace!(server = self.server, action = %cmd.action(), queued = line.len() - n, "auth command sent");
                }
                Err(e) => self.degrade(&e),
            }
        }
        self.mirror.apply(cmd);
    }

    fn degrade(&mut self, e: &std::io::Error) {
        warn!(
            server = self.server,
            error = %e,
            "auth channel broken, keeping local mirror only"
        );
        self.sender = None;
        self.backlog.clear();
        self.broken = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe;
    use std::fs::File;
    use std::io::Read;

    fn context() -> (AuthContext, File) {
        let (rx, tx) = pipe().unwrap();
        let ctx = AuthContext::new(1, CommandSender::new(tx).unwrap());
        (ctx, File::from(rx))
    }

    fn read_all(ctx: AuthContext, mut rx: File) -> String {
        drop(ctx);
        let mut text = String::new();
        rx.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn test_commands_are_sent_and_mirrored() {
        let (mut ctx, rx) = context();
        assert_eq!(ctx.apply(&AuthCommand::Add("k1".into())), AuthStatus::Synced);
        ctx.apply(&AuthCommand::Add("k1".into()));
        ctx.apply(&AuthCommand::Add("k2".into()));
        ctx.apply(&AuthCommand::Remove("k1".into()));
        assert_eq!(ctx.keys(), vec!["k2".to_string()]);
        ctx.apply(&AuthCommand::Clear);
        assert!(ctx.keys().is_empty());

        // Every command goes on the wire, even the redundant ADD
        assert_eq!(
            read_all(ctx, rx),
            "ADD:k1\nADD:k1\nADD:k2\nREMOVE:k1\nCLEAR\n"
        );
    }

    #[test]
    fn test_broken_channel_degrades_to_mirror() {
        crate::signal::ignore_sigpipe();
        let (mut ctx, rx) = context();
        drop(rx);

        assert_eq!(ctx.apply(&AuthCommand::Add("k".into())), AuthStatus::Broken);
        assert_eq!(ctx.keys(), vec!["k".to_string()]);
        assert_eq!(ctx.apply(&AuthCommand::Remove("k".into())), AuthStatus::Broken);
        assert!(ctx.keys().is_empty());
    }

    #[test]
    fn test_seed_skips_empty_and_rejects_multiline() {
        let (mut ctx, rx) = context();
        assert!(ctx.seed(["a", "bad\nkey"]).is_err());
        assert!(ctx.keys().is_empty());

        assert_eq!(ctx.seed(["a", "", "b"]).unwrap(), AuthStatus::Synced);
        assert_eq!(ctx.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(read_all(ctx, rx), "ADD:a\nADD:b\n");
    }

    fn many_keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i:06}")).collect()
    }

    #[test]
    fn test_burst_to_slow_reader_stays_synced() {
        let (mut ctx, rx) = context();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            let mut rx = rx;
            let mut text = String::new();
            rx.read_to_string(&mut text).unwrap();
            text
        });

        let keys = many_keys(8000);
        for k in &keys {
            assert_eq!(ctx.apply(&AuthCommand::Add(k.clone())), AuthStatus::Synced);
        }
        assert_eq!(ctx.keys().len(), 8000);
        drop(ctx);

        let text = reader.join().unwrap();
        let sent: Vec<&str> = text.lines().collect();
        assert_eq!(sent.len(), 8000);
        assert_eq!(sent[7999], "ADD:key-007999");
    }

    #[test]
    fn test_prime_beyond_pipe_capacity_keeps_backlog() {
        let (mut ctx, rx) = context();
        // ~120 KiB of ADD lines, nobody reading yet
        let keys = many_keys(8000);
        assert_eq!(ctx.prime(&keys).unwrap(), AuthStatus::Synced);
        assert!(ctx.pending() > 0);
        assert_eq!(ctx.keys().len(), 8000);

        // Later commands queue behind the backlog
        let reader = std::thread::spawn(move || {
            let mut rx = rx;
            let mut text = String::new();
            rx.read_to_string(&mut text).unwrap();
            text
        });
        assert_eq!(ctx.apply(&AuthCommand::Remove("key-000000".into())), AuthStatus::Synced);
        assert_eq!(ctx.pending(), 0);
        drop(ctx);

        let text = reader.join().unwrap();
        let sent: Vec<&str> = text.lines().collect();
        assert_eq!(sent.len(), 8001);
        assert_eq!(sent[0], "ADD:key-000000");
        assert_eq!(sent[8000], "REMOVE:key-000000");
    }

    #[test]
    fn test_detach_keeps_mirror() {
        let (mut ctx, _rx) = context();
        ctx.apply(&AuthCommand::Add("k".into()));
        ctx.detach();
        assert_eq!(ctx.status(), AuthStatus::Broken);
        assert_eq!(ctx.keys(), vec!["k".to_string()]);

        let mut mirror_only = AuthContext::detached(2);
        mirror_only.apply(&AuthCommand::Add("x".into()));
        assert_eq!(mirror_only.keys(), vec!["x".to_string()]);
    }
}
