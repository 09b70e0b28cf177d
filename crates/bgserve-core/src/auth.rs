//! Auth command wire format and the host-side key mirror
//!
//! Commands travel as ASCII lines over the auth channel:
//!
//! ```text
//! ADD:<key>\n
//! REMOVE:<key>\n
//! CLEAR\n
//! ```
//!
//! Keys never contain a line break. A `:` inside a key needs no escaping
//! because only the first `:` separates the action.
//!
//! The authoritative key set lives in the embedded runtime. The host keeps
//! a [`KeyMirror`] that applies the same commands locally. Nothing is
//! acknowledged, so the mirror is a best-effort view.

use core::fmt;
use std::str::FromStr;

use crate::error::{ServeError, ServeResult};

/// What to do with a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Add,
    Remove,
    Clear,
}

impl AuthAction {
    /// Uppercase wire name
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Add => "ADD",
            AuthAction::Remove => "REMOVE",
            AuthAction::Clear => "CLEAR",
        }
    }
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthAction {
    type Err = ServeError;

    /// Case-insensitive, so `"add"` from an embedder works too
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Ok(AuthAction::Add),
            "REMOVE" => Ok(AuthAction::Remove),
            "CLEAR" => Ok(AuthAction::Clear),
            other => Err(ServeError::InvalidConfig(format!(
                "unknown auth action {other:?}, expected add, remove or clear"
            ))),
        }
    }
}

/// One command on the auth channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthCommand {
    Add(String),
    Remove(String),
    Clear,
}

/// Keys must be non-empty and fit on one line
pub fn validate_key(key: &str) -> ServeResult<()> {
    if key.is_empty() || key.contains(|c| c == '\n' || c == '\r') {
        return Err(ServeError::InvalidAuthKey(key.to_string()));
    }
    Ok(())
}

impl AuthCommand {
    /// Build a command, validating `key` for `Add`/`Remove`.
    /// The key is ignored for `Clear`.
    pub fn new(action: AuthAction, key: &str) -> ServeResult<Self> {
        match action {
            AuthAction::Add => validate_key(key).map(|_| AuthCommand::Add(key.to_string())),
            AuthAction::Remove => validate_key(key).map(|_| AuthCommand::Remove(key.to_string())),
            AuthAction::Clear => Ok(AuthCommand::Clear),
        }
    }

    pub fn action(&self) -> AuthAction {
        match self {
            AuthCommand::Add(_) => AuthAction::Add,
            AuthCommand::Remove(_) => AuthAction::Remove,
            AuthCommand::Clear => AuthAction::Clear,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            AuthCommand::Add(k) | AuthCommand::Remove(k) => Some(k),
            AuthCommand::Clear => None,
        }
    }

    /// Encode as a newline-terminated wire line
    pub fn to_line(&self) -> String {
        match self {
            AuthCommand::Add(k) => format!("ADD:{k}\n"),
            AuthCommand::Remove(k) => format!("REMOVE:{k}\n"),
            AuthCommand::Clear => "CLEAR\n".to_string(),
        }
    }

    /// Decode one wire line, with or without its terminator.
    ///
    /// Accepts `CLEAR` and `CLEAR:`. Returns `None` for anything
    /// malformed; receivers skip such lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        match line.split_once(':') {
            Some(("ADD", key)) if !key.is_empty() => Some(AuthCommand::Add(key.to_string())),
            Some(("REMOVE", key)) if !key.is_empty() => Some(AuthCommand::Remove(key.to_string())),
            Some(("CLEAR", _)) => Some(AuthCommand::Clear),
            None if line == "CLEAR" => Some(AuthCommand::Clear),
            _ => None,
        }
    }
}

/// Insertion-ordered set of keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMirror {
    keys: Vec<String>,
}

impl Default for KeyMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyMirror {
    pub fn new() -> Self {
        Self {
            keys: Vec::with_capacity(4),
        }
    }

    /// Apply a command, returning whether the set changed.
    ///
    /// `Add` is idempotent and `Remove` of an absent key is a no-op.
    pub fn apply(&mut self, cmd: &AuthCommand) -> bool {
        match cmd {
            AuthCommand::Add(key) => {
                if self.contains(key) {
                    false
                } else {
                    self.keys.push(key.clone());
                    true
                }
            }
            AuthCommand::Remove(key) => match self.keys.iter().position(|k| k == key) {
                Some(idx) => {
                    self.keys.remove(idx);
                    true
                }
                None => false,
            },
            AuthCommand::Clear => {
                let changed = !self.keys.is_empty();
                self.keys.clear();
                changed
            }
        }
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}
