//! Canonical key codes.
//!
//! tapd uses Linux kernel key codes (the `KEY_*`/`BTN_*` constants from
//! `<linux/input-event-codes.h>`) as its canonical code space. Code 0 is
//! reserved and acts as the "no key" sentinel. Key names are resolved through
//! the evdev crate so tapd carries no name table of its own.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{anyhow, Result};

/// A Linux kernel key or button code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyCode(pub u16);

impl KeyCode {
    /// The "no key" sentinel.
    pub const NONE: KeyCode = KeyCode(0);

    /// Smallest valid key code.
    pub const MIN: u16 = 1;

    /// Largest key code currently defined by the kernel.
    pub const MAX: u16 = 0x2ff;

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive range of key codes a listener can report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub min: u16,
    pub max: u16,
}

impl KeyRange {
    pub fn contains(&self, key: KeyCode) -> bool {
        self.min <= key.0 && key.0 <= self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.min, self.max)
    }
}

/// The full kernel key code range.
pub fn key_range() -> KeyRange {
    KeyRange {
        min: KeyCode::MIN,
        max: KeyCode::MAX,
    }
}

/// Key transition state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyState {
    Released,
    Pressed,
}

/// One key transition as reported by a listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    /// Event time in milliseconds. Only differences matter; the epoch is
    /// whatever the listener's clock uses.
    pub time_ms: u64,
    pub key: KeyCode,
    pub state: KeyState,
}

/// Ordered set of key codes.
pub type KeySet = BTreeSet<KeyCode>;

/// Primary name of a key, e.g. `KEY_CAPSLOCK`, if the code is known to evdev.
pub fn key_name(key: KeyCode) -> Option<String> {
    let name = format!("{:?}", evdev::Key(key.0));
    (name.starts_with("KEY_") || name.starts_with("BTN_")).then_some(name)
}

/// `code:name` for known keys, bare `code` otherwise.
pub fn key_full_name(key: KeyCode) -> String {
    match key_name(key) {
        Some(name) => format!("{}:{}", key.0, name),
        None => key.to_string(),
    }
}

/// Looks a key up by name, case-insensitively, with or without the
/// `KEY_`/`BTN_` prefix.
pub fn key_by_name(name: &str) -> Option<KeyCode> {
    let want = name.to_ascii_uppercase();
    for code in KeyCode::MIN..=KeyCode::MAX {
        let key = KeyCode(code);
        if let Some(full) = key_name(key) {
            if full == want
                || full.strip_prefix("KEY_") == Some(want.as_str())
                || full.strip_prefix("BTN_") == Some(want.as_str())
            {
                return Some(key);
            }
        }
    }
    None
}

/// All key codes evdev has a name for, in code order.
pub fn known_keys() -> KeySet {
    (KeyCode::MIN..=KeyCode::MAX)
        .map(KeyCode)
        .filter(|k| key_name(*k).is_some())
        .collect()
}

/// Parses a key token: a decimal key code or a key name. Out-of-range codes
/// and unknown names are configuration errors.
pub fn parse_key(token: &str) -> Result<KeyCode> {
    let token = token.trim();
    if token.is_empty() {
        return Err(anyhow!("empty key token"));
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        let code: u16 = token
            .parse()
            .map_err(|_| anyhow!("bad key code {token:?}"))?;
        let key = KeyCode(code);
        if !key_range().contains(key) {
            return Err(anyhow!("key code {code} is out of range {}", key_range()));
        }
        return Ok(key);
    }
    key_by_name(token).ok_or_else(|| anyhow!("unknown key name {token:?}"))
}
