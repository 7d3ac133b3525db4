//! Backend contracts: listener, layouter, emitter.
//!
//! The tap detector only sees these traits. Concrete backends are selected
//! once at startup from the closed kind enums below; the factory functions
//! also perform the privilege drops that follow from the selection, since a
//! backend that is not going to open privileged device nodes has no business
//! keeping the matching saved id around.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::actions::Layout;
use crate::keys::{KeyCode, KeyEvent, KeyRange, KeySet, KeyState};
use crate::privs::privileges;

pub mod dummy;
pub mod evdev_listener;
pub mod uinput;

pub use dummy::{DummyEmitter, DummyLayouter};
pub use evdev_listener::EvdevListener;
pub use uinput::UinputEmitter;

/// Called by the listener's device thread for every key transition.
pub type EventHandler = Box<dyn FnMut(KeyEvent) + Send>;

/// Called by the layouter whenever the desktop session becomes active or
/// inactive. May be invoked from a layouter-owned thread.
pub type SessionHandler = Box<dyn Fn(bool) + Send + Sync>;

/// Produces the stream of key/button press-release events.
///
/// `start` must deliver events synchronously, one at a time, from a single
/// dedicated thread until `stop` returns; `stop` must join that thread before
/// returning so no event can arrive afterwards.
pub trait Listener: Send + Sync {
    fn kind(&self) -> ListenerKind;
    /// Theoretical range of key codes this listener can report.
    fn key_range(&self) -> KeyRange;
    fn key_name(&self, key: KeyCode) -> Option<String>;
    fn key_by_name(&self, name: &str) -> Option<KeyCode>;
    fn key_full_name(&self, key: KeyCode) -> String {
        match self.key_name(key) {
            Some(name) => format!("{key}:{name}"),
            None => key.to_string(),
        }
    }
    fn start(&self, on_event: EventHandler) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Switches the active keyboard layout and reports desktop-session activity.
pub trait Layouter: Send + Sync {
    fn kind(&self) -> LayouterKind;
    /// The session's keyboard repeat delay in milliseconds, or 0 if unknown.
    fn repeat_delay_ms(&self) -> u64;
    fn start(&self, bell: bool, on_session: SessionHandler) -> Result<()>;
    fn activate(&self, layout: Layout) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Synthesizes key events on a virtual input device.
pub trait Emitter: Send + Sync {
    fn kind(&self) -> EmitterKind;
    /// `keys` is every key code `emit` may ever be asked to send; some
    /// backends must declare them up front when creating the device.
    fn start(&self, keys: &KeySet) -> Result<()>;
    /// Applies the events synchronously as one burst.
    fn emit(&self, events: &[(KeyCode, KeyState)]) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    #[default]
    Auto,
    Evdev,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LayouterKind {
    #[default]
    Auto,
    Dummy,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EmitterKind {
    #[default]
    Auto,
    Dummy,
    Uinput,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ListenerKind::Auto => "auto",
            ListenerKind::Evdev => "evdev",
        })
    }
}

impl fmt::Display for LayouterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            LayouterKind::Auto => "auto",
            LayouterKind::Dummy => "dummy",
        })
    }
}

impl fmt::Display for EmitterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            EmitterKind::Auto => "auto",
            EmitterKind::Dummy => "dummy",
            EmitterKind::Uinput => "uinput",
        })
    }
}

/// Resolves the listener kind and builds the listener. Exactly one listener
/// is created per run; the tap detector relies on that.
pub fn make_listener(kind: ListenerKind) -> Result<Arc<dyn Listener>> {
    let kind = match kind {
        ListenerKind::Auto => ListenerKind::Evdev,
        k => k,
    };
    log::info!("selected listener: {kind}");
    if kind != ListenerKind::Evdev {
        // Only the evdev listener opens /dev/input nodes.
        privileges().drop_input_group()?;
    }
    match kind {
        ListenerKind::Evdev => Ok(Arc::new(EvdevListener::new())),
        ListenerKind::Auto => unreachable!(),
    }
}

pub fn make_layouter(kind: LayouterKind) -> Result<Arc<dyn Layouter>> {
    let kind = match kind {
        LayouterKind::Auto => LayouterKind::Dummy,
        k => k,
    };
    log::info!("selected layouter: {kind}");
    match kind {
        LayouterKind::Dummy => Ok(Arc::new(DummyLayouter::new())),
        LayouterKind::Auto => unreachable!(),
    }
}

/// Resolves the emitter kind and builds the emitter. `emits_keys` tells the
/// auto-selection whether the assignments actually contain key emissions; if
/// they do not, the dummy emitter avoids creating a uinput device for
/// nothing. A non-uinput emitter spends the root reservoir immediately.
pub fn make_emitter(kind: EmitterKind, emits_keys: bool) -> Result<Arc<dyn Emitter>> {
    let kind = match kind {
        EmitterKind::Auto if emits_keys => EmitterKind::Uinput,
        EmitterKind::Auto => EmitterKind::Dummy,
        k => k,
    };
    log::info!("selected emitter: {kind}");
    if kind != EmitterKind::Uinput {
        privileges().drop_root_user()?;
    }
    match kind {
        EmitterKind::Dummy => Ok(Arc::new(DummyEmitter::new())),
        EmitterKind::Uinput => Ok(Arc::new(UinputEmitter::new())),
        EmitterKind::Auto => unreachable!(),
    }
}
