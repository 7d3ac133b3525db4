//! tapd: tap a key to switch keyboard layouts or send keystrokes.
//!
//! A tap is a press-then-quick-release of a single key with no other key
//! held. Taps on assigned keys trigger actions: activating a keyboard layout
//! or emitting a synthetic keystroke through a virtual device. Because the
//! raw-device backends need elevated ids only for a device open, the whole
//! process runs at least privilege, re-elevating for the narrow duration of
//! each open through [`privs::Privileges`].

pub mod actions;
pub mod backend;
pub mod keys;
pub mod privs;
pub mod settings;
pub mod tapper;

pub use settings::Settings;
pub use tapper::Tapper;
