//! Key emitter built on a uinput virtual device.
//!
//! Creating `/dev/uinput` devices requires root, so the device is built
//! inside the privilege manager's single-use `do_as_root` scope. uinput
//! requires every emittable key to be declared at creation time, which is
//! why [`super::Emitter::start`] takes the full key set up front.

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, EventType, InputEvent, InputId, Key};
use parking_lot::Mutex;

use super::{Emitter, EmitterKind};
use crate::keys::{KeyCode, KeySet, KeyState};
use crate::privs::privileges;

pub struct UinputEmitter {
    device: Mutex<Option<VirtualDevice>>,
}

impl UinputEmitter {
    pub fn new() -> Self {
        UinputEmitter {
            device: Mutex::new(None),
        }
    }
}

impl Default for UinputEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for UinputEmitter {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Uinput
    }

    fn start(&self, keys: &KeySet) -> Result<()> {
        let mut registered = AttributeSet::<Key>::new();
        for key in keys {
            registered.insert(Key(key.0));
        }
        let device = privileges().do_as_root(|| {
            let device = VirtualDeviceBuilder::new()
                .context("can't open /dev/uinput")?
                .name("tapd")
                .input_id(InputId::new(BusType::BUS_USB, 1, 1, 1))
                .with_keys(&registered)
                .context("can't register keys")?
                .build()
                .context("can't create the virtual device")?;
            Ok(device)
        })?;
        log::debug!("virtual device created with {} key(s)", keys.len());
        *self.device.lock() = Some(device);
        Ok(())
    }

    fn emit(&self, events: &[(KeyCode, KeyState)]) -> Result<()> {
        let mut guard = self.device.lock();
        let device = guard.as_mut().context("emitter is not started")?;
        let burst: Vec<InputEvent> = events
            .iter()
            .map(|(key, state)| {
                InputEvent::new(
                    EventType::KEY,
                    key.0,
                    match state {
                        KeyState::Pressed => 1,
                        KeyState::Released => 0,
                    },
                )
            })
            .collect();
        device.emit(&burst).context("can't emit key events")?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        *self.device.lock() = None;
        Ok(())
    }
}
