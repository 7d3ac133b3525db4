//! Raw-device listener built on evdev.
//!
//! Opens every `/dev/input/event*` node that speaks `EV_KEY` (keyboards and
//! mice alike) and watches them with one poll loop on a dedicated thread.
//! The devices are never grabbed: tapd observes input, it does not intercept
//! it. Opening the nodes needs the "input" group, so the opens run inside
//! the privilege manager's `do_as_input` scope.

use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use evdev::{Device, EventType};
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::{EventHandler, Listener, ListenerKind};
use crate::keys::{self, KeyCode, KeyEvent, KeyRange, KeyState};
use crate::privs::privileges;

const WAKER: Token = Token(usize::MAX);

pub struct EvdevListener {
    running: Mutex<Option<Running>>,
}

struct Running {
    waker: Waker,
    join: JoinHandle<()>,
}

impl EvdevListener {
    pub fn new() -> Self {
        EvdevListener {
            running: Mutex::new(None),
        }
    }
}

impl Default for EvdevListener {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens all key-capable input devices. Individual open failures are logged
/// and skipped; a device node may belong to something we cannot or need not
/// read.
fn open_devices() -> Result<Vec<(PathBuf, Device)>> {
    let mut devices = Vec::new();
    let entries = std::fs::read_dir("/dev/input").context("can't list /dev/input")?;
    for entry in entries {
        let path = entry.context("can't list /dev/input")?.path();
        let is_event_node = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("event"));
        if !is_event_node {
            continue;
        }
        match Device::open(&path) {
            Ok(device) => {
                if device.supported_events().contains(EventType::KEY) {
                    log::debug!(
                        "listening to {} ({})",
                        path.display(),
                        device.name().unwrap_or("unnamed")
                    );
                    devices.push((path, device));
                } else {
                    log::trace!("{} has no keys, skipped", path.display());
                }
            }
            Err(e) => log::warn!("can't open {}: {e}", path.display()),
        }
    }
    Ok(devices)
}

impl Listener for EvdevListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Evdev
    }

    fn key_range(&self) -> KeyRange {
        keys::key_range()
    }

    fn key_name(&self, key: KeyCode) -> Option<String> {
        keys::key_name(key)
    }

    fn key_by_name(&self, name: &str) -> Option<KeyCode> {
        keys::key_by_name(name)
    }

    fn start(&self, mut on_event: EventHandler) -> Result<()> {
        let mut running = self.running.lock();
        assert!(running.is_none(), "listener already started");

        let mut devices = privileges().do_as_input(open_devices)?;
        if devices.is_empty() {
            bail!(
                "no readable input devices found; is tapd in the \"input\" group?"
            );
        }

        let poll = Poll::new().context("can't create poll")?;
        let waker = Waker::new(poll.registry(), WAKER).context("can't create waker")?;
        for (i, (_, device)) in devices.iter().enumerate() {
            let fd = device.as_raw_fd();
            poll.registry()
                .register(&mut SourceFd(&fd), Token(i), Interest::READABLE)
                .context("can't register device")?;
        }

        let join = std::thread::Builder::new()
            .name("input-listener".into())
            .spawn(move || listen_loop(poll, &mut devices, &mut on_event))
            .context("can't spawn the listener thread")?;

        *running = Some(Running { waker, join });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        running.waker.wake().context("can't wake the listener")?;
        if running.join.join().is_err() {
            bail!("the listener thread panicked");
        }
        Ok(())
    }
}

fn listen_loop(mut poll: Poll, devices: &mut [(PathBuf, Device)], on_event: &mut EventHandler) {
    let mut events = Events::with_capacity(32);
    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("poll failed: {e}");
            break;
        }
        for poll_event in &events {
            if poll_event.token() == WAKER {
                break 'outer;
            }
            let (path, device) = &mut devices[poll_event.token().0];
            let fetched = match device.fetch_events() {
                Ok(fetched) => fetched,
                Err(e) => {
                    // Unplugged devices stay registered but dead; tapd does
                    // not rescan until restarted.
                    log::warn!("can't read {}: {e}", path.display());
                    continue;
                }
            };
            for input in fetched {
                if input.event_type() != EventType::KEY {
                    continue;
                }
                let state = match input.value() {
                    0 => KeyState::Released,
                    // The kernel reports autorepeat as value 2; the tap
                    // detector treats a duplicate press as exactly that.
                    1 | 2 => KeyState::Pressed,
                    other => {
                        log::trace!("odd key value {other}, ignored");
                        continue;
                    }
                };
                let time_ms = input
                    .timestamp()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                on_event(KeyEvent {
                    time_ms,
                    key: KeyCode(input.code()),
                    state,
                });
            }
        }
    }
}
