//! Tap detection and action dispatch.
//!
//! A tap is a press immediately followed by a release of the same key, with
//! no other key held concurrently and within the keyboard repeat delay. The
//! detector consumes the listener's event stream, recognizes taps, and runs
//! the assigned action sequences through the layouter and emitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::actions::{self, Action, Assignments};
use crate::backend::{Emitter, Layouter, Listener};
use crate::keys::{KeyCode, KeyEvent, KeyRange, KeyState};

/// Substitute when the layouter cannot report the session's repeat delay.
pub const DEFAULT_REPEAT_DELAY_MS: u64 = 500;

struct TapState {
    /// Pressed flag per key code; indexed only after a range check.
    pressed: Vec<bool>,
    pressed_count: u32,
    /// Candidate for a tap: the most recently pressed key, or `NONE` once
    /// this hold can no longer resolve to a tap.
    last_key: KeyCode,
    pressed_at: u64,
}

struct Shared {
    listener: Arc<dyn Listener>,
    layouter: Arc<dyn Layouter>,
    emitter: Arc<dyn Emitter>,
    assignments: Assignments,
    key_range: KeyRange,
    repeat_delay: u64,
    show_taps: bool,
    /// Written by the layouter's notification thread, read by the listener
    /// thread. Advisory: a tap evaluated one event late is acceptable.
    session_active: AtomicBool,
    /// Mutated only from the single listener thread; the mutex makes the
    /// cross-thread handoff of the handler sound and is never contended.
    state: Mutex<TapState>,
}

/// The per-run tap detector. Owns the three collaborators for the duration
/// of a run.
pub struct Tapper {
    listener: Arc<dyn Listener>,
    layouter: Arc<dyn Layouter>,
    emitter: Arc<dyn Emitter>,
    key_range: KeyRange,
    repeat_delay: u64,
    shared: Option<Arc<Shared>>,
}

impl Tapper {
    pub fn new(
        listener: Arc<dyn Listener>,
        layouter: Arc<dyn Layouter>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        let mut repeat_delay = layouter.repeat_delay_ms();
        if repeat_delay == 0 {
            repeat_delay = DEFAULT_REPEAT_DELAY_MS;
        }
        log::info!("repeat delay: {repeat_delay} ms");
        let key_range = listener.key_range();
        Tapper {
            listener,
            layouter,
            emitter,
            key_range,
            repeat_delay,
            shared: None,
        }
    }

    /// Starts emitter, layouter, then listener. The emitter is pre-registered
    /// with every key the assignments may ever emit. The session-active flag
    /// starts false; the layouter reports the real state once running.
    pub fn start(&mut self, assignments: Assignments, bell: bool, show_taps: bool) -> Result<()> {
        assert!(self.shared.is_none(), "tapper already started");

        let emit_keys = actions::emitted_keys(&assignments);
        self.emitter.start(&emit_keys)?;

        let shared = Arc::new(Shared {
            listener: self.listener.clone(),
            layouter: self.layouter.clone(),
            emitter: self.emitter.clone(),
            assignments,
            key_range: self.key_range,
            repeat_delay: self.repeat_delay,
            show_taps,
            session_active: AtomicBool::new(false),
            state: Mutex::new(TapState {
                pressed: vec![false; usize::from(self.key_range.max) + 1],
                pressed_count: 0,
                last_key: KeyCode::NONE,
                pressed_at: 0,
            }),
        });

        let s = shared.clone();
        self.layouter.start(
            bell,
            Box::new(move |active| s.session_active.store(active, Ordering::Release)),
        )?;

        let s = shared.clone();
        self.listener.start(Box::new(move |event| s.on_event(event)))?;

        self.shared = Some(shared);
        Ok(())
    }

    /// Stops listener, layouter, then emitter, in that order. Each stop is
    /// synchronous, so no event can arrive once this returns.
    pub fn stop(&mut self) -> Result<()> {
        if self.shared.take().is_some() {
            self.listener.stop()?;
            self.layouter.stop()?;
            self.emitter.stop()?;
        }
        Ok(())
    }
}

impl Shared {
    fn on_event(&self, event: KeyEvent) {
        if !self.key_range.contains(event.key) {
            log::warn!(
                "listener reported key {} out of expected range {}",
                event.key,
                self.key_range
            );
            return;
        }
        let mut st = self.state.lock();
        let idx = usize::from(event.key.0);
        match event.state {
            KeyState::Pressed => {
                if st.pressed[idx] {
                    // Autorepeat, or the same key seen through a second
                    // device. Either way this hold is not a tap any more.
                    log::debug!("{}v ~{}", st.pressed_count, event.key);
                    st.last_key = KeyCode::NONE;
                } else {
                    log::debug!("{}v +{}", st.pressed_count, event.key);
                    st.pressed[idx] = true;
                    st.pressed_count += 1;
                    st.last_key = event.key;
                    st.pressed_at = event.time_ms;
                }
            }
            KeyState::Released => {
                log::debug!("{}v -{}", st.pressed_count, event.key);
                // The key may not be tracked: the first event after startup
                // is commonly the release of the Enter that launched us.
                if st.pressed[idx] {
                    st.pressed[idx] = false;
                    st.pressed_count -= 1;
                }
                let tapped = event.key == st.last_key
                    && st.pressed_count == 0
                    && event.time_ms.saturating_sub(st.pressed_at) <= self.repeat_delay;
                st.last_key = KeyCode::NONE;
                drop(st);
                if tapped {
                    self.on_tap(event.key);
                }
            }
        }
    }

    fn on_tap(&self, key: KeyCode) {
        log::debug!("tap on {key}");
        if self.show_taps {
            println!("Key {} tapped.", self.listener.key_full_name(key));
            return;
        }
        if !self.session_active.load(Ordering::Acquire) {
            // A system-wide listener sees every session's keystrokes; only
            // act on taps made in ours.
            log::debug!("session inactive, tap dropped");
            return;
        }
        let Some(actions) = self.assignments.get(&key) else {
            return;
        };
        for action in actions {
            log::debug!("executing action {action}");
            // Dispatch failures must not stop the event loop; a layouter can
            // fail transiently while the desktop shell restarts.
            match action {
                Action::None => {}
                Action::ActivateLayout(layout) => {
                    if let Err(e) = self.layouter.activate(*layout) {
                        log::warn!("can't activate layout {layout}: {e:#}");
                    }
                }
                Action::EmitKeyTap(key) => {
                    let burst = [(*key, KeyState::Pressed), (*key, KeyState::Released)];
                    if let Err(e) = self.emitter.emit(&burst) {
                        log::warn!("can't emit tap on key {key}: {e:#}");
                    }
                }
            }
        }
    }
}
