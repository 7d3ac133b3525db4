//! Do-nothing layouter and emitter.
//!
//! The dummy layouter satisfies the layouter contract for setups with no
//! layout activations (or no supported desktop IPC): it reports no repeat
//! delay and declares the session permanently active. The dummy emitter
//! swallows bursts with a log line, useful with `--show-taps` and for
//! assignments that only activate layouts.

use anyhow::Result;

use super::{Emitter, EmitterKind, Layouter, LayouterKind, SessionHandler};
use crate::actions::Layout;
use crate::keys::{KeyCode, KeySet, KeyState};

pub struct DummyLayouter;

impl DummyLayouter {
    pub fn new() -> Self {
        DummyLayouter
    }
}

impl Default for DummyLayouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Layouter for DummyLayouter {
    fn kind(&self) -> LayouterKind {
        LayouterKind::Dummy
    }

    fn repeat_delay_ms(&self) -> u64 {
        0
    }

    fn start(&self, bell: bool, on_session: SessionHandler) -> Result<()> {
        if bell {
            log::warn!("the dummy layouter cannot ring the bell");
        }
        // No session IPC to watch, so the session counts as always active.
        on_session(true);
        Ok(())
    }

    fn activate(&self, layout: Layout) -> Result<()> {
        log::info!("dummy layouter: ignoring activation of layout {layout}");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

pub struct DummyEmitter;

impl DummyEmitter {
    pub fn new() -> Self {
        DummyEmitter
    }
}

impl Default for DummyEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for DummyEmitter {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Dummy
    }

    fn start(&self, keys: &KeySet) -> Result<()> {
        if !keys.is_empty() {
            log::debug!("dummy emitter: {} key(s) will not be emitted", keys.len());
        }
        Ok(())
    }

    fn emit(&self, events: &[(KeyCode, KeyState)]) -> Result<()> {
        log::info!("dummy emitter: ignoring a burst of {} event(s)", events.len());
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}
