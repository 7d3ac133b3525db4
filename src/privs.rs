//! Least-privilege management.
//!
//! tapd is usually installed setuid-root and/or setgid-input (or granted
//! `CAP_SETUID`/`CAP_SETGID`) because opening `/dev/input/event*` and
//! `/dev/uinput` needs more than an ordinary user has. The process must
//! nevertheless run with as little privilege as possible at every instant:
//! [`Privileges::init`] demotes the effective ids to the real ones right at
//! startup, parking the elevated ids in the *saved* slots, and the
//! `do_as_input`/`do_as_root` scopes re-acquire them only for the duration of
//! a single device open.
//!
//! Elevation is process-global state, so every operation here serializes on
//! one mutex; two threads can never disagree about the current effective
//! identity. The OS seam is the [`IdentityOps`] trait so the state machine is
//! testable without actually being root.

use std::fmt;

use anyhow::{Context, Result};
use caps::{CapSet, Capability};
use nix::unistd::{self, Gid, Uid};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

const ROOT_UID: u32 = 0;

/// Real, effective and saved ids for one identity class (user or group).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdTriple {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

impl fmt::Display for IdTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.real, self.effective, self.saved)
    }
}

/// OS operations the privilege manager is built on. `None` arguments mean
/// "leave that slot unchanged" (the `setres*id` -1 convention).
pub trait IdentityOps: Send + Sync {
    fn user_ids(&self) -> Result<IdTriple>;
    fn group_ids(&self) -> Result<IdTriple>;
    fn set_user_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()>;
    fn set_group_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()>;
    fn clear_supplementary_groups(&self) -> Result<()>;
    fn has_cap(&self, set: CapSet, cap: Capability) -> bool;
    fn raise_cap(&self, cap: Capability) -> Result<()>;
    fn clear_caps(&self) -> Result<()>;
    fn set_no_new_privs(&self) -> Result<()>;
    /// Gid of the device-access group ("input"), if it exists.
    fn input_group(&self) -> Option<u32>;
}

impl<T: IdentityOps + ?Sized> IdentityOps for std::sync::Arc<T> {
    fn user_ids(&self) -> Result<IdTriple> {
        (**self).user_ids()
    }
    fn group_ids(&self) -> Result<IdTriple> {
        (**self).group_ids()
    }
    fn set_user_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
        (**self).set_user_ids(effective, saved)
    }
    fn set_group_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
        (**self).set_group_ids(effective, saved)
    }
    fn clear_supplementary_groups(&self) -> Result<()> {
        (**self).clear_supplementary_groups()
    }
    fn has_cap(&self, set: CapSet, cap: Capability) -> bool {
        (**self).has_cap(set, cap)
    }
    fn raise_cap(&self, cap: Capability) -> Result<()> {
        (**self).raise_cap(cap)
    }
    fn clear_caps(&self) -> Result<()> {
        (**self).clear_caps()
    }
    fn set_no_new_privs(&self) -> Result<()> {
        (**self).set_no_new_privs()
    }
    fn input_group(&self) -> Option<u32> {
        (**self).input_group()
    }
}

/// The real OS implementation.
pub struct SysIdentity;

impl IdentityOps for SysIdentity {
    fn user_ids(&self) -> Result<IdTriple> {
        let ids = unistd::getresuid().context("getresuid failed")?;
        Ok(IdTriple {
            real: ids.real.as_raw(),
            effective: ids.effective.as_raw(),
            saved: ids.saved.as_raw(),
        })
    }

    fn group_ids(&self) -> Result<IdTriple> {
        let ids = unistd::getresgid().context("getresgid failed")?;
        Ok(IdTriple {
            real: ids.real.as_raw(),
            effective: ids.effective.as_raw(),
            saved: ids.saved.as_raw(),
        })
    }

    fn set_user_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
        // (uid_t)-1 leaves a slot unchanged.
        let keep = Uid::from_raw(u32::MAX);
        unistd::setresuid(
            keep,
            effective.map(Uid::from_raw).unwrap_or(keep),
            saved.map(Uid::from_raw).unwrap_or(keep),
        )
        .context("setresuid failed")?;
        Ok(())
    }

    fn set_group_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
        let keep = Gid::from_raw(u32::MAX);
        unistd::setresgid(
            keep,
            effective.map(Gid::from_raw).unwrap_or(keep),
            saved.map(Gid::from_raw).unwrap_or(keep),
        )
        .context("setresgid failed")?;
        Ok(())
    }

    fn clear_supplementary_groups(&self) -> Result<()> {
        unistd::setgroups(&[]).context("setgroups failed")?;
        Ok(())
    }

    fn has_cap(&self, set: CapSet, cap: Capability) -> bool {
        caps::has_cap(None, set, cap).unwrap_or(false)
    }

    fn raise_cap(&self, cap: Capability) -> Result<()> {
        caps::raise(None, CapSet::Effective, cap)
            .with_context(|| format!("can't raise {cap} to effective"))?;
        Ok(())
    }

    fn clear_caps(&self) -> Result<()> {
        // Effective must stay a subset of permitted, so clear it first.
        caps::clear(None, CapSet::Effective).context("can't clear effective capabilities")?;
        caps::clear(None, CapSet::Permitted).context("can't clear permitted capabilities")?;
        caps::clear(None, CapSet::Inheritable).context("can't clear inheritable capabilities")?;
        Ok(())
    }

    fn set_no_new_privs(&self) -> Result<()> {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("prctl(PR_SET_NO_NEW_PRIVS)");
        }
        Ok(())
    }

    fn input_group(&self) -> Option<u32> {
        unistd::Group::from_name("input")
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }
}

struct State {
    uids: IdTriple,
    gids: IdTriple,
}

/// Mutex-serialized privilege state machine. Once an identity class has been
/// dropped to the real id, nothing here can re-elevate it.
pub struct Privileges<O: IdentityOps> {
    ops: O,
    state: Mutex<State>,
}

impl<O: IdentityOps> Privileges<O> {
    pub fn new(ops: O) -> Result<Self> {
        let uids = ops.user_ids()?;
        let gids = ops.group_ids()?;
        Ok(Privileges {
            ops,
            state: Mutex::new(State { uids, gids }),
        })
    }

    /// Reaches least privilege, keeping re-elevation reservoirs in the saved
    /// id slots: the "input" gid for listener device opens and root for the
    /// uinput device open.
    ///
    /// With `CAP_SETGID`/`CAP_SETUID` the saved ids are set outright and the
    /// supplementary groups are cleared. Without them the process can only
    /// shuffle what the setuid/setgid bits of the binary already provided, so
    /// failures are tolerated here: whether elevation will actually be needed
    /// depends on settings not known yet, and a later scoped elevation simply
    /// finds nothing to elevate to.
    pub fn init(&self) -> Result<()> {
        let mut st = self.state.lock();

        if let Err(e) = self.ops.set_no_new_privs() {
            log::warn!("can't set the no_new_privs bit: {e:#}");
        }

        // Groups first: changing the user may remove the right to change groups.
        let real_gid = st.gids.real;
        if self.ops.has_cap(CapSet::Permitted, Capability::CAP_SETGID) {
            if !self.ops.has_cap(CapSet::Effective, Capability::CAP_SETGID) {
                self.ops.raise_cap(Capability::CAP_SETGID)?;
            }
            self.ops
                .clear_supplementary_groups()
                .context("can't clear supplementary groups")?;
            let saved = match self.ops.input_group() {
                Some(gid) => gid,
                None => {
                    log::warn!("no \"input\" group on this system; raw input devices may be inaccessible");
                    real_gid
                }
            };
            self.set_group_ids(&mut st, Some(real_gid), Some(saved))?;
        } else if let Err(e) = self.set_group_ids(&mut st, Some(real_gid), None) {
            log::debug!("group identity left as-is: {e:#}");
        }

        let real_uid = st.uids.real;
        if self.ops.has_cap(CapSet::Permitted, Capability::CAP_SETUID) {
            if !self.ops.has_cap(CapSet::Effective, Capability::CAP_SETUID) {
                self.ops.raise_cap(Capability::CAP_SETUID)?;
            }
            self.set_user_ids(&mut st, Some(real_uid), Some(ROOT_UID))?;
        } else if let Err(e) = self.set_user_ids(&mut st, Some(real_uid), None) {
            log::debug!("user identity left as-is: {e:#}");
        }

        self.ops.clear_caps()?;

        log::debug!(
            "least privilege reached: uids {}, gids {}",
            st.uids,
            st.gids
        );
        Ok(())
    }

    /// One-way: collapses the group triple to the real gid. Idempotent.
    pub fn drop_input_group(&self) -> Result<()> {
        let mut st = self.state.lock();
        let real = st.gids.real;
        self.set_group_ids(&mut st, Some(real), Some(real))
    }

    /// One-way: collapses the user triple to the real uid. Idempotent.
    pub fn drop_root_user(&self) -> Result<()> {
        let mut st = self.state.lock();
        let real = st.uids.real;
        self.set_user_ids(&mut st, Some(real), Some(real))
    }

    /// Runs `f` with the effective gid swapped to the saved gid, restoring
    /// the effective gid afterwards. The saved gid stays intact: input
    /// devices can be hot-plugged, so this elevation is reusable.
    ///
    /// When there is nothing to elevate to (effective == saved), `f` simply
    /// runs at current privilege; the device open inside it may then fail
    /// with a permission error of its own.
    pub fn do_as_input<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut st = self.state.lock();
        let elevate = st.gids.effective != st.gids.saved;
        if elevate {
            let saved = st.gids.saved;
            self.set_group_ids(&mut st, Some(saved), None)?;
        }
        let out = f();
        if elevate {
            let real = st.gids.real;
            self.set_group_ids(&mut st, Some(real), None)?;
        }
        out
    }

    /// Runs `f` with the effective uid swapped to the saved uid. Unlike
    /// [`Privileges::do_as_input`] this elevation is single-use: afterwards
    /// the saved uid is collapsed to the real uid as well. Root is spent the
    /// moment the one privileged device has been opened.
    pub fn do_as_root<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut st = self.state.lock();
        let elevate = st.uids.effective != st.uids.saved;
        if elevate {
            let saved = st.uids.saved;
            self.set_user_ids(&mut st, Some(saved), None)?;
        }
        let out = f();
        if elevate {
            let real = st.uids.real;
            self.set_user_ids(&mut st, Some(real), Some(real))?;
        }
        out
    }

    /// Runs `f` under the manager's mutex without touching any id: `f` is
    /// guaranteed not to overlap another thread's elevation window.
    pub fn do_as_user<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _st = self.state.lock();
        f()
    }

    /// Current user triple, for diagnostics.
    pub fn user_ids(&self) -> IdTriple {
        self.state.lock().uids
    }

    /// Current group triple, for diagnostics.
    pub fn group_ids(&self) -> IdTriple {
        self.state.lock().gids
    }

    fn set_user_ids(
        &self,
        st: &mut State,
        effective: Option<u32>,
        saved: Option<u32>,
    ) -> Result<()> {
        let want_e = effective.unwrap_or(st.uids.effective);
        let want_s = saved.unwrap_or(st.uids.saved);
        if st.uids.effective != want_e || st.uids.saved != want_s {
            self.ops.set_user_ids(effective, saved)?;
            st.uids.effective = want_e;
            st.uids.saved = want_s;
        }
        Ok(())
    }

    fn set_group_ids(
        &self,
        st: &mut State,
        effective: Option<u32>,
        saved: Option<u32>,
    ) -> Result<()> {
        let want_e = effective.unwrap_or(st.gids.effective);
        let want_s = saved.unwrap_or(st.gids.saved);
        if st.gids.effective != want_e || st.gids.saved != want_s {
            self.ops.set_group_ids(effective, saved)?;
            st.gids.effective = want_e;
            st.gids.saved = want_s;
        }
        Ok(())
    }
}

static PRIVILEGES: Lazy<Privileges<SysIdentity>> = Lazy::new(|| {
    // getresuid/getresgid cannot fail on Linux.
    Privileges::new(SysIdentity).expect("reading process identity")
});

/// The process-wide privilege manager.
pub fn privileges() -> &'static Privileges<SysIdentity> {
    &PRIVILEGES
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const REAL_UID: u32 = 1000;
    const REAL_GID: u32 = 1000;
    const INPUT_GID: u32 = 997;

    struct FakeOps {
        uids: Mutex<IdTriple>,
        gids: Mutex<IdTriple>,
        setuid_cap: bool,
        setgid_cap: bool,
        deny_id_changes: bool,
        set_uid_calls: AtomicUsize,
        set_gid_calls: AtomicUsize,
        groups_cleared: AtomicUsize,
        caps_cleared: AtomicUsize,
    }

    impl FakeOps {
        fn with_caps() -> Self {
            // Plain ids, arbitrary-set capabilities granted.
            Self::new(
                IdTriple {
                    real: REAL_UID,
                    effective: REAL_UID,
                    saved: REAL_UID,
                },
                IdTriple {
                    real: REAL_GID,
                    effective: REAL_GID,
                    saved: REAL_GID,
                },
                true,
            )
        }

        fn setuid_binary() -> Self {
            // `chown root && chmod u+s`, `chgrp input && chmod g+s`.
            Self::new(
                IdTriple {
                    real: REAL_UID,
                    effective: 0,
                    saved: 0,
                },
                IdTriple {
                    real: REAL_GID,
                    effective: INPUT_GID,
                    saved: INPUT_GID,
                },
                false,
            )
        }

        fn new(uids: IdTriple, gids: IdTriple, caps: bool) -> Self {
            FakeOps {
                uids: Mutex::new(uids),
                gids: Mutex::new(gids),
                setuid_cap: caps,
                setgid_cap: caps,
                deny_id_changes: false,
                set_uid_calls: AtomicUsize::new(0),
                set_gid_calls: AtomicUsize::new(0),
                groups_cleared: AtomicUsize::new(0),
                caps_cleared: AtomicUsize::new(0),
            }
        }

        fn snapshot_uids(&self) -> IdTriple {
            *self.uids.lock()
        }
    }

    impl IdentityOps for FakeOps {
        fn user_ids(&self) -> Result<IdTriple> {
            Ok(*self.uids.lock())
        }

        fn group_ids(&self) -> Result<IdTriple> {
            Ok(*self.gids.lock())
        }

        fn set_user_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
            if self.deny_id_changes {
                return Err(anyhow!("EPERM"));
            }
            self.set_uid_calls.fetch_add(1, Ordering::SeqCst);
            let mut ids = self.uids.lock();
            if let Some(e) = effective {
                ids.effective = e;
            }
            if let Some(s) = saved {
                ids.saved = s;
            }
            Ok(())
        }

        fn set_group_ids(&self, effective: Option<u32>, saved: Option<u32>) -> Result<()> {
            if self.deny_id_changes {
                return Err(anyhow!("EPERM"));
            }
            self.set_gid_calls.fetch_add(1, Ordering::SeqCst);
            let mut ids = self.gids.lock();
            if let Some(e) = effective {
                ids.effective = e;
            }
            if let Some(s) = saved {
                ids.saved = s;
            }
            Ok(())
        }

        fn clear_supplementary_groups(&self) -> Result<()> {
            self.groups_cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn has_cap(&self, set: CapSet, cap: Capability) -> bool {
            if matches!(set, CapSet::Effective) {
                // Permitted-but-not-effective, like a file capability grant.
                return false;
            }
            match cap {
                Capability::CAP_SETUID => self.setuid_cap,
                Capability::CAP_SETGID => self.setgid_cap,
                _ => false,
            }
        }

        fn raise_cap(&self, _cap: Capability) -> Result<()> {
            Ok(())
        }

        fn clear_caps(&self) -> Result<()> {
            self.caps_cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_no_new_privs(&self) -> Result<()> {
            Ok(())
        }

        fn input_group(&self) -> Option<u32> {
            Some(INPUT_GID)
        }
    }

    fn manager(ops: FakeOps) -> (Privileges<Arc<FakeOps>>, Arc<FakeOps>) {
        let ops = Arc::new(ops);
        let privs = Privileges::new(ops.clone()).unwrap();
        (privs, ops)
    }

    #[test]
    fn init_with_caps_parks_saved_ids() {
        let (privs, ops) = manager(FakeOps::with_caps());
        privs.init().unwrap();
        assert_eq!(
            privs.user_ids(),
            IdTriple {
                real: REAL_UID,
                effective: REAL_UID,
                saved: 0
            }
        );
        assert_eq!(
            privs.group_ids(),
            IdTriple {
                real: REAL_GID,
                effective: REAL_GID,
                saved: INPUT_GID
            }
        );
        assert_eq!(ops.groups_cleared.load(Ordering::SeqCst), 1);
        assert_eq!(ops.caps_cleared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn init_setuid_binary_demotes_effective_only() {
        let (privs, _ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();
        assert_eq!(
            privs.user_ids(),
            IdTriple {
                real: REAL_UID,
                effective: REAL_UID,
                saved: 0
            }
        );
        assert_eq!(
            privs.group_ids(),
            IdTriple {
                real: REAL_GID,
                effective: REAL_GID,
                saved: INPUT_GID
            }
        );
    }

    #[test]
    fn init_without_any_privilege_is_not_fatal() {
        // Looks like a setuid binary, but the OS refuses every id change
        // (no capability path available). init must tolerate that: whether
        // elevation is needed is not known yet.
        let mut ops = FakeOps::setuid_binary();
        ops.deny_id_changes = true;
        let (privs, ops) = manager(ops);
        privs.init().unwrap();
        // Nothing changed, and the cached triples still tell the truth.
        assert_eq!(ops.snapshot_uids().effective, 0);
        assert_eq!(privs.user_ids().effective, 0);
    }

    #[test]
    fn do_as_root_elevates_once_then_spends_root() {
        let (privs, ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();

        let probe = ops.clone();
        privs
            .do_as_root(move || {
                assert_eq!(probe.snapshot_uids().effective, 0);
                Ok(())
            })
            .unwrap();
        // Root is spent: effective and saved are both real now.
        assert_eq!(
            privs.user_ids(),
            IdTriple {
                real: REAL_UID,
                effective: REAL_UID,
                saved: REAL_UID
            }
        );

        // A second scope finds nothing to elevate to and runs as-is.
        let calls_before = ops.set_uid_calls.load(Ordering::SeqCst);
        let probe = ops.clone();
        privs
            .do_as_root(move || {
                assert_eq!(probe.snapshot_uids().effective, REAL_UID);
                Ok(())
            })
            .unwrap();
        assert_eq!(ops.set_uid_calls.load(Ordering::SeqCst), calls_before);
    }

    #[test]
    fn do_as_input_is_reusable() {
        let (privs, ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();

        for _ in 0..2 {
            let probe = ops.clone();
            privs
                .do_as_input(move || {
                    assert_eq!(probe.gids.lock().effective, INPUT_GID);
                    Ok(())
                })
                .unwrap();
            assert_eq!(
                privs.group_ids(),
                IdTriple {
                    real: REAL_GID,
                    effective: REAL_GID,
                    saved: INPUT_GID
                }
            );
        }
    }

    #[test]
    fn do_as_input_restores_even_when_callback_fails() {
        let (privs, _ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();

        let err = privs
            .do_as_input(|| -> Result<()> { Err(anyhow!("open failed")) })
            .unwrap_err();
        assert!(err.to_string().contains("open failed"));
        assert_eq!(privs.group_ids().effective, REAL_GID);
        assert_eq!(privs.group_ids().saved, INPUT_GID);
    }

    #[test]
    fn drop_root_user_is_one_way_and_idempotent() {
        let (privs, ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();

        privs.drop_root_user().unwrap();
        let after_drop = ops.set_uid_calls.load(Ordering::SeqCst);
        privs.drop_root_user().unwrap();
        assert_eq!(ops.set_uid_calls.load(Ordering::SeqCst), after_drop);

        // Elevation is gone for good.
        let probe = ops.clone();
        privs
            .do_as_root(move || {
                assert_eq!(probe.snapshot_uids().effective, REAL_UID);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn drop_input_group_is_one_way_and_idempotent() {
        let (privs, ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();

        privs.drop_input_group().unwrap();
        privs.drop_input_group().unwrap();
        assert_eq!(
            privs.group_ids(),
            IdTriple {
                real: REAL_GID,
                effective: REAL_GID,
                saved: REAL_GID
            }
        );

        let probe = ops.clone();
        privs
            .do_as_input(move || {
                assert_eq!(probe.gids.lock().effective, REAL_GID);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn do_as_user_touches_no_ids() {
        let (privs, ops) = manager(FakeOps::setuid_binary());
        privs.init().unwrap();
        let before_uid = ops.set_uid_calls.load(Ordering::SeqCst);
        let before_gid = ops.set_gid_calls.load(Ordering::SeqCst);
        privs.do_as_user(|| Ok(())).unwrap();
        assert_eq!(ops.set_uid_calls.load(Ordering::SeqCst), before_uid);
        assert_eq!(ops.set_gid_calls.load(Ordering::SeqCst), before_gid);
    }
}
