// SPDX-License-Identifier: AGPL-3.0-or-later

//! Suppresses update loops between the two peers.
//!
//! Applying a remote update moves the local caret, which the editor reports
//! back as if the user had moved it. While the guard is held, such locally
//! observed events must not be re-transmitted.
//!
//! The guard only covers observers that report while the apply call is in
//! progress. An out-of-process editor plugin reports back over its socket
//! after the hold has long been released, so such a plugin must keep its own
//! suppression flag around the selects it applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One flag per session, shared between the task that applies external
/// updates and the side that observes local editor events.
#[derive(Clone, Default)]
pub struct EchoGuard {
    applying_external: Arc<AtomicBool>,
}

impl EchoGuard {
    /// Sets the flag until the returned hold is dropped.
    #[must_use]
    pub fn hold(&self) -> EchoGuardHold {
        self.applying_external.store(true, Ordering::SeqCst);
        EchoGuardHold {
            flag: Arc::clone(&self.applying_external),
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.applying_external.load(Ordering::SeqCst)
    }
}

/// Clears the flag on drop, so release happens on every exit path,
/// including error returns and panics while applying a remote update.
pub struct EchoGuardHold {
    flag: Arc<AtomicBool>,
}

impl Drop for EchoGuardHold {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};

    #[test]
    fn held_only_while_hold_is_alive() {
        let guard = EchoGuard::default();
        assert!(!guard.is_held());
        {
            let _hold = guard.hold();
            assert!(guard.is_held());
        }
        assert!(!guard.is_held());
    }

    #[test]
    fn released_on_error_exit() {
        let guard = EchoGuard::default();

        fn failing_apply(guard: &EchoGuard) -> Result<()> {
            let _hold = guard.hold();
            bail!("target file cannot be opened");
        }

        assert!(failing_apply(&guard).is_err());
        assert!(!guard.is_held());
    }

    #[test]
    fn released_on_panic() {
        let guard = EchoGuard::default();
        let cloned = guard.clone();
        let result = std::panic::catch_unwind(move || {
            let _hold = cloned.hold();
            panic!("apply step blew up");
        });
        assert!(result.is_err());
        assert!(!guard.is_held());
    }

    #[test]
    fn clones_observe_the_same_flag() {
        let guard = EchoGuard::default();
        let observer = guard.clone();
        let _hold = guard.hold();
        assert!(observer.is_held());
    }
}
