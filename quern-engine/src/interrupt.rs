// SPDX-License-Identifier: MIT

//! Process-wide cancellation flag.
//!
//! Set from a signal handler; polled at the top of the scheduler loop, in
//! `wait_for_input`, and inside per-path loops of canonicalisation and
//! store verification.  Observing it unwinds with [`Error::Interrupted`];
//! goal destructors reap their children on the way out.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that raise the flag.  Called once from
/// the daemon binary; tests and library users may instead call
/// [`trigger_interrupt`] directly.
pub fn install_signal_handlers() -> Result<()> {
    let handler = SigHandler::Handler(handle_signal);
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    #[allow(unsafe_code)]
    unsafe {
        signal::signal(Signal::SIGINT, handler)
            .map_err(|e| Error::other(format!("installing SIGINT handler: {e}")))?;
        signal::signal(Signal::SIGTERM, handler)
            .map_err(|e| Error::other(format!("installing SIGTERM handler: {e}")))?;
    }
    Ok(())
}

/// Raise the interrupt flag.
pub fn trigger_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Fail with [`Error::Interrupted`] if the flag is raised.
pub fn check_interrupt() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}
