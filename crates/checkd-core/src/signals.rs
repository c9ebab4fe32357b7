//! Cooperative stop requests.
//!
//! Workers and the foreground supervisor poll a [`StopFlag`] between units of
//! work. [`install`] connects SIGTERM and SIGINT to one process-wide flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{CheckdError, Result};

/// Granularity of [`StopFlag::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(100);

static PROCESS_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns true if a stop was
    /// requested before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

extern "C" fn on_stop_signal(_: nix::libc::c_int) {
    if let Some(flag) = PROCESS_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGTERM and SIGINT to the process-wide stop flag and return it.
/// Calling this more than once returns the same flag.
pub fn install() -> Result<StopFlag> {
    let flag = PROCESS_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)));
    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| CheckdError::Signal(format!("installing {sig} handler: {e}")))?;
    }
    Ok(StopFlag(Arc::clone(flag)))
}
