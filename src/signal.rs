use std::sync::atomic::AtomicBool;
#[cfg(unix)]
use std::sync::atomic::Ordering;

/// Raised by SIGINT/SIGTERM once `install` has run
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Route SIGTERM (docker stop) and SIGINT (Ctrl+C) to `SHUTDOWN`.
#[cfg(unix)]
pub fn install() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, handle_signal as libc::sighandler_t);
        }
    }
}

#[cfg(not(unix))]
pub fn install() {}

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
