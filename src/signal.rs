//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM clear the process-wide running flag; the event loop
//! observes it after the next completion drain and returns. SIGPIPE is
//! ignored so a peer resetting mid-write cannot kill the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install signal handlers and return the running flag.
///
/// The flag starts `true` and is cleared when a shutdown signal (SIGINT or
/// SIGTERM) is received. A second signal forces an immediate exit.
pub fn install_signal_handlers() -> Arc<AtomicBool> {
    ignore_sigpipe();

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    ctrlc::set_handler(move || {
        if !flag.swap(false, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal");
    })
    .expect("failed to set signal handler");

    running
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
