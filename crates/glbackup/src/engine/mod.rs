pub mod pool;
pub mod queue;
pub mod report;

pub use pool::{Pool, Task};
pub use queue::WorkQueue;
pub use report::{Report, Reporter, WorkEvent};

use tracing::{error, warn};

use crate::process::ChildRegistry;

/// Exit status used when the run is interrupted.
pub const INTERRUPTED_EXIT: i32 = 130;

/// On SIGINT/SIGTERM: raise the cancel flag, kill every tracked subprocess
/// group and exit with status 130. In-flight items are abandoned.
#[cfg(unix)]
pub fn install_interrupt_handler(registry: ChildRegistry) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register signal handlers: {e}");
            return;
        }
    };
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            warn!(signal = sig, "interrupted, stopping workers");
            registry.request_cancel();
            registry.kill_all();
            std::process::exit(INTERRUPTED_EXIT);
        }
    });
}

#[cfg(not(unix))]
pub fn install_interrupt_handler(_registry: ChildRegistry) {}
