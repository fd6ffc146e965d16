use std::panic;

use log::error;

use crate::error::panic_message;

/// Install the process panic hook.
///
/// Debug builds print a full backtrace through `better-panic`; release builds
/// write a crash report through `human-panic`. Either way the panic is also
/// recorded in the log, since stderr may not be where anyone looks.
pub fn initialize_panic_handler() {
    #[cfg(debug_assertions)]
    better_panic::install();

    #[cfg(not(debug_assertions))]
    human_panic::setup_panic!();

    let report = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        error!(
            "Thread '{}' panicked at {}: {}",
            thread.name().unwrap_or("<unnamed>"),
            panic_info
                .location()
                .map(ToString::to_string)
                .unwrap_or_default(),
            panic_message(panic_info.payload())
        );
        report(panic_info);
    }));
}
