//! `vigil watch`: runs a main loop under the hang watchdog for a while.
//!
//! `--stall-ms` posts a task that blocks the loop, which is how the
//! watchdog's live path is exercised without a UI host.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fs_err as fs;
use serde_json::json;
use tracing::{info, warn};
use vigil_core::envelope::read_event_envelope;
use vigil_core::watchdog::HANG_EXCEPTION_TYPE;
use vigil_core::{MainContext, MainLoop, StorageConfig, VigilEngine};

use crate::error::AgentError;
use crate::open_engine;

pub fn run(storage: StorageConfig, stall: Option<Duration>, duration: Duration) -> Result<(), AgentError> {
    let engine = open_engine(storage);
    let (main_loop, handle) = MainLoop::new();

    let Some(watchdog) = engine.hang_watchdog(Arc::new(handle.clone()) as Arc<dyn MainContext>)
    else {
        println!("{}", json!({ "watchdog": "disabled", "hangs": 0 }));
        return Ok(());
    };

    if let Some(stall) = stall {
        info!(stall_ms = stall.as_millis() as u64, "Stalling main loop");
        handle.post_labeled("stall", Box::new(move || thread::sleep(stall)));
    }

    watchdog.start()?;
    main_loop.run_for(duration);
    watchdog.stop();

    let hangs = count_hang_events(&engine);
    println!("{}", json!({ "watchdog": "ran", "hangs": hangs }));
    Ok(())
}

fn count_hang_events(engine: &VigilEngine) -> usize {
    let cache = engine.storage().envelope_cache_dir();
    let entries = match fs::read_dir(&cache) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to list envelope cache");
            }
            return 0;
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| read_event_envelope(&entry.path()).ok())
        .filter(|event| {
            event
                .exceptions
                .iter()
                .any(|exception| exception.ty == HANG_EXCEPTION_TYPE)
        })
        .count()
}
