//! Expiry Reaper
//!
//! Background thread that periodically removes expired elements from both
//! tiers. It holds only a weak reference, so an abandoned cache is freed
//! and the thread exits on its next tick.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use super::engine::{Cache, CacheInner};
use crate::error::Result;

pub(crate) struct Reaper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn start(cache: Weak<CacheInner>, name: &str, interval: Duration) -> Result<Self> {
        let (shutdown, signal) = channel::bounded::<()>(1);
        let cache_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("{name}-expiry"))
            .spawn(move || {
                debug!(cache = %cache_name, interval_secs = interval.as_secs(), "Expiry reaper started");
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let Some(inner) = cache.upgrade() else {
                        break;
                    };
                    let cache = Cache::from_inner(inner);
                    match cache.evict_expired_elements() {
                        Ok(_) => {}
                        Err(e) if e.is_not_alive() => break,
                        Err(e) => warn!(cache = %cache_name, error = %e, "Expiry sweep failed"),
                    }
                }
                debug!(cache = %cache_name, "Expiry reaper stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it, unless called from the thread itself
    pub(crate) fn stop(mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread; never join here, the last
        // cache handle may be released on the reaper thread itself
        self.shutdown.take();
    }
}
