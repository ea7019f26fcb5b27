//! Periodic log refresh
//!
//! A background thread that calls [`ProfileRegistry::refresh_logs`] once per
//! sampling interval until stopped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};

use super::registry::ProfileRegistry;

pub struct Sampler {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<u64>>,
}

impl Sampler {
    pub fn spawn(registry: Arc<ProfileRegistry>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new().name("perfscope-sampler".to_string()).spawn(move || {
            let ticker = tick(interval);
            let mut cycles = 0u64;
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if registry.is_collecting() {
                            registry.refresh_logs();
                            cycles += 1;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            debug!("Sampler stopped after {cycles} refreshes");
            cycles
        })?;

        Ok(Self { stop_tx: Some(stop_tx), thread: Some(thread) })
    }

    /// Stop the thread and return the number of refreshes it ran.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        // Dropping the sender also wakes the select
        self.stop_tx.take();
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(cycles)) => cycles,
            Some(Err(_)) => {
                warn!("Sampler thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
