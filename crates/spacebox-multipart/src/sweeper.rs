//! Background maintenance thread for the task manager.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use spacebox_config::log_sweep_debug;

use crate::manager::UploadTaskManager;

/// Runs [`UploadTaskManager::run_maintenance`] every `interval` until
/// stopped or dropped. The first pass runs immediately.
pub struct Sweeper {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(manager: Arc<UploadTaskManager>, interval: Duration) -> io::Result<Self> {
        let (shutdown, rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("spacebox-sweeper".to_string())
            .spawn(move || loop {
                let report = manager.run_maintenance(Utc::now());
                log_sweep_debug!(
                    "maintenance pass",
                    evicted = report.sweep.evicted,
                    busy = report.sweep.busy,
                    gc = report.gc.is_some()
                );
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    // Explicit stop or the handle was dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
