// SPDX-License-Identifier: GPL-3.0-only
//! Managed worker threads for long-running capture loops
//!
//! A [`WorkerLoop`] owns a thread that repeatedly runs one iteration of a
//! loop body against state moved into it. The running flag is polled before
//! every iteration, so stopping takes at most one iteration. Stopping is
//! always followed by a join; dropping the controller does both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the loop body to control the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Controller for a loop running on its own thread
///
/// ```ignore
/// let mut worker = WorkerLoop::spawn("audio-capture", capture, |capture| {
///     read_and_emit(capture);
///     LoopAction::Continue
/// })?;
///
/// worker.stop(); // clears the running flag and joins
/// ```
pub struct WorkerLoop {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    name: String,
}

impl WorkerLoop {
    /// Spawn a named thread running `loop_fn(&mut state)` until stopped
    ///
    /// Fails only if the OS refuses to create the thread.
    pub fn spawn<S, F>(name: &str, mut state: S, mut loop_fn: F) -> std::io::Result<Self>
    where
        S: Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_in_thread = Arc::clone(&running);
        let thread_name = name.to_string();

        info!(name = %name, "Starting worker loop");

        let thread_handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(name = %thread_name, "Worker loop thread started");

            while running_in_thread.load(Ordering::Acquire) {
                if loop_fn(&mut state) == LoopAction::Stop {
                    debug!(name = %thread_name, "Loop body requested stop");
                    break;
                }
            }

            // State (and any device handle it owns) is released on this thread
            drop(state);
            running_in_thread.store(false, Ordering::Release);
            info!(name = %thread_name, "Worker loop thread exiting");
        })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            running,
            name: name.to_string(),
        })
    }

    /// Whether the thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Shared running flag, cleared when a stop is requested
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Clear the running flag without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting worker loop stop");
        self.running.store(false, Ordering::Release);
    }

    /// Clear the running flag and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Joining worker loop thread");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Worker loop thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "WorkerLoop dropped, stopping");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_loop_stops_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&counter);

        let mut worker = WorkerLoop::spawn("test-self-stop", 0u32, move |n| {
            *n += 1;
            observed.store(*n, Ordering::SeqCst);
            if *n >= 10 { LoopAction::Stop } else { LoopAction::Continue }
        })
        .unwrap();

        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_stop_is_bounded_by_one_iteration() {
        let counter = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&counter);

        let mut worker = WorkerLoop::spawn("test-stop", (), move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            LoopAction::Continue
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        worker.stop();
        let after_stop = counter.load(Ordering::SeqCst);
        assert!(after_stop > 0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let mut worker = WorkerLoop::spawn("test-double-stop", (), |_| {
            thread::sleep(Duration::from_millis(1));
            LoopAction::Continue
        })
        .unwrap();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_state_dropped_on_exit() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let worker = WorkerLoop::spawn("test-drop", Flagged(Arc::clone(&dropped)), |_| {
            LoopAction::Stop
        })
        .unwrap();
        drop(worker);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
