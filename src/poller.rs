use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryIter};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the worker sleeps before re-checking its stop flag.
const STOP_CHECK: Duration = Duration::from_millis(10);

/// Background thread that calls a closure at a fixed interval and hands the
/// results to whoever holds the poller.
///
/// Stopping is cooperative: [`Poller::stop`] (or dropping the poller) sets a
/// flag the worker checks between polls and then joins the thread.
pub struct Poller<T> {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Poller<T> {
    /// `poll` returning `None` skips that tick.
    pub fn spawn<F>(name: &str, interval: Duration, mut poll: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let worker_stop = stop.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !worker_stop.load(Ordering::Relaxed) {
                    let tick = Instant::now();
                    if let Some(value) = poll() {
                        if sender.send(value).is_err() {
                            break;
                        }
                    }
                    while !worker_stop.load(Ordering::Relaxed) {
                        let remaining = interval.saturating_sub(tick.elapsed());
                        if remaining.is_zero() {
                            break;
                        }
                        thread::sleep(remaining.min(STOP_CHECK));
                    }
                }
            })?;

        log::debug!("Poller {} started ({:?} interval)", name, interval);
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
            receiver,
        })
    }
}

impl<T> Poller<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Everything delivered since the last call, without blocking.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        self.receiver.try_iter()
    }

    /// Most recent value, discarding older ones.
    pub fn latest(&self) -> Option<T> {
        self.receiver.try_iter().last()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Poller {} panicked", self.name);
            } else {
                log::debug!("Poller {} stopped", self.name);
            }
        }
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
