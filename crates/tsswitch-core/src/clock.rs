use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Time source for the retry loops, swapped out in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Clock that only moves when slept on.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
    slept: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            slept: Mutex::new(Vec::new()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
        self.advance(duration);
    }
}

/// A one-shot background timer. Dropping or cancelling the handle before
/// the deadline prevents the callback from running.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: Option<Sender<()>>,
}

impl TimerHandle {
    pub fn after<F>(name: &'static str, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = bounded::<()>(1);
        thread::Builder::new()
            .name(format!("timer-{name}"))
            .spawn(move || match rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => f(),
                _ => trace!("timer {} cancelled", name),
            })
            .map_err(|e| tracing::error!("Failed to spawn timer {}: {}", name, e))
            .ok();
        Self { cancel: Some(tx) }
    }

    pub fn cancel(mut self) {
        self.fire_cancel();
    }

    fn fire_cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.fire_cancel();
    }
}
