//! Throttled projection of a changing value.
//!
//! The first change is delivered immediately. Changes arriving within
//! `interval` of the last delivery are coalesced: only the newest is kept and
//! delivered once the interval has elapsed. A change equal to what was last
//! delivered cancels any pending delivery.
//!
//! ```text
//! offers:    v0@0   v50@50  v100@100          v300@300
//! delivered: v0@0                   v100@250            v300@500
//! ```

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock_now;

/// Result of offering a value to a [`Throttle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleAction<T> {
    /// Deliver this value now.
    Deliver(T),
    /// Held back; deliver by calling [`Throttle::fire`] at this instant.
    Scheduled(Instant),
    /// Equal to the last delivered value; nothing to do.
    Unchanged,
}

/// Clock-agnostic throttle state.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    delivered: Option<T>,
    last_delivery: Option<Instant>,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T: Clone + PartialEq> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            delivered: None,
            last_delivery: None,
            pending: None,
            deadline: None,
        }
    }

    /// Start from a value consumers already have.
    pub fn with_initial(initial: T, interval: Duration) -> Self {
        Self {
            delivered: Some(initial),
            ..Self::new(interval)
        }
    }

    pub fn offer(&mut self, value: T, now: Instant) -> ThrottleAction<T> {
        if self.delivered.as_ref() == Some(&value) {
            self.pending = None;
            self.deadline = None;
            return ThrottleAction::Unchanged;
        }

        let ready = self
            .last_delivery
            .is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
        if ready && self.deadline.is_none() {
            self.mark_delivered(value.clone(), now);
            return ThrottleAction::Deliver(value);
        }

        let deadline = match (self.deadline, self.last_delivery) {
            (Some(d), _) => d,
            (None, Some(at)) => at + self.interval,
            (None, None) => now,
        };
        self.pending = Some(value);
        self.deadline = Some(deadline);
        ThrottleAction::Scheduled(deadline)
    }

    /// Deliver the pending value if its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<T> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let value = self.pending.take()?;
        self.mark_delivered(value.clone(), now);
        Some(value)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn delivered(&self) -> Option<&T> {
        self.delivered.as_ref()
    }

    fn mark_delivered(&mut self, value: T, now: Instant) {
        self.delivered = Some(value);
        self.last_delivery = Some(now);
        self.pending = None;
        self.deadline = None;
    }
}

/// A [`Throttle`] driven by a background task.
///
/// Inputs come from [`project`](Self::project) or from an upstream watch
/// channel; throttled output is read through [`subscribe`](Self::subscribe).
pub struct ThrottledProjection<T> {
    input: Option<watch::Sender<T>>,
    output: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> ThrottledProjection<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn spawn(initial: T, interval: Duration) -> Self {
        let (input, rx) = watch::channel(initial);
        let mut projection = Self::from_watch(rx, interval);
        projection.input = Some(input);
        projection
    }

    /// Throttle an existing watch channel. The projection ends after the
    /// upstream sender is dropped and any pending value is flushed.
    pub fn from_watch(mut source: watch::Receiver<T>, interval: Duration) -> Self {
        let initial = source.borrow_and_update().clone();
        let (out_tx, output) = watch::channel(initial.clone());
        let task = tokio::spawn(async move {
            let mut throttle = Throttle::with_initial(initial, interval);
            loop {
                let deadline = throttle.deadline();
                tokio::select! {
                    changed = source.changed() => {
                        if changed.is_err() {
                            if let Some(d) = throttle.deadline() {
                                tokio::time::sleep_until(d.into()).await;
                                if let Some(v) = throttle.fire(clock_now()) {
                                    out_tx.send_replace(v);
                                }
                            }
                            break;
                        }
                        let value = source.borrow_and_update().clone();
                        if let ThrottleAction::Deliver(v) = throttle.offer(value, clock_now()) {
                            out_tx.send_replace(v);
                        }
                    }
                    _ = sleep_until(deadline), if deadline.is_some() => {
                        if let Some(v) = throttle.fire(clock_now()) {
                            out_tx.send_replace(v);
                        }
                    }
                }
            }
        });
        Self {
            input: None,
            output,
            task,
        }
    }

    /// Feed a new value. Returns false for projections built on an
    /// upstream channel.
    pub fn project(&self, value: T) -> bool {
        match &self.input {
            Some(tx) => {
                tx.send_replace(value);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.output.clone()
    }

    /// Most recently delivered value.
    pub fn latest(&self) -> T {
        self.output.borrow().clone()
    }
}

impl<T> Drop for ThrottledProjection<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d.into()).await,
        None => std::future::pending().await,
    }
}
