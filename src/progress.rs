//! Fan-out of immutable progress snapshots.
//!
//! The workflow publishes a fresh snapshot value after every sub-action.
//! Observers either hold an `mpsc::Receiver` (any thread, any pace) or
//! register a callback for in-process forwarding. Publishing never waits on
//! an observer: channel sends are unbounded and a receiver that went away is
//! pruned on the next publish. Callbacks run after the bus lock is released,
//! so they may read the bus or subscribe.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Sink<T> {
    Channel(Sender<T>),
    Callback(Callback<T>),
}

struct Inner<T> {
    sinks: Vec<Sink<T>>,
    last: Option<T>,
}

pub struct ProgressBus<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ProgressBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ProgressBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ProgressBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sinks: Vec::new(),
                last: None,
            })),
        }
    }

    /// Receive every snapshot published from now on.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.lock().sinks.push(Sink::Channel(tx));
        rx
    }

    /// Call `callback` with every snapshot published from now on.
    ///
    /// The callback runs on the publishing thread and must not block.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.lock().sinks.push(Sink::Callback(Arc::new(callback)));
    }

    pub fn publish(&self, snapshot: T) {
        let callbacks: Vec<Callback<T>> = {
            let mut inner = self.lock();
            inner.last = Some(snapshot.clone());
            inner.sinks.retain(|sink| match sink {
                Sink::Channel(tx) => tx.send(snapshot.clone()).is_ok(),
                Sink::Callback(_) => true,
            });
            inner
                .sinks
                .iter()
                .filter_map(|sink| match sink {
                    Sink::Callback(callback) => Some(Arc::clone(callback)),
                    Sink::Channel(_) => None,
                })
                .collect()
        };
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    /// Most recently published snapshot.
    pub fn last(&self) -> Option<T> {
        self.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().sinks.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
