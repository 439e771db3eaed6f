//! Observable values with replay of the current state to new subscribers.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

const FEED_CAPACITY: usize = 1024;

/// A value plus a change feed. New subscribers get the current value first and
/// then every later value in order. A subscriber that falls behind is resynced
/// to the current value.
pub(crate) struct Feed<T> {
    state: Arc<Mutex<T>>,
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Default + Clone + Send + 'static> Default for Feed<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(value)),
            tx,
        }
    }

    pub fn get(&self) -> T {
        self.state.lock().clone()
    }

    pub fn publish(&self, value: T) {
        let mut state = self.state.lock();
        *state = value.clone();
        let _ = self.tx.send(value);
    }

    /// Applies `f` and publishes the result, unless `f` fails.
    pub fn try_modify<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        *state = next.clone();
        let _ = self.tx.send(next);
        Ok(out)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> BoxStream<'static, T> {
        let (current, mut rx) = {
            let state = self.state.lock();
            (state.clone(), self.tx.subscribe())
        };
        let state = self.state.clone();
        let stream = async_stream::stream! {
            yield current;
            loop {
                match rx.recv().await {
                    Ok(value) => yield value,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("feed subscriber lagged by {n}; resyncing");
                        let value = state.lock().clone();
                        yield value;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        stream.boxed()
    }
}

struct LogState<T> {
    epoch: u64,
    items: Vec<T>,
}

/// Append-only list with an ordered, exactly-once subscription.
///
/// Clearing the list starts a new epoch; subscribers restart at the first
/// item of the new epoch.
pub(crate) struct AppendLog<T> {
    state: Arc<Mutex<LogState<T>>>,
    tx: broadcast::Sender<(u64, usize, T)>,
}

impl<T> Clone for AppendLog<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AppendLog<T> {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(LogState {
                epoch: 0,
                items: vec![],
            })),
            tx,
        }
    }
}

impl<T: Clone + Send + 'static> AppendLog<T> {
    pub fn append(&self, item: T) {
        let mut state = self.state.lock();
        let index = state.items.len();
        state.items.push(item.clone());
        let _ = self.tx.send((state.epoch, index, item));
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.items.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn since(&self, since: usize) -> Vec<T> {
        self.state
            .lock()
            .items
            .iter()
            .skip(since)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> BoxStream<'static, T> {
        let (mut epoch, existing, mut rx) = {
            let state = self.state.lock();
            (state.epoch, state.items.clone(), self.tx.subscribe())
        };
        let state = self.state.clone();
        let stream = async_stream::stream! {
            let mut seen = existing.len();
            for item in existing {
                yield item;
            }
            loop {
                let resync = match rx.recv().await {
                    Ok((item_epoch, index, item)) => {
                        if item_epoch != epoch {
                            epoch = item_epoch;
                            seen = 0;
                        }
                        if index < seen {
                            continue;
                        }
                        if index == seen {
                            seen += 1;
                            yield item;
                            continue;
                        }
                        true
                    }
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                };

                if resync {
                    let missing = {
                        let state = state.lock();
                        if state.epoch != epoch {
                            epoch = state.epoch;
                            seen = 0;
                        }
                        state.items.iter().skip(seen).cloned().collect::<Vec<_>>()
                    };
                    seen += missing.len();
                    for item in missing {
                        yield item;
                    }
                }
            }
        };
        stream.boxed()
    }
}
