//! Memory-bounded transfer queue.
//!
//! This module implements a single-producer single-consumer queue that limits
//! its contents by the estimated memory usage of the buffered entries instead
//! of their count. The module uses `tokio`'s synchronization primitives under
//! the hood.

use std::{
    collections::VecDeque,
    fmt::Debug,
    io::{self, Write},
    mem,
    sync::Mutex,
};

use datasize::{data_size, DataSize};
use serde::{ser::SerializeSeq, Serialize, Serializer};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A single-producer single-consumer queue for transferring variable-sized
/// entries between tasks.
///
/// If a fixed number of elements is needed, or the entries have fixed memory
/// requirements, a plain bounded channel is the better option. This queue
/// limits based on the entries' estimated memory usage, as reported through
/// [`DataSize`]. Note that the limit is a soft limit and making progress is
/// preferred over keeping it. Concretely that means that if this queue is
/// empty, [`push`](Self::push) always succeeds.
///
/// All suspending methods take a [`CancellationToken`]. Cancelling the token
/// wakes any waiter and causes the pending operation to complete without
/// performing its effect; cancellation is never reported as an error.
///
/// The queue is strictly single-producer single-consumer: at most one task
/// pushing and one task popping. The internal wake signal is shared between
/// both sides and is not paired with specific waiters, so multiple producers
/// or multiple consumers could race between state mutation and the wakeup
/// re-check.
#[derive(Debug)]
pub struct TransferQueue<T> {
    /// Soft limit for the accounted memory of buffered entries.
    max_memory: usize,

    /// Lock-protected buffer and accounting state.
    ///
    /// The lock is never held across a suspension point.
    state: Mutex<QueueState<T>>,

    /// Wakes waiters after every state change.
    ///
    /// A single broadcast covers both a consumer waiting for an entry and a
    /// producer waiting for freed memory; woken waiters re-check their own
    /// predicate.
    notify: Notify,
}

/// Lock-protected internal state.
#[derive(Debug)]
struct QueueState<T> {
    /// Buffered entries in insertion order.
    entries: VecDeque<Entry<T>>,

    /// Sum of the charges of all buffered entries.
    used_memory: usize,
}

/// A buffered entry together with the memory charge recorded at insertion.
///
/// Removal subtracts the recorded charge instead of querying the entry again,
/// so accounting stays consistent even if an entry's reported size is not
/// stable over its lifetime.
#[derive(Debug)]
struct Entry<T> {
    item: T,
    charge: usize,
}

impl<T: DataSize> TransferQueue<T> {
    /// Creates a new transfer queue with `max_memory` as the soft limit on
    /// the accounted memory of buffered entries.
    ///
    /// # Panics
    ///
    /// Panics if `max_memory` is zero.
    pub fn new(max_memory: usize) -> Self {
        assert!(max_memory > 0, "memory limit must be non-zero");

        TransferQueue {
            max_memory,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                used_memory: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Pushes an entry into the queue, waiting for there to be enough free
    /// memory.
    ///
    /// In the case of an empty queue, this operation always succeeds without
    /// waiting, as the memory limit is soft and making progress takes
    /// priority.
    ///
    /// If `cancel` fires before the entry was admitted, the push is a no-op
    /// and the entry is dropped on the floor.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub async fn push(&self, item: T, cancel: &CancellationToken) {
        // Cap the charge at `max_memory`, so a single entry always fits into
        // an empty queue and the producer cannot get stuck.
        let actual = data_size(&item);
        let charge = actual.min(self.max_memory);
        if charge < actual {
            debug!(actual, charge, "entry exceeds the soft memory limit");
        }

        self.wait_for_free_memory(charge, cancel).await;
        if cancel.is_cancelled() {
            trace!(charge, "push cancelled, dropping entry");
            return;
        }

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.entries.push_back(Entry { item, charge });
            state.used_memory += charge;
        }

        // If the consumer is waiting for an entry, wake it.
        self.notify.notify_waiters();
    }

    /// Takes a single entry out of the queue, waiting until there is one.
    ///
    /// If `cancel` fires, this method returns `None` instead.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub async fn pop_one(&self, cancel: &CancellationToken) -> Option<T> {
        self.wait_for_non_empty(cancel).await;

        let entry = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if cancel.is_cancelled() {
                return None;
            }
            // Wakeups are not paired with specific waiters, so tolerate a
            // buffer that is still empty after waking.
            let entry = state.entries.pop_front()?;
            state.used_memory -= entry.charge;
            entry
        };

        // If the producer is waiting for free memory, wake it.
        self.notify.notify_waiters();
        Some(entry.item)
    }

    /// Extracts all entries from this queue as soon as it is non-empty.
    ///
    /// The entries are returned in insertion order. If `cancel` fires, an
    /// empty container is returned instead.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub async fn pop_all(&self, cancel: &CancellationToken) -> VecDeque<T> {
        self.wait_for_non_empty(cancel).await;

        let drained = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if cancel.is_cancelled() {
                return VecDeque::new();
            }
            state.used_memory = 0;
            mem::take(&mut state.entries)
        };

        // If the producer is waiting for free memory, wake it.
        self.notify.notify_waiters();
        drained.into_iter().map(|entry| entry.item).collect()
    }

    /// Removes all entries from the queue.
    ///
    /// This is a reset/teardown helper: it neither suspends nor wakes pending
    /// waiters. Callers relying on it to unblock a pending push or pop must
    /// cancel the token those operations were given.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.entries.clear();
        state.used_memory = 0;
    }

    /// Returns the number of buffered entries.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("state lock poisoned")
            .entries
            .len()
    }

    /// Returns `true` if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the accounted memory of all buffered entries.
    ///
    /// Entries are accounted with their size capped at the soft limit, so
    /// this value never exceeds [`max_memory`](Self::max_memory).
    pub fn used_memory(&self) -> usize {
        self.state.lock().expect("state lock poisoned").used_memory
    }

    /// Returns the configured soft memory limit.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Waits until `charge` more bytes fit into the memory budget, the queue
    /// is empty, or `cancel` fires.
    async fn wait_for_free_memory(&self, charge: usize, cancel: &CancellationToken) {
        loop {
            // Register for wakeups before checking the predicate, so a
            // broadcast between the check and the await below is not lost.
            let notified = self.notify.notified();

            if cancel.is_cancelled() {
                return;
            }
            {
                let state = self.state.lock().expect("state lock poisoned");
                if state.entries.is_empty() || state.used_memory + charge <= self.max_memory {
                    return;
                }
            }
            trace!(charge, "waiting for free memory");

            tokio::select! {
                _ = notified => {}
                // Dropping this future on exit unsubscribes from the token.
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Waits until the queue is non-empty or `cancel` fires.
    async fn wait_for_non_empty(&self, cancel: &CancellationToken) {
        loop {
            let notified = self.notify.notified();

            if cancel.is_cancelled() {
                return;
            }
            {
                let state = self.state.lock().expect("state lock poisoned");
                if !state.entries.is_empty() {
                    return;
                }
            }
            trace!("waiting for entries");

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

impl<T> TransferQueue<T>
where
    T: Serialize,
{
    /// Creates a snapshot of the queue by serializing all buffered entries,
    /// in insertion order, as a sequence.
    ///
    /// The entries are streamed directly into `serializer`.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub fn snapshot<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let state = self.state.lock().expect("state lock poisoned");

        let mut seq = serializer.serialize_seq(Some(state.entries.len()))?;
        for entry in &state.entries {
            seq.serialize_element(&entry.item)?;
        }
        seq.end()
    }
}

impl<T> TransferQueue<T>
where
    T: Debug,
{
    /// Dumps the contents of the queue (`Debug` representation) to the given
    /// writer.
    ///
    /// # Panics
    ///
    /// Panics if the state lock has been poisoned.
    pub fn debug_dump<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let state = self.state.lock().expect("state lock poisoned");

        writeln!(
            writer,
            "Queue: {} entries, {}/{} bytes [",
            state.entries.len(),
            state.used_memory,
            self.max_memory
        )?;
        for entry in &state.entries {
            writeln!(writer, "\t{:?}", entry.item)?;
        }
        writeln!(writer, "]")
    }
}

impl<T> DataSize for TransferQueue<T> {
    const IS_DYNAMIC: bool = true;

    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        let state = self.state.lock().expect("state lock poisoned");

        // The recorded charges stand in for the entries' own heap sizes.
        state.entries.capacity() * mem::size_of::<Entry<T>>() + state.used_memory
    }
}
