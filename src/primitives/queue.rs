use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Interval at which blocked callers re-check their cancellation predicate.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Outcome of a blocking [`WorkQueue::take`].
#[derive(Debug)]
pub enum Take<T> {
    /// Next unit of work. The caller now holds a lease on the queue.
    Item(T),
    /// The queue is empty and the caller still holds a lease; flush local
    /// state and call [`WorkQueue::release`] before taking again.
    Idle,
    /// The queue was closed and drained, or the caller was cancelled.
    Closed,
}

/// Bounded blocking FIFO shared by a pool of workers.
///
/// Producers block while the queue is full. A worker that takes an item holds
/// a lease until it reports idle, so [`WorkQueue::join`] only returns once
/// every item was taken *and* every worker flushed the work it accumulated.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    leased: usize,
    closed: bool,
    high_water: usize,
}

impl<T> WorkQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                leased: 0,
                closed: false,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items waiting to be taken.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest queue length observed since creation.
    pub fn high_water_mark(&self) -> usize {
        self.state.lock().high_water
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// Returns the item back when the queue is closed or `cancelled` reports
    /// true before space became available.
    pub fn push(&self, item: T, cancelled: &dyn Fn() -> bool) -> Result<(), T> {
        let mut guard = self.state.lock();
        loop {
            if guard.closed || cancelled() {
                return Err(item);
            }
            if guard.items.len() < self.capacity {
                break;
            }
            self.not_full.wait_for(&mut guard, CANCEL_POLL);
        }
        guard.items.push_back(item);
        guard.high_water = guard.high_water.max(guard.items.len());
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item` without waiting and whatever the caller's run state.
    ///
    /// Returns the item back when the queue is closed or full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut guard = self.state.lock();
        if guard.closed || guard.items.len() >= self.capacity {
            return Err(item);
        }
        guard.items.push_back(item);
        guard.high_water = guard.high_water.max(guard.items.len());
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns every waiting item.
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.state.lock();
        let items: Vec<T> = guard.items.drain(..).collect();
        self.not_full.notify_all();
        if guard.leased == 0 {
            self.idle.notify_all();
        }
        items
    }

    /// Takes the next item, blocking until one arrives, the caller's lease
    /// should be flushed, or the queue closes.
    pub fn take(&self, leased: &mut bool, cancelled: &dyn Fn() -> bool) -> Take<T> {
        let mut guard = self.state.lock();
        loop {
            if cancelled() {
                return Take::Closed;
            }
            if let Some(item) = guard.items.pop_front() {
                if !*leased {
                    *leased = true;
                    guard.leased += 1;
                }
                self.not_full.notify_one();
                return Take::Item(item);
            }
            if *leased {
                return Take::Idle;
            }
            if guard.closed {
                return Take::Closed;
            }
            self.not_empty.wait_for(&mut guard, CANCEL_POLL);
        }
    }

    /// Gives up the caller's lease after it flushed its local work.
    pub fn release(&self, leased: &mut bool) {
        if !*leased {
            return;
        }
        *leased = false;
        let mut guard = self.state.lock();
        guard.leased = guard.leased.saturating_sub(1);
        if guard.leased == 0 && guard.items.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Blocks until the queue is empty and no worker holds a lease.
    ///
    /// Returns false when `cancelled` fired first.
    pub fn join(&self, cancelled: &dyn Fn() -> bool) -> bool {
        let mut guard = self.state.lock();
        while !(guard.items.is_empty() && guard.leased == 0) {
            if cancelled() {
                return false;
            }
            self.idle.wait_for(&mut guard, CANCEL_POLL);
        }
        true
    }

    /// Stops accepting items; workers drain what is queued and then see
    /// [`Take::Closed`].
    pub fn close(&self) {
        let mut guard = self.state.lock();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Closes the queue and drops every waiting item. Returns how many were dropped.
    pub fn abandon(&self) -> usize {
        let mut guard = self.state.lock();
        guard.closed = true;
        let dropped = guard.items.len();
        guard.items.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.idle.notify_all();
        dropped
    }
}
