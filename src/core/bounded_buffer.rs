//! Bounded Multi-Producer Multi-Consumer Buffer
//!
//! The classic fixed-size circular buffer coordinated by two counting
//! gates (empty slots, filled slots) plus one mutex per cursor:
//!
//! - `empty` gate: producers wait here while the buffer is full
//! - `filled` gate: consumers wait here while the buffer is empty
//! - `write_cursor` / `read_cursor`: serialize producers among themselves
//!   and consumers among themselves. The gates only bound capacity; they do
//!   not protect the cursor update.
//!
//! No busy-waiting: every blocking path parks on a condition variable.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Error returned by [`BoundedBuffer::put`] and [`BoundedBuffer::try_put`].
///
/// The rejected item is handed back to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PutError<T> {
    #[error("bounded buffer is full")]
    Full(T),
    #[error("bounded buffer is closed")]
    Closed(T),
}

impl<T> PutError<T> {
    /// Recover the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// Slot in the ring. Ownership of the payload is transferred by the gates:
/// a producer owns the slot between its `empty` acquire and `filled`
/// release, a consumer between its `filled` acquire and `empty` release.
struct Slot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Acquired,
    Closed,
    WouldBlock,
}

struct GateState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore with a close flag.
///
/// `drain = true` keeps handing out the remaining permits after close;
/// `drain = false` refuses immediately once closed.
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                permits,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, drain: bool, deadline: Option<Instant>) -> Acquire {
        let mut state = self.state.lock();
        loop {
            if state.closed && !drain {
                return Acquire::Closed;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Acquire::Acquired;
            }
            if state.closed {
                return Acquire::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        // One last look: a release may have raced the timeout.
                        if state.permits > 0 && !(state.closed && !drain) {
                            state.permits -= 1;
                            return Acquire::Acquired;
                        }
                        return Acquire::WouldBlock;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn try_acquire(&self, drain: bool) -> Acquire {
        let mut state = self.state.lock();
        if state.closed && !drain {
            return Acquire::Closed;
        }
        if state.permits > 0 {
            state.permits -= 1;
            return Acquire::Acquired;
        }
        if state.closed {
            Acquire::Closed
        } else {
            Acquire::WouldBlock
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        drop(state);
        self.cond.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    fn permits(&self) -> usize {
        self.state.lock().permits
    }
}

/// Fixed-capacity blocking FIFO shared by any number of producers and
/// consumers.
pub struct BoundedBuffer<T> {
    slots: Box<[Slot<T>]>,
    empty: Gate,
    filled: Gate,
    // Next slot to write. Guarded separately from the gates.
    write_cursor: Mutex<WriteCursor>,
    // Next slot to read.
    read_cursor: Mutex<usize>,
    capacity: usize,
}

struct WriteCursor {
    index: usize,
    closed: bool,
}

// SAFETY: BoundedBuffer is Send/Sync because:
// - a slot is written only by the producer that holds both an `empty`
//   permit and the write cursor lock for that index
// - a slot is read only by the consumer that holds both a `filled` permit
//   and the read cursor lock for that index
// - gate handoff goes through a mutex, which orders the write before the read
unsafe impl<T: Send> Send for BoundedBuffer<T> {}
unsafe impl<T: Send> Sync for BoundedBuffer<T> {}

impl<T> BoundedBuffer<T> {
    /// Create a buffer with `capacity` slots.
    ///
    /// All slots are allocated here; put/take never allocate.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be at least 1");

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot::new());
        }

        Self {
            slots: slots.into_boxed_slice(),
            empty: Gate::new(capacity),
            filled: Gate::new(0),
            write_cursor: Mutex::new(WriteCursor {
                index: 0,
                closed: false,
            }),
            read_cursor: Mutex::new(0),
            capacity,
        }
    }

    /// Enqueue `item`, blocking while the buffer is full.
    ///
    /// Fails only when the buffer has been closed.
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        match self.empty.acquire(false, None) {
            Acquire::Acquired => self.write_acquired(item),
            _ => Err(PutError::Closed(item)),
        }
    }

    /// Enqueue `item` without blocking.
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        match self.empty.try_acquire(false) {
            Acquire::Acquired => self.write_acquired(item),
            Acquire::WouldBlock => Err(PutError::Full(item)),
            Acquire::Closed => Err(PutError::Closed(item)),
        }
    }

    fn write_acquired(&self, item: T) -> Result<(), PutError<T>> {
        let mut cursor = self.write_cursor.lock();
        if cursor.closed {
            drop(cursor);
            self.empty.release();
            return Err(PutError::Closed(item));
        }

        let slot = &self.slots[cursor.index];
        // SAFETY: the empty permit plus the write cursor lock make this
        // producer the only owner of the slot.
        unsafe {
            (*slot.data.get()).write(item);
        }
        cursor.index = (cursor.index + 1) % self.capacity;

        // Signal while still holding the cursor: close() takes the same lock,
        // so every accepted item is visible to consumers before the close.
        self.filled.release();
        Ok(())
    }

    /// Dequeue the oldest item, blocking while the buffer is empty.
    ///
    /// Returns `None` once the buffer is closed and fully drained.
    pub fn take(&self) -> Option<T> {
        match self.filled.acquire(true, None) {
            Acquire::Acquired => Some(self.read_acquired()),
            _ => None,
        }
    }

    /// Dequeue without blocking.
    pub fn try_take(&self) -> Option<T> {
        match self.filled.try_acquire(true) {
            Acquire::Acquired => Some(self.read_acquired()),
            _ => None,
        }
    }

    /// Dequeue, waiting at most `timeout` for an item.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        match self.filled.acquire(true, Some(Instant::now() + timeout)) {
            Acquire::Acquired => Some(self.read_acquired()),
            _ => None,
        }
    }

    fn read_acquired(&self) -> T {
        let mut cursor = self.read_cursor.lock();
        let slot = &self.slots[*cursor];
        // SAFETY: the filled permit guarantees the slot was initialized and
        // the read cursor lock makes this consumer its only reader.
        let item = unsafe { (*slot.data.get()).assume_init_read() };
        *cursor = (*cursor + 1) % self.capacity;
        drop(cursor);

        self.empty.release();
        item
    }

    /// Refuse further puts and wake every blocked caller.
    ///
    /// Items already accepted stay takeable. Idempotent.
    pub fn close(&self) {
        let mut cursor = self.write_cursor.lock();
        cursor.closed = true;
        self.empty.close();
        self.filled.close();
    }

    pub fn is_closed(&self) -> bool {
        self.write_cursor.lock().closed
    }

    /// Number of filled slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.filled.permits()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of empty slots.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.empty.permits()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for BoundedBuffer<T> {
    fn drop(&mut self) {
        let remaining = self.filled.state.get_mut().permits;
        let mut index = *self.read_cursor.get_mut();
        for _ in 0..remaining {
            // SAFETY: exactly `remaining` slots starting at the read cursor
            // hold initialized items that nobody took.
            unsafe { (*self.slots[index].data.get()).assume_init_drop() };
            index = (index + 1) % self.capacity;
        }
    }
}
