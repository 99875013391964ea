//! Lock-free triple buffer.
//!
//! Three slots let one writer and one reader exchange whole values
//! without ever waiting on each other:
//! - the writer fills the back slot, then swaps it with the middle slot;
//! - the reader swaps the middle slot into the front when it is fresh.
//!
//! The reader always sees the latest complete value, never a partially
//! written one. Intermediate values may be skipped.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

// State byte layout: [fresh:1][unused:1][back:2][middle:2][front:2]
const FRONT_SHIFT: u8 = 0;
const MIDDLE_SHIFT: u8 = 2;
const BACK_SHIFT: u8 = 4;
const SLOT_MASK: u8 = 0b11;
const FRESH_BIT: u8 = 0x80;

const INITIAL_STATE: u8 = (2 << BACK_SHIFT) | (1 << MIDDLE_SHIFT) | (0 << FRONT_SHIFT);

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    state: AtomicU8,
}

// SAFETY: the state machine hands each slot to at most one side at a time.
// The writer only touches the back slot and the reader only the front slot.
unsafe impl<T: Send> Send for Shared<T> {}
// SAFETY: see above; shared access goes through the atomic state.
unsafe impl<T: Send> Sync for Shared<T> {}

#[inline]
fn slot(state: u8, shift: u8) -> usize {
    ((state >> shift) & SLOT_MASK) as usize
}

/// Writing half. Owned by exactly one thread.
pub struct TripleWriter<T> {
    shared: Arc<Shared<T>>,
}

/// Reading half. Owned by exactly one thread (or guarded by a lock).
pub struct TripleReader<T> {
    shared: Arc<Shared<T>>,
}

/// Create a triple buffer whose three slots start as clones of `initial`.
pub fn triple_buffer<T: Clone>(initial: T) -> (TripleWriter<T>, TripleReader<T>) {
    let shared = Arc::new(Shared {
        slots: [
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial),
        ],
        state: AtomicU8::new(INITIAL_STATE),
    });
    (
        TripleWriter {
            shared: Arc::clone(&shared),
        },
        TripleReader { shared },
    )
}

impl<T> TripleWriter<T> {
    /// The slot being written. Its contents are whatever was last
    /// swapped out of the middle, so callers overwrite it fully.
    pub fn back_mut(&mut self) -> &mut T {
        let state = self.shared.state.load(Ordering::Acquire);
        let idx = slot(state, BACK_SHIFT);
        // SAFETY: only the writer moves the back index, and `&mut self`
        // guarantees there is one writer.
        unsafe { &mut *self.shared.slots[idx].get() }
    }

    /// Make the back slot visible to the reader.
    pub fn publish(&mut self) {
        let mut state = self.shared.state.load(Ordering::Acquire);
        loop {
            let new_state = ((slot(state, MIDDLE_SHIFT) as u8) << BACK_SHIFT)
                | ((slot(state, BACK_SHIFT) as u8) << MIDDLE_SHIFT)
                | ((slot(state, FRONT_SHIFT) as u8) << FRONT_SHIFT)
                | FRESH_BIT;
            match self.shared.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
    }
}

impl<T> TripleReader<T> {
    /// Whether a value newer than the front slot has been published.
    pub fn has_fresh(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & FRESH_BIT != 0
    }

    /// Latest published value.
    pub fn read(&mut self) -> &T {
        let mut state = self.shared.state.load(Ordering::Acquire);
        while state & FRESH_BIT != 0 {
            let new_state = ((slot(state, BACK_SHIFT) as u8) << BACK_SHIFT)
                | ((slot(state, FRONT_SHIFT) as u8) << MIDDLE_SHIFT)
                | ((slot(state, MIDDLE_SHIFT) as u8) << FRONT_SHIFT);
            match self.shared.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    state = new_state;
                    break;
                }
                Err(actual) => state = actual,
            }
        }
        let idx = slot(state, FRONT_SHIFT);
        // SAFETY: only the reader moves the front index, and `&mut self`
        // guarantees there is one reader.
        unsafe { &*self.shared.slots[idx].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value() {
        let (_w, mut r) = triple_buffer(vec![1.0, 2.0]);
        assert!(!r.has_fresh());
        assert_eq!(r.read(), &vec![1.0, 2.0]);
    }

    #[test]
    fn test_publish_then_read() {
        let (mut w, mut r) = triple_buffer(0u32);
        *w.back_mut() = 7;
        w.publish();
        assert!(r.has_fresh());
        assert_eq!(*r.read(), 7);
        assert!(!r.has_fresh());
        assert_eq!(*r.read(), 7);
    }

    #[test]
    fn test_latest_wins() {
        let (mut w, mut r) = triple_buffer(0u32);
        for v in 1..=5 {
            *w.back_mut() = v;
            w.publish();
        }
        assert_eq!(*r.read(), 5);
    }

    #[test]
    fn test_no_torn_values_across_threads() {
        let (mut w, mut r) = triple_buffer([0u64; 16]);
        let writer = std::thread::spawn(move || {
            for v in 1..=20_000u64 {
                *w.back_mut() = [v; 16];
                w.publish();
            }
        });
        let mut last = 0;
        while last < 20_000 {
            let value = *r.read();
            assert!(value.iter().all(|&x| x == value[0]), "torn read");
            assert!(value[0] >= last, "went backwards");
            last = value[0];
            if writer.is_finished() && !r.has_fresh() {
                break;
            }
        }
        writer.join().unwrap();
        assert_eq!(*r.read(), [20_000u64; 16]);
    }
}
