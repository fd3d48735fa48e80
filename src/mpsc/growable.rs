// Lock-free bounded multi-producer / single-consumer (MPSC) queue backed by
// a growable chain of power-of-two segments.
//
// Producers claim strictly increasing 64-bit indices with a CAS loop and
// publish into the slot that index maps to; the single consumer walks the
// same indices in order. A segment that fills while still below the maximum
// capacity is grown: its last slot becomes a JUMP marker pointing at the
// next, twice-as-large segment. Once a segment of maximum size is linked the
// chain stops growing and that segment is used as a circular buffer, so a
// full queue rejects offers instead of allocating.

use crate::MpscQueue;
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::utils::CachePadded;
use std::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

/*──────────────────────────────────────────────────────────────────────────*/
/*  Slots                                                                   */
/*──────────────────────────────────────────────────────────────────────────*/

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(usize)]
enum SlotState {
    Empty = 0,
    Item = 1,
    Jump = 2,
}

struct Slot<T> {
    state: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicUsize::new(SlotState::Empty as usize),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Publish `item` into this slot. The value write must become visible
    /// no later than the `Item` state, hence the release store.
    #[inline]
    fn publish(&self, item: T) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), SlotState::Empty as usize);
        unsafe { (*self.value.get()).write(item) };
        self.state.store(SlotState::Item as usize, Ordering::Release);
    }
}

/*──────────────────────────────────────────────────────────────────────────*/
/*  Segments                                                                */
/*──────────────────────────────────────────────────────────────────────────*/

/// One fixed-size block of the segment chain.
///
/// A segment with `base` and `len = mask + 1` covers producer indices
/// `base .. base + len - 1`; its last slot is the boundary slot, which is
/// either the growth point (JUMP) or, in the final max-size segment, an
/// ordinary slot of the circular mapping.
struct Segment<T> {
    base: u64,
    mask: u64,
    next: Atomic<Segment<T>>,
    slots: Box<[Slot<T>]>,
}

impl<T> Segment<T> {
    fn new(base: u64, len: u64) -> Self {
        debug_assert!(len.is_power_of_two());
        let slots = (0..len).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        Self {
            base,
            mask: len - 1,
            next: Atomic::null(),
            slots,
        }
    }

    #[inline]
    fn slot(&self, index: u64) -> &Slot<T> {
        // index >= base always holds; the wrap only matters in the final
        // segment, earlier segments are abandoned at their boundary.
        &self.slots[(index.wrapping_sub(self.base) & self.mask) as usize]
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        // Retired segments are fully drained; only a queue dropped with
        // items still enqueued reaches this loop with `Item` slots.
        if std::mem::needs_drop::<T>() {
            for slot in self.slots.iter() {
                if slot.state.load(Ordering::Relaxed) == SlotState::Item as usize {
                    unsafe { std::ptr::drop_in_place((*slot.value.get()).as_mut_ptr()) };
                }
            }
        }
    }
}

/*──────────────────────────────────────────────────────────────────────────*/
/*  Queue header                                                            */
/*──────────────────────────────────────────────────────────────────────────*/

/// Bounded, lock-free, growable MPSC queue.
///
/// Any number of threads may `offer` concurrently; exactly one thread may
/// `poll`/`peek`. Capacity starts at `initial_capacity` and doubles on
/// demand up to `max_capacity` (both normalized up to powers of two).
/// `len` is a best-effort estimate under concurrent offers and exact only
/// in quiescence.
///
/// Retired segments are reclaimed through `crossbeam::epoch`, so a producer
/// that raced past a growth boundary can never observe freed memory.
pub struct GrowableQueue<T: Send + 'static> {
    /* producer side ------------------------------------------------- */
    producer_index: CachePadded<AtomicU64>,
    /// Cached `consumer_index + max_capacity`. Refreshed from the consumer
    /// cursor only when exceeded, keeping the offer hot path off the
    /// consumer's cache line.
    producer_limit: CachePadded<AtomicU64>,
    producer_seg: CachePadded<Atomic<Segment<T>>>,

    /* consumer side ------------------------------------------------- */
    consumer_index: CachePadded<AtomicU64>,
    consumer_seg: CachePadded<Atomic<Segment<T>>>,

    max_capacity: u64,
}

unsafe impl<T: Send + 'static> Send for GrowableQueue<T> {}
unsafe impl<T: Send + 'static> Sync for GrowableQueue<T> {}

impl<T: Send + 'static> GrowableQueue<T> {
    /// Build a queue growing from `initial_capacity` to `max_capacity`
    /// slots, both rounded up to the next power of two.
    ///
    /// # Panics
    /// If either capacity is zero or `initial_capacity > max_capacity`.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        assert!(initial_capacity > 0, "initial capacity must be positive");
        assert!(max_capacity > 0, "max capacity must be positive");
        assert!(
            initial_capacity <= max_capacity,
            "initial capacity must not exceed max capacity"
        );

        let initial = initial_capacity.next_power_of_two() as u64;
        let max = max_capacity.next_power_of_two() as u64;

        let first = Atomic::new(Segment::new(0, initial));
        Self {
            producer_index: CachePadded::new(AtomicU64::new(0)),
            producer_limit: CachePadded::new(AtomicU64::new(max)),
            producer_seg: CachePadded::new(first.clone()),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            consumer_seg: CachePadded::new(first),
            max_capacity: max,
        }
    }

    /// Normalized maximum capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_capacity as usize
    }

    /*──────────────────────── producer path ───────────────────────────*/

    /// Enqueue `item`. `Err` hands the item back when the queue holds
    /// `capacity()` undrained items; the caller decides whether to retry
    /// or drop. Never blocks; a producer only loops while racing other
    /// producers for an index or while a growth step is in flight.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let guard = epoch::pin();
        loop {
            let tail = self.producer_seg.load(Ordering::Acquire, &guard);
            let seg = unsafe { tail.deref() };
            // Loaded after the tail pointer, so `pidx >= seg.base` holds:
            // the tail is republished only after the boundary index that
            // created it was already claimed.
            let pidx = self.producer_index.load(Ordering::Acquire);
            let len = seg.mask + 1;

            if len == self.max_capacity {
                // Final segment: circular mapping, bounded by capacity.
                if pidx >= self.producer_limit.load(Ordering::Acquire) {
                    let cidx = self.consumer_index.load(Ordering::Acquire);
                    if pidx.wrapping_sub(cidx) >= self.max_capacity {
                        return Err(item);
                    }
                    self.producer_limit.store(cidx + self.max_capacity, Ordering::Release);
                }
                // The capacity check guarantees the claimed slot was already
                // cleared: its previous occupant was polled before the
                // consumer cursor we read could advance this far.
                if self.claim(pidx) {
                    seg.slot(pidx).publish(item);
                    return Ok(());
                }
                continue;
            }

            let boundary = seg.base + seg.mask;
            if pidx < boundary {
                if self.claim(pidx) {
                    seg.slot(pidx).publish(item);
                    return Ok(());
                }
            } else if pidx == boundary {
                // Winning this claim makes us the one grower for this
                // boundary; index uniqueness rules out double-allocation.
                if self.claim(pidx) {
                    self.grow(seg, pidx, item, &guard);
                    return Ok(());
                }
            } else {
                // Another producer claimed the boundary and is linking the
                // next segment; wait for the republished tail.
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn claim(&self, pidx: u64) -> bool {
        self.producer_index
            .compare_exchange_weak(pidx, pidx + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Allocate and link the next segment. Called by the unique claimant of
    /// `boundary`; its item becomes slot 0 of the new segment, the old
    /// boundary slot becomes the JUMP marker.
    fn grow<'g>(&self, seg: &Segment<T>, boundary: u64, item: T, guard: &'g Guard) {
        let next_len = ((seg.mask + 1) << 1).min(self.max_capacity);
        let next = Owned::new(Segment::new(boundary, next_len)).into_shared(guard);

        // Order matters for the consumer: item, then the link, then the
        // JUMP state it acquires.
        unsafe { next.deref() }.slots[0].publish(item);
        seg.next.store(next, Ordering::Release);
        seg.slots[seg.mask as usize]
            .state
            .store(SlotState::Jump as usize, Ordering::Release);

        // Republish the tail for producers spinning past the boundary.
        self.producer_seg.store(next, Ordering::Release);
    }

    /*──────────────────────── consumer path ───────────────────────────*/

    /// Dequeue the oldest item, or `None` when the queue looks empty.
    ///
    /// `None` may be a false negative while a producer has claimed an index
    /// but not yet published into it; stale or partial data is never
    /// returned. Single-consumer only.
    pub fn poll(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut shared = self.consumer_seg.load(Ordering::Relaxed, &guard);
        loop {
            let seg = unsafe { shared.deref() };
            let cidx = self.consumer_index.load(Ordering::Relaxed);
            let slot = seg.slot(cidx);

            let state = slot.state.load(Ordering::Acquire);
            if state == SlotState::Item as usize {
                let item = unsafe { (*slot.value.get()).assume_init_read() };
                // Clear before advancing: producers treat a published
                // consumer index as proof the slot is reusable.
                slot.state.store(SlotState::Empty as usize, Ordering::Release);
                self.consumer_index.store(cidx + 1, Ordering::Release);
                return Some(item);
            } else if state == SlotState::Jump as usize {
                shared = self.follow_jump(seg, shared, &guard);
            } else {
                return None;
            }
        }
    }

    /// Reference to the oldest item without consuming it.
    ///
    /// Takes `&mut self`: the reference stays valid only while no other
    /// operation can clear the slot underneath it.
    pub fn peek(&mut self) -> Option<&T> {
        // Exclusive access: no producer or reclamation can race us.
        let guard = unsafe { epoch::unprotected() };
        loop {
            let shared = self.consumer_seg.load(Ordering::Relaxed, guard);
            let seg = unsafe { shared.deref() };
            let cidx = self.consumer_index.load(Ordering::Relaxed);
            let slot = seg.slot(cidx);

            let state = slot.state.load(Ordering::Acquire);
            if state == SlotState::Item as usize {
                return Some(unsafe { (*slot.value.get()).assume_init_ref() });
            } else if state == SlotState::Jump as usize {
                self.follow_jump(seg, shared, guard);
            } else {
                return None;
            }
        }
    }

    /// Hop over a JUMP marker: advance the consumer segment and retire the
    /// exhausted one. The consumer index is not advanced, the boundary
    /// index's item lives at slot 0 of the next segment.
    fn follow_jump<'g>(
        &self,
        seg: &Segment<T>,
        shared: Shared<'g, Segment<T>>,
        guard: &'g Guard,
    ) -> Shared<'g, Segment<T>> {
        // Non-null: the link is stored before the JUMP state we acquired.
        let next = seg.next.load(Ordering::Acquire, guard);
        self.consumer_seg.store(next, Ordering::Relaxed);
        // No cursor can reach the old segment again; producers that still
        // hold it are pinned in an earlier epoch.
        unsafe { guard.defer_destroy(shared) };
        next
    }

    /*────────────────────────── observers ─────────────────────────────*/

    /// Approximate number of enqueued items: the distance between the
    /// producer and consumer cursors, re-read until the consumer cursor is
    /// stable. Never negative, never above `capacity()`, exact only in
    /// quiescence.
    pub fn len(&self) -> usize {
        loop {
            let before = self.consumer_index.load(Ordering::Acquire);
            let pidx = self.producer_index.load(Ordering::Acquire);
            let after = self.consumer_index.load(Ordering::Acquire);
            if before == after {
                return pidx.saturating_sub(after) as usize;
            }
        }
    }

    /// `len() == 0`, with the same staleness caveat.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> MpscQueue<T> for GrowableQueue<T> {
    type PushError = T;
    type PopError = ();

    fn push(&self, item: T) -> Result<(), Self::PushError> {
        self.offer(item)
    }

    fn pop(&self) -> Result<T, Self::PopError> {
        self.poll().ok_or(())
    }

    fn is_empty(&self) -> bool {
        GrowableQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

impl<T: Send + 'static> Drop for GrowableQueue<T> {
    fn drop(&mut self) {
        // Drain so segment destructors only ever see cleared slots.
        while self.poll().is_some() {}
        unsafe {
            let guard = epoch::unprotected();
            let mut seg = self.consumer_seg.load(Ordering::Relaxed, guard);
            while !seg.is_null() {
                let next = seg.deref().next.load(Ordering::Relaxed, guard);
                drop(seg.into_owned());
                seg = next;
            }
        }
    }
}

impl<T: Send + 'static> fmt::Debug for GrowableQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowableQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
