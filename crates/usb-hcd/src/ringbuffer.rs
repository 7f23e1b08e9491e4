use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};
use Ordering::{Relaxed, SeqCst};

/// Fixed capacity single producer single consumer queue.
///
/// Carries interrupt snapshots from the top half to the deferred bottom
/// half without allocating or blocking on either side. Elements are `Copy`,
/// so nothing needs dropping when slots are overwritten.
pub struct SpscQueue<const N: usize, T: Copy> {
    head: AtomicU32,
    tail: AtomicU32,
    elems: UnsafeCell<[MaybeUninit<T>; N]>,
}

unsafe impl<const N: usize, T: Copy + Send> Send for SpscQueue<N, T> {}
unsafe impl<const N: usize, T: Copy + Send> Sync for SpscQueue<N, T> {}

impl<const N: usize, T: Copy> SpscQueue<N, T> {
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.next_power_of_two() == N);

    pub const fn new() -> Self {
        let () = Self::CAPACITY_IS_POWER_OF_TWO;
        SpscQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            elems: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
        }
    }

    fn empty(head: u32, tail: u32) -> bool {
        head == tail
    }

    fn full(head: u32, tail: u32) -> bool {
        head == tail.wrapping_add(N as u32)
    }

    pub fn len(&self) -> usize {
        self.head.load(SeqCst).wrapping_sub(self.tail.load(SeqCst)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element back if the queue is full.
    ///
    /// # Safety
    /// Must be the only sender at this time.
    pub unsafe fn try_send(&self, elem: T) -> Result<(), T> {
        let cur_head = self.head.load(Relaxed);
        let cur_tail = self.tail.load(SeqCst);

        if Self::full(cur_head, cur_tail) {
            return Err(elem);
        }

        let head_idx = (cur_head as usize) % N;
        let target = self.elems.get().cast::<MaybeUninit<T>>().wrapping_add(head_idx);

        // The slot at head is outside the head..tail region the consumer
        // reads from, so writing it cannot race.
        unsafe {
            target.write(MaybeUninit::new(elem));
        }

        self.head.fetch_add(1, SeqCst);
        Ok(())
    }

    /// # Safety
    /// Must be the only receiver at this time.
    pub unsafe fn try_recv(&self) -> Option<T> {
        let cur_head = self.head.load(SeqCst);
        let cur_tail = self.tail.load(Relaxed);

        if Self::empty(cur_head, cur_tail) {
            return None;
        }

        let tail_idx = (cur_tail as usize) % N;
        let target = self.elems.get().cast::<MaybeUninit<T>>().wrapping_add(tail_idx);

        // Slots between tail and head were fully written before head moved
        // past them, and the producer does not reuse one until tail moves.
        let elem = unsafe { target.read().assume_init() };

        self.tail.fetch_add(1, SeqCst);
        Some(elem)
    }
}
