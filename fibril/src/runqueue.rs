//! Per-k-thread runqueue
//!
//! A runqueue is a pair of priority arrays, `active` and `expired`.
//! Each array keeps, per credit class (UNDER first, then OVER), one
//! FIFO bucket per u-thread group plus a group-occupancy bitmap, so
//! selection is O(1): find the lowest set bit, take that bucket's head.
//!
//! Invariants maintained here:
//! - a bitmap bit is set iff its bucket is non-empty;
//! - a u-thread sits in at most one bucket, and only while RUNNABLE;
//! - within a bucket, order is strict FIFO.
//!
//! All operations require the runqueue's [`RawSpinLock`] to be held
//! with the scheduling signals masked on the owning CPU.

use crate::constants::MAX_GROUPS;
use crate::containing_record;
use crate::list::ListEntry;
use crate::spinlock::RawSpinLock;
use crate::uthread::{Uthread, UthreadState};

/// Credit-state priority class. UNDER still has credits; OVER is
/// depleted. A closed two-element enumeration, used to index the
/// per-class arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CreditClass {
    Under = 0,
    Over = 1,
}

pub const CLASS_COUNT: usize = 2;

const CLASSES: [CreditClass; CLASS_COUNT] = [CreditClass::Under, CreditClass::Over];

/// One priority array: per-class group bitmaps and FIFO buckets.
pub struct PrioArray {
    /// Bit g of `mask[class]` is set iff `queues[class][g]` is non-empty.
    mask: [u32; CLASS_COUNT],
    queues: [[ListEntry; MAX_GROUPS]; CLASS_COUNT],
    count: u32,
}

impl PrioArray {
    pub const fn new() -> Self {
        const EMPTY: ListEntry = ListEntry::new();
        Self {
            mask: [0; CLASS_COUNT],
            queues: [[EMPTY; MAX_GROUPS]; CLASS_COUNT],
            count: 0,
        }
    }

    /// Initialize the bucket heads in place. Must run after the array
    /// has reached its final address — heads are self-referential.
    pub fn init(&mut self) {
        self.mask = [0; CLASS_COUNT];
        self.count = 0;
        for class in self.queues.iter_mut() {
            for head in class.iter_mut() {
                head.init_head();
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn class_mask(&self, class: CreditClass) -> u32 {
        self.mask[class as usize]
    }

    /// Append `u` at the tail of its (class, group) bucket.
    ///
    /// # Safety
    /// `u` must be valid, RUNNABLE, and in no runqueue.
    pub unsafe fn enqueue(&mut self, u: *mut Uthread) {
        let class = (*u).class as usize;
        let gid = (*u).gid as usize;
        debug_assert!(gid < MAX_GROUPS);
        debug_assert_eq!((*u).state, UthreadState::Runnable);

        self.queues[class][gid].insert_tail(&mut (*u).runq_link);
        self.mask[class] |= 1 << gid;
        self.count += 1;
    }

    /// Unlink `u` from its (class, group) bucket.
    ///
    /// # Safety
    /// `u` must currently be linked into this array under the class and
    /// group its fields carry.
    pub unsafe fn dequeue(&mut self, u: *mut Uthread) {
        let class = (*u).class as usize;
        let gid = (*u).gid as usize;

        (*u).runq_link.remove_entry();
        if self.queues[class][gid].is_empty() {
            self.mask[class] &= !(1 << gid);
        }
        debug_assert!(self.count > 0);
        self.count -= 1;
    }

    /// Detach and return the head of the lowest-index non-empty group
    /// in `class`, or null.
    ///
    /// # Safety
    /// Array must be consistent (callers hold the runqueue lock).
    pub unsafe fn pick_best_in_class(&mut self, class: CreditClass) -> *mut Uthread {
        let mask = self.mask[class as usize];
        if mask == 0 {
            return core::ptr::null_mut();
        }

        // Lowest group id wins; FIFO within the group.
        let gid = mask.trailing_zeros() as usize;
        let queue = &mut self.queues[class as usize][gid];
        debug_assert!(!queue.is_empty());

        let entry = queue.remove_head();
        if queue.is_empty() {
            self.mask[class as usize] &= !(1 << gid);
        }
        self.count -= 1;

        containing_record!(entry, Uthread, runq_link)
    }

    /// Best candidate across classes: scan UNDER first, then OVER.
    ///
    /// # Safety
    /// See [`PrioArray::pick_best_in_class`].
    pub unsafe fn pick_best(&mut self) -> *mut Uthread {
        for class in CLASSES {
            let u = self.pick_best_in_class(class);
            if !u.is_null() {
                return u;
            }
        }
        core::ptr::null_mut()
    }

    /// Check the bitmap-vs-bucket invariant for every (class, group).
    pub fn bitmap_consistent(&self) -> bool {
        for class in 0..CLASS_COUNT {
            for gid in 0..MAX_GROUPS {
                let bit = self.mask[class] & (1 << gid) != 0;
                if bit == self.queues[class][gid].is_empty() {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for PrioArray {
    fn default() -> Self {
        Self::new()
    }
}

/// The runqueue proper: `{active, expired}` plus its spinlock.
pub struct Runqueue {
    pub lock: RawSpinLock,
    arrays: [PrioArray; 2],
    active: usize,
}

impl Runqueue {
    pub const fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            arrays: [PrioArray::new(), PrioArray::new()],
            active: 0,
        }
    }

    /// In-place initialization once the runqueue has its final address.
    pub fn init(&mut self) {
        self.active = 0;
        for array in self.arrays.iter_mut() {
            array.init();
        }
    }

    #[inline]
    pub fn active(&mut self) -> &mut PrioArray {
        &mut self.arrays[self.active]
    }

    #[inline]
    pub fn expired(&mut self) -> &mut PrioArray {
        &mut self.arrays[self.active ^ 1]
    }

    /// Exchange the two priority arrays. The arrays themselves never
    /// move (the bucket heads are self-referential); only the index
    /// flips.
    #[inline]
    pub fn swap_active_expired(&mut self) {
        self.active ^= 1;
    }

    /// Total u-threads queued across both arrays.
    #[inline]
    pub fn len(&self) -> u32 {
        self.arrays[0].len() + self.arrays[1].len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Runqueue {
    fn default() -> Self {
        Self::new()
    }
}
