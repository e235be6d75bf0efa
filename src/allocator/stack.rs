use crate::error::SchedulerError;
use crate::spinlock::SpinLock;
use corosensei::stack::{Stack, StackPointer};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Bytes of guard memory on each side of every fiber stack.
pub const REDZONE_SIZE: usize = 16;

/// Sentinel written into every red zone.
pub const REDZONE_BYTE: u8 = 0xFD;

/// Bytes left untouched below the top of a stack before the first frame.
pub const STACK_SCRATCH: usize = 128;

const STACK_ALIGN: usize = 16;
const PAGE_SIZE: usize = 4096;
const END_OF_LIST: usize = usize::MAX;

/// Handle to one stack carved out of a [`StackAllocator`].
///
/// The handle does not own memory; the allocator's reservation outlives every
/// handle it gives out. Layout of the slot behind a handle:
///
/// ```text
/// low address                                              high address
/// [ red zone | usable stack ........................ | red zone ]
///            ^ bottom (stack limit)                   ^ top
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberStack {
    bottom: NonNull<u8>,
    size: usize,
    index: usize,
}

// SAFETY: a FiberStack is an address range; access is serialized by the
// fiber that owns it.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Slot index inside the owning allocator.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Usable size in bytes, red zones excluded.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest usable address. Writing below it hits the low red zone.
    pub fn bottom(&self) -> *mut u8 {
        self.bottom.as_ptr()
    }

    /// One past the highest usable address. Writing here hits the high red zone.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: bottom + size stays inside the slot.
        unsafe { self.bottom.as_ptr().add(self.size) }
    }

    fn low_redzone(&self) -> *mut u8 {
        // SAFETY: the low red zone sits directly below `bottom`.
        unsafe { self.bottom.as_ptr().sub(REDZONE_SIZE) }
    }

    fn high_redzone(&self) -> *mut u8 {
        self.top()
    }
}

// SAFETY: base and limit describe memory that stays mapped for as long as
// the allocator lives, and base is 16-byte aligned.
unsafe impl Stack for FiberStack {
    fn base(&self) -> StackPointer {
        let base = (self.top() as usize - STACK_SCRATCH) & !(STACK_ALIGN - 1);
        // SAFETY: derived from a non-null pointer well above address zero.
        unsafe { StackPointer::new_unchecked(base) }
    }

    fn limit(&self) -> StackPointer {
        // SAFETY: `bottom` is a NonNull.
        unsafe { StackPointer::new_unchecked(self.bottom.as_ptr() as usize) }
    }
}

struct FreeList {
    head: usize,
    available: usize,
}

/// Fixed pool of guard-banded fiber stacks.
///
/// All stacks are carved from a single reservation made up front. Free stacks
/// are chained through an intrusive list whose links live in the first word of
/// each free stack's usable memory, so the pool needs no side allocation.
/// Capacity never grows.
pub struct StackAllocator {
    base: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    stack_size: usize,
    count: usize,
    free: SpinLock<FreeList>,
}

// SAFETY: the reservation is plain memory; the free list is spinlock guarded.
unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
    /// Reserves `count` stacks of at least `stack_size` usable bytes each.
    pub fn new(count: usize, stack_size: usize) -> Result<Self, SchedulerError> {
        if count == 0 || stack_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "stack allocator needs at least one non-empty stack".into(),
            ));
        }

        let stack_size = stack_size.next_multiple_of(STACK_ALIGN);
        let slot_size = stack_size + 2 * REDZONE_SIZE;
        let bytes = count
            .checked_mul(slot_size)
            .ok_or(SchedulerError::StackReservation { bytes: usize::MAX })?;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE)
            .map_err(|_| SchedulerError::StackReservation { bytes })?;

        // SAFETY: layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(SchedulerError::StackReservation { bytes })?;

        let allocator = StackAllocator {
            base,
            layout,
            slot_size,
            stack_size,
            count,
            free: SpinLock::new(FreeList {
                head: END_OF_LIST,
                available: 0,
            }),
        };

        // Paint the guards and thread every slot onto the free list, lowest
        // index first out.
        {
            let mut free = allocator.free.lock();
            for index in (0..count).rev() {
                let stack = allocator.stack_at(index);
                // SAFETY: both red zones and the link word lie inside the slot.
                unsafe {
                    stack.low_redzone().write_bytes(REDZONE_BYTE, REDZONE_SIZE);
                    stack.high_redzone().write_bytes(REDZONE_BYTE, REDZONE_SIZE);
                    stack.bottom().cast::<usize>().write(free.head);
                }
                free.head = index;
                free.available += 1;
            }
        }

        log::debug!(
            "reserved {} fiber stacks of {} bytes ({} bytes total)",
            count,
            stack_size,
            bytes
        );

        Ok(allocator)
    }

    fn stack_at(&self, index: usize) -> FiberStack {
        debug_assert!(index < self.count);
        // SAFETY: index < count keeps the slot inside the reservation.
        let bottom = unsafe { self.base.as_ptr().add(index * self.slot_size + REDZONE_SIZE) };
        FiberStack {
            // SAFETY: offset from a non-null base.
            bottom: unsafe { NonNull::new_unchecked(bottom) },
            size: self.stack_size,
            index,
        }
    }

    /// Takes a stack from the pool, or `None` if every stack is in use.
    pub fn alloc(&self) -> Option<FiberStack> {
        let mut free = self.free.lock();
        if free.head == END_OF_LIST {
            return None;
        }
        let stack = self.stack_at(free.head);
        // SAFETY: a free stack's first word holds the next link.
        free.head = unsafe { stack.bottom().cast::<usize>().read() };
        free.available -= 1;
        Some(stack)
    }

    /// Returns a stack to the pool.
    pub fn release(&self, stack: FiberStack) {
        debug_assert!(self.owns(&stack), "stack does not belong to this allocator");
        let mut free = self.free.lock();
        // SAFETY: the caller no longer runs on this stack.
        unsafe { stack.bottom().cast::<usize>().write(free.head) };
        free.head = stack.index;
        free.available += 1;
    }

    /// Returns `true` if both red zones of `stack` still hold the sentinel.
    pub fn check_redzone(&self, stack: &FiberStack) -> bool {
        debug_assert!(self.owns(stack), "stack does not belong to this allocator");
        // SAFETY: both red zones lie inside the reservation.
        let (low, high) = unsafe {
            (
                std::slice::from_raw_parts(stack.low_redzone(), REDZONE_SIZE),
                std::slice::from_raw_parts(stack.high_redzone(), REDZONE_SIZE),
            )
        };
        low.iter().chain(high).all(|&byte| byte == REDZONE_BYTE)
    }

    fn owns(&self, stack: &FiberStack) -> bool {
        stack.index < self.count && *stack == self.stack_at(stack.index)
    }

    /// Total number of stacks in the pool.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Number of stacks currently free.
    pub fn available(&self) -> usize {
        self.free.lock().available
    }

    /// Usable bytes per stack after rounding.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        let outstanding = self.count - self.free.get_mut().available;
        if outstanding > 0 {
            log::debug!("releasing stack pool with {} stack(s) still handed out", outstanding);
        }
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
