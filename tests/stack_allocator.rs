use fibersched::allocator::StackAllocator;
use fibersched::allocator::stack::{REDZONE_BYTE, REDZONE_SIZE};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_exhaustion_and_reuse() {
    let stacks = StackAllocator::new(4, 16 * 1024).unwrap();
    assert_eq!(stacks.capacity(), 4);

    let taken: Vec<_> = (0..4).map(|_| stacks.alloc().unwrap()).collect();
    assert!(stacks.alloc().is_none());
    assert_eq!(stacks.available(), 0);

    let indices: HashSet<_> = taken.iter().map(|s| s.index()).collect();
    assert_eq!(indices.len(), 4);

    let returned = taken[2];
    stacks.release(returned);
    assert_eq!(stacks.available(), 1);
    assert_eq!(stacks.alloc(), Some(returned));
}

#[test]
fn test_stacks_do_not_overlap() {
    let stacks = StackAllocator::new(8, 20 * 1024).unwrap();
    let size = stacks.stack_size();
    assert!(size >= 20 * 1024);

    let mut ranges: Vec<_> = (0..8)
        .map(|_| {
            let stack = stacks.alloc().unwrap();
            assert_eq!(stack.size(), size);
            assert_eq!(stack.top() as usize - stack.bottom() as usize, size);
            (stack.bottom() as usize, stack.top() as usize)
        })
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        // Neighbouring stacks are separated by both red zones.
        assert!(pair[0].1 + 2 * REDZONE_SIZE <= pair[1].0);
    }
}

#[test]
fn test_redzone_detects_overflow_and_underflow() {
    let stacks = StackAllocator::new(2, 16 * 1024).unwrap();
    let stack = stacks.alloc().unwrap();
    assert!(stacks.check_redzone(&stack));

    // Writing inside the usable range leaves the guards alone.
    unsafe {
        stack.bottom().write_bytes(0xAB, stack.size());
    }
    assert!(stacks.check_redzone(&stack));

    unsafe {
        stack.bottom().sub(1).write(0);
    }
    assert!(!stacks.check_redzone(&stack));
    unsafe {
        stack.bottom().sub(1).write(REDZONE_BYTE);
    }
    assert!(stacks.check_redzone(&stack));

    unsafe {
        stack.top().add(REDZONE_SIZE - 1).write(0);
    }
    assert!(!stacks.check_redzone(&stack));
}

#[test]
fn test_concurrent_alloc_release() {
    let stacks = Arc::new(StackAllocator::new(16, 16 * 1024).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let stacks = stacks.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    if let Some(stack) = stacks.alloc() {
                        assert!(stacks.check_redzone(&stack));
                        stacks.release(stack);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(stacks.available(), 16);
}

#[test]
fn test_rejects_empty_pool() {
    assert!(StackAllocator::new(0, 16 * 1024).is_err());
    assert!(StackAllocator::new(4, 0).is_err());
}
