//! Memory pools owned by the scheduler.

pub mod stack;

pub use stack::{FiberStack, StackAllocator};
