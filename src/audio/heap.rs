//! Per-client shared memory accounting
//!
//! Every client process gets a fixed-size heap; ring buffers for its tracks
//! are carved out of it and hand their bytes back when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

struct HeapInner {
    name: String,
    capacity: usize,
    used: AtomicUsize,
}

/// Fixed-capacity heap shared with one client
#[derive(Clone)]
pub struct SharedHeap {
    inner: Arc<HeapInner>,
}

impl SharedHeap {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                name: name.into(),
                capacity,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve `size` bytes
    pub fn allocate(&self, size: usize) -> Result<HeapBlock> {
        let inner = &self.inner;
        inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= inner.capacity)
            })
            .map_err(|used| {
                Error::OutOfMemory(format!(
                    "heap {}: {} bytes requested, {} of {} in use",
                    inner.name, size, used, inner.capacity
                ))
            })?;
        Ok(HeapBlock {
            heap: Arc::clone(&self.inner),
            size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// A reservation in a [`SharedHeap`]; released on drop
pub struct HeapBlock {
    heap: Arc<HeapInner>,
    size: usize,
}

impl HeapBlock {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        self.heap.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBlock")
            .field("heap", &self.heap.name)
            .field("size", &self.size)
            .finish()
    }
}
