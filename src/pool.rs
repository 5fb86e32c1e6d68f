// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session pool binding hardware buffer handles to indexed slots.
//!
//! The pool exists so that a native callback delivering "this handle is
//! ready" can be resolved back to its slot without a secondary lookup table:
//! `bind` stores a packed `(generation, index + 1)` tag on the handle itself
//! and `acquire` only has to read it back. A tag of 0 means unbound.
//!
//! `clear` drops the pool's references but deliberately does not invalidate
//! views already handed to the application: each [`GraphicBuffer`] owns its
//! slot through an `Arc`, so the underlying hardware buffer is released when
//! the last view goes away, exactly once.

use std::sync::Arc;
use std::sync::Mutex;

use crate::video_frame::BufferHandle;
use crate::video_frame::GraphicBuffer;

/// The binding between one hardware buffer handle and its slot index.
pub struct PoolItem {
    handle: Arc<dyn BufferHandle>,
}

impl PoolItem {
    fn acquire(self: &Arc<Self>) -> Arc<GraphicBuffer> {
        GraphicBuffer::from_slot(Arc::clone(&self.handle), Arc::clone(self))
    }
}

struct PoolState {
    items: Vec<Arc<PoolItem>>,
    generation: u32,
}

/// Pool of hardware buffer slots for one capture or decode session.
///
/// `bind`, `acquire` and `clear` are serialized with respect to each other;
/// a HAL callback thread and an application-facing accessor may race during
/// teardown, and a stale handle must resolve as "no valid slot" rather than
/// a dangling access.
pub struct BufferPool {
    state: Mutex<PoolState>,
}

fn pack_tag(generation: u32, index: usize) -> u64 {
    ((generation as u64) << 32) | (index as u64 + 1)
}

impl BufferPool {
    pub fn new() -> Self {
        Self { state: Mutex::new(PoolState { items: Vec::new(), generation: 0 }) }
    }

    /// Registers a new hardware handle, appending a slot and tagging the
    /// handle with its index. A handle must be bound to at most one slot at
    /// a time; rebinding after `clear` is allowed.
    pub fn bind(&self, handle: Arc<dyn BufferHandle>) {
        let mut state = self.state.lock().unwrap();
        handle.set_pool_tag(pack_tag(state.generation, state.items.len()));
        state.items.push(Arc::new(PoolItem { handle }));
    }

    /// Resolves a handle back to its slot and mints an independently-owned
    /// buffer over it.
    ///
    /// Returns `None` when the handle carries no valid tag, which happens if
    /// `clear` ran concurrently; that is a benign loss of the frame, not an
    /// error.
    pub fn acquire(&self, handle: &Arc<dyn BufferHandle>) -> Option<Arc<GraphicBuffer>> {
        let state = self.state.lock().unwrap();
        let tag = handle.pool_tag();
        let index = (tag & u32::MAX as u64) as usize;
        let generation = (tag >> 32) as u32;
        if index == 0 || generation != state.generation {
            return None;
        }
        state.items.get(index - 1).map(PoolItem::acquire)
    }

    /// Drops all slots and starts a new generation.
    ///
    /// Views already acquired keep their own slot reference until the
    /// application drops them; any handle still carrying a tag from a
    /// previous generation fails `acquire` from now on.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
