//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! A general-purpose byte allocator based on an address-ordered free list.
//!
//! Every block, free or occupied, starts with a two-word descriptor
//! `{next_free, size}`; `size` excludes the descriptor. Occupied blocks
//! stay inline in address order but are not threaded on the list; their
//! `next_free` word lies dormant. The free list links only the free
//! blocks, in strictly ascending address order, starting from a head
//! pointer in the allocator header:
//!
//! ```text
//! head ---------+                      +--------------+
//!               v                      |              v
//! | next | size | pay | next | size | pay | next | size | pay |
//! | free block        | occupied block    | free block        |
//! ```
//!
//! Requests are rounded up to the maximum natural alignment
//! ([`MAX_ALIGN`]), which keeps every descriptor word-aligned.
//!
//! ## Complexity
//!
//! `allocate` is linear in the number of *free* blocks, `deallocate` in
//! the number of blocks.
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{default_upstream, RawArena, MAX_ALIGN};
use crate::diag::{Severity, SinkHandle};
use crate::resource::{
    free_total, render_blocks, AllocConfig, AllocError, BlockInfo, BlockIntrospection, FitMode,
    MemoryResource, WithFitMode,
};

/// Descriptor prefixed to every block. Block starts are always
/// [`MAX_ALIGN`]-aligned, so plain (aligned) loads and stores apply.
#[repr(C)]
#[derive(Clone, Copy)]
struct ListHeader {
    /// Next free block in ascending address order; dormant while the
    /// block is occupied.
    next_free: *mut u8,
    /// Payload size in bytes, descriptor excluded.
    size: usize,
}

const DESC_SIZE: usize = mem::size_of::<ListHeader>();

/// Smallest usable arena: one descriptor plus one alignment quantum.
const MIN_ARENA: usize = DESC_SIZE + MAX_ALIGN;

unsafe fn load(at: *mut u8) -> ListHeader {
    debug_assert_eq!(at as usize % mem::align_of::<ListHeader>(), 0);
    ptr::read(at as *const ListHeader)
}

unsafe fn store(at: *mut u8, header: ListHeader) {
    debug_assert_eq!(at as usize % mem::align_of::<ListHeader>(), 0);
    ptr::write(at as *mut ListHeader, header);
}

/// Walk the arena in address order and record every block, deciding
/// occupancy by free-list membership. The caller holds the lock.
unsafe fn collect(arena: &RawArena, free_head: usize) -> Vec<BlockInfo> {
    let mut result = Vec::new();
    let end = arena.base() as usize + arena.size();
    let mut free_cursor = free_head as *mut u8;
    let mut at = arena.base();
    while (at as usize) < end {
        let header = load(at);
        let free = at == free_cursor;
        if free {
            free_cursor = header.next_free;
        }
        result.push(BlockInfo {
            size: header.size + DESC_SIZE,
            occupied: !free,
        });
        at = at.add(DESC_SIZE + header.size);
    }
    result
}

struct Inner {
    arena: Option<RawArena>,
    fit_mode: FitMode,
    /// Head of the free list as an absolute address; zero when the list is
    /// empty or the arena has been taken.
    free_head: usize,
}

/// Sorted-free-list allocator.
///
/// See [the module-level documentation](self) for the arena layout.
///
/// All public operations serialize on one internal mutex, so a shared
/// reference (e.g. through an `Arc`) can be used from many threads.
pub struct SortedListAlloc {
    inner: Mutex<Inner>,
    sink: SinkHandle,
}

impl SortedListAlloc {
    /// The name used in diagnostic records.
    pub const TYPE_NAME: &'static str = "sorted-list";

    /// Construct an allocator over a fresh `size`-byte arena with the
    /// default configuration.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        Self::with_config(size, AllocConfig::default())
    }

    /// Construct an allocator over a fresh `size`-byte arena.
    ///
    /// `size` must leave room for one descriptor plus one alignment
    /// quantum.
    pub fn with_config(size: usize, config: AllocConfig) -> Result<Self, AllocError> {
        let sink = SinkHandle::new(config.sink);
        if size < MIN_ARENA {
            sink.emit(
                Severity::Error,
                format_args!(
                    "{}: arena of {} bytes is below the minimum of {}",
                    Self::TYPE_NAME,
                    size,
                    MIN_ARENA
                ),
            );
            return Err(AllocError::InvalidSize {
                requested: size,
                minimum: MIN_ARENA,
            });
        }

        let upstream = config.upstream.unwrap_or_else(default_upstream);
        let arena = RawArena::acquire(size, upstream).map_err(|e| {
            sink.emit(
                Severity::Critical,
                format_args!("{}: arena acquisition failed: {}", Self::TYPE_NAME, e),
            );
            e
        })?;

        unsafe {
            store(
                arena.base(),
                ListHeader {
                    next_free: ptr::null_mut(),
                    size: size - DESC_SIZE,
                },
            );
        }
        let free_head = arena.base() as usize;

        sink.emit(
            Severity::Debug,
            format_args!(
                "{}: constructed over a {}-byte arena",
                Self::TYPE_NAME,
                size
            ),
        );
        sink.emit(
            Severity::Information,
            format_args!("{}: {} bytes available", Self::TYPE_NAME, size - DESC_SIZE),
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                arena: Some(arena),
                fit_mode: config.fit_mode,
                free_head,
            }),
            sink,
        })
    }

    /// Allocate `size` bytes.
    ///
    /// Requests are rounded up to [`MAX_ALIGN`]; a zero-byte request is
    /// served as one alignment quantum.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let fit_mode = inner.fit_mode;
        if inner.arena.is_none() {
            self.sink.emit(
                Severity::Error,
                format_args!("{}: allocate on an empty allocator", Self::TYPE_NAME),
            );
            return Err(AllocError::InvalidState);
        }

        self.sink.emit(
            Severity::Debug,
            format_args!("{}: allocate({})", Self::TYPE_NAME, size),
        );

        let adjusted = if size == 0 {
            MAX_ALIGN
        } else {
            match size.checked_add(MAX_ALIGN - 1) {
                Some(r) => r & !(MAX_ALIGN - 1),
                None => {
                    self.sink.emit(
                        Severity::Error,
                        format_args!(
                            "{}: request of {} bytes overflows the size arithmetic",
                            Self::TYPE_NAME,
                            size
                        ),
                    );
                    return Err(AllocError::Exhausted { requested: size });
                }
            }
        };
        if adjusted != size {
            self.sink.emit(
                Severity::Warning,
                format_args!(
                    "{}: request rounded from {} to {} bytes",
                    Self::TYPE_NAME,
                    size,
                    adjusted
                ),
            );
        }

        unsafe {
            // Walk the free list, remembering the predecessor of the pick
            // so it can be relinked.
            let mut selected: *mut u8 = ptr::null_mut();
            let mut selected_prev: *mut u8 = ptr::null_mut();
            let mut selected_size = 0usize;
            let mut prev: *mut u8 = ptr::null_mut();
            let mut cur = inner.free_head as *mut u8;
            while !cur.is_null() {
                let header = load(cur);
                if header.size >= adjusted {
                    let better = match fit_mode {
                        FitMode::First => true,
                        FitMode::Best => selected.is_null() || header.size < selected_size,
                        FitMode::Worst => selected.is_null() || header.size > selected_size,
                    };
                    if better {
                        selected = cur;
                        selected_prev = prev;
                        selected_size = header.size;
                    }
                    if fit_mode == FitMode::First {
                        break;
                    }
                }
                prev = cur;
                cur = header.next_free;
            }

            if selected.is_null() {
                self.sink.emit(
                    Severity::Error,
                    format_args!(
                        "{}: no suitable block for {} bytes ({:?} fit)",
                        Self::TYPE_NAME,
                        size,
                        fit_mode
                    ),
                );
                return Err(AllocError::Exhausted { requested: size });
            }

            let successor = load(selected).next_free;
            let replacement;
            if selected_size >= adjusted + DESC_SIZE + 1 {
                // Carve the request off the front; the remainder keeps the
                // pick's place on the free list.
                let new_free = selected.add(DESC_SIZE + adjusted);
                store(
                    new_free,
                    ListHeader {
                        next_free: successor,
                        size: selected_size - adjusted - DESC_SIZE,
                    },
                );
                store(
                    selected,
                    ListHeader {
                        next_free: ptr::null_mut(),
                        size: adjusted,
                    },
                );
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: split {} into {} + {}",
                        Self::TYPE_NAME,
                        selected_size,
                        adjusted,
                        selected_size - adjusted - DESC_SIZE
                    ),
                );
                replacement = new_free;
            } else {
                store(
                    selected,
                    ListHeader {
                        next_free: ptr::null_mut(),
                        size: selected_size,
                    },
                );
                replacement = successor;
            }
            if selected_prev.is_null() {
                inner.free_head = replacement as usize;
            } else {
                let mut header = load(selected_prev);
                header.next_free = replacement;
                store(selected_prev, header);
            }

            self.report_state(inner);
            Ok(NonNull::new_unchecked(selected.add(DESC_SIZE)))
        }
    }

    /// Return a block previously obtained from [`allocate`].
    ///
    /// The pointer is validated against the inline block sequence;
    /// anything that is not the payload address of a live block is
    /// rejected with [`AllocError::InvalidPointer`] and the arena is left
    /// untouched.
    ///
    /// [`allocate`]: SortedListAlloc::allocate
    pub fn deallocate(&self, ptr_: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr_.as_ptr() as usize;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let arena = match inner.arena.as_ref() {
            Some(arena) => arena,
            None => {
                self.sink.emit(
                    Severity::Error,
                    format_args!("{}: deallocate on an empty allocator", Self::TYPE_NAME),
                );
                return Err(AllocError::InvalidState);
            }
        };

        self.sink.emit(
            Severity::Debug,
            format_args!("{}: deallocate({:#x})", Self::TYPE_NAME, addr),
        );

        if !arena.contains(addr) {
            self.sink.emit(
                Severity::Error,
                format_args!(
                    "{}: {:#x} is outside the arena",
                    Self::TYPE_NAME,
                    addr
                ),
            );
            return Err(AllocError::InvalidPointer { addr });
        }

        unsafe {
            // Every block is reachable inline, so the address walk is the
            // authoritative validity check.
            let end = arena.base() as usize + arena.size();
            let mut block: *mut u8 = ptr::null_mut();
            let mut at = arena.base();
            while (at as usize) < end {
                let payload = at as usize + DESC_SIZE;
                if payload == addr {
                    block = at;
                    break;
                }
                if payload > addr {
                    break;
                }
                at = at.add(DESC_SIZE + load(at).size);
            }
            if block.is_null() {
                self.sink.emit(
                    Severity::Error,
                    format_args!(
                        "{}: {:#x} is not a block of this arena",
                        Self::TYPE_NAME,
                        addr
                    ),
                );
                return Err(AllocError::InvalidPointer { addr });
            }

            // A block already on the free list is a stale pointer.
            let mut cur = inner.free_head as *mut u8;
            while !cur.is_null() && (cur as usize) <= block as usize {
                if cur == block {
                    self.sink.emit(
                        Severity::Error,
                        format_args!(
                            "{}: block at {:#x} is not occupied",
                            Self::TYPE_NAME,
                            addr
                        ),
                    );
                    return Err(AllocError::InvalidPointer { addr });
                }
                cur = load(cur).next_free;
            }

            // Find the sorted insertion point.
            let mut prev: *mut u8 = ptr::null_mut();
            let mut next = inner.free_head as *mut u8;
            while !next.is_null() && (next as usize) < block as usize {
                prev = next;
                next = load(next).next_free;
            }

            let mut header = load(block);
            header.next_free = next;
            store(block, header);
            if prev.is_null() {
                inner.free_head = block as usize;
            } else {
                let mut prev_header = load(prev);
                prev_header.next_free = block;
                store(prev, prev_header);
            }

            // Merge with the lower neighbour when it touches this block.
            let mut merged = block;
            if !prev.is_null() {
                let prev_header = load(prev);
                if prev as usize + DESC_SIZE + prev_header.size == block as usize {
                    self.sink.emit(
                        Severity::Debug,
                        format_args!(
                            "{}: coalescing {} with the {} bytes behind",
                            Self::TYPE_NAME,
                            load(block).size,
                            prev_header.size
                        ),
                    );
                    store(
                        prev,
                        ListHeader {
                            next_free: load(block).next_free,
                            size: prev_header.size + DESC_SIZE + load(block).size,
                        },
                    );
                    merged = prev;
                }
            }

            // And with the upper neighbour when this block touches it.
            let merged_header = load(merged);
            if !merged_header.next_free.is_null()
                && merged as usize + DESC_SIZE + merged_header.size
                    == merged_header.next_free as usize
            {
                let next_header = load(merged_header.next_free);
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: coalescing {} with the {} bytes ahead",
                        Self::TYPE_NAME,
                        merged_header.size,
                        next_header.size
                    ),
                );
                store(
                    merged,
                    ListHeader {
                        next_free: next_header.next_free,
                        size: merged_header.size + DESC_SIZE + next_header.size,
                    },
                );
            }

            self.report_state(inner);
        }
        Ok(())
    }

    /// Hand the arena over to a fresh instance, leaving this one empty.
    ///
    /// Further `allocate`/`deallocate` calls on `self` fail with
    /// [`AllocError::InvalidState`] and `blocks_info` yields nothing.
    pub fn take(&mut self) -> Self {
        let inner = self.inner.get_mut();
        let arena = inner.arena.take();
        let free_head = mem::replace(&mut inner.free_head, 0);
        if arena.is_some() {
            self.sink.emit(
                Severity::Debug,
                format_args!("{}: arena transferred to a new instance", Self::TYPE_NAME),
            );
        }
        Self {
            inner: Mutex::new(Inner {
                arena,
                fit_mode: inner.fit_mode,
                free_head,
            }),
            sink: self.sink.clone(),
        }
    }

    fn base_addr(&self) -> Option<usize> {
        self.inner
            .lock()
            .arena
            .as_ref()
            .map(|arena| arena.base() as usize)
    }

    /// Emit the post-mutation snapshot and the free-byte total.
    unsafe fn report_state(&self, inner: &Inner) {
        if !self.sink.is_attached() {
            return;
        }
        let arena = match inner.arena.as_ref() {
            Some(arena) => arena,
            None => return,
        };
        let blocks = collect(arena, inner.free_head);
        self.sink.emit(
            Severity::Debug,
            format_args!("{}: state: {}", Self::TYPE_NAME, render_blocks(&blocks)),
        );
        self.sink.emit(
            Severity::Information,
            format_args!(
                "{}: {} bytes available",
                Self::TYPE_NAME,
                free_total(&blocks)
            ),
        );
    }
}

impl MemoryResource for SortedListAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        SortedListAlloc::allocate(self, size)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        SortedListAlloc::deallocate(self, ptr)
    }
}

impl WithFitMode for SortedListAlloc {
    fn fit_mode(&self) -> FitMode {
        self.inner.lock().fit_mode
    }

    fn set_fit_mode(&self, mode: FitMode) {
        let mut inner = self.inner.lock();
        inner.fit_mode = mode;
        self.sink.emit(
            Severity::Debug,
            format_args!("{}: fit mode set to {:?}", Self::TYPE_NAME, mode),
        );
    }
}

impl BlockIntrospection for SortedListAlloc {
    fn blocks_info(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock();
        match &inner.arena {
            Some(arena) => unsafe { collect(arena, inner.free_head) },
            None => Vec::new(),
        }
    }
}

impl Clone for SortedListAlloc {
    /// Deep-copy the arena.
    ///
    /// The copy is taken from the source's upstream, the bytes are copied
    /// verbatim, and the free-list head and every `next_free` link are
    /// rewritten by the base-address delta. If the upstream cannot supply
    /// the new arena the clone comes up empty and the failure is reported
    /// to the sink.
    fn clone(&self) -> Self {
        let inner = self.inner.lock();
        let mut free_head = 0usize;
        let arena = inner.arena.as_ref().and_then(|src| {
            match RawArena::acquire(src.size(), Arc::clone(src.upstream())) {
                Err(e) => {
                    self.sink.emit(
                        Severity::Critical,
                        format_args!("{}: clone failed: {}", Self::TYPE_NAME, e),
                    );
                    None
                }
                Ok(dst) => unsafe {
                    ptr::copy_nonoverlapping(src.base(), dst.base(), src.size());
                    let src_base = src.base() as usize;
                    let dst_base = dst.base() as usize;
                    if inner.free_head != 0 {
                        free_head = dst_base + (inner.free_head - src_base);
                    }
                    // Patch pass over the source list; the copies carry
                    // stale links until rewritten.
                    let mut cur = inner.free_head as *mut u8;
                    while !cur.is_null() {
                        let header = load(cur);
                        if !header.next_free.is_null() {
                            let at = (dst_base + (cur as usize - src_base)) as *mut u8;
                            let mut copy = load(at);
                            copy.next_free =
                                (dst_base + (header.next_free as usize - src_base)) as *mut u8;
                            store(at, copy);
                        }
                        cur = header.next_free;
                    }
                    Some(dst)
                },
            }
        });
        self.sink.emit(
            Severity::Debug,
            format_args!("{}: copy constructed", Self::TYPE_NAME),
        );
        Self {
            inner: Mutex::new(Inner {
                arena,
                fit_mode: inner.fit_mode,
                free_head,
            }),
            sink: self.sink.clone(),
        }
    }
}

impl PartialEq for SortedListAlloc {
    /// Two allocators are equal iff they manage the same arena.
    fn eq(&self, other: &Self) -> bool {
        if ptr::eq(self, other) {
            return true;
        }
        matches!(
            (self.base_addr(), other.base_addr()),
            (Some(a), Some(b)) if a == b
        )
    }
}

impl Eq for SortedListAlloc {}

impl fmt::Debug for SortedListAlloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SortedListAlloc")
            .field("arena", &inner.arena)
            .field("fit_mode", &inner.fit_mode)
            .finish()
    }
}

impl Drop for SortedListAlloc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(arena) = &inner.arena {
            // Capture the size before the arena goes away; the release
            // itself happens in `RawArena::drop`.
            let size = arena.size();
            self.sink.emit(
                Severity::Debug,
                format_args!(
                    "{}: dropped, releasing the {}-byte arena",
                    Self::TYPE_NAME,
                    size
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_two_words() {
        assert_eq!(DESC_SIZE, 2 * mem::size_of::<usize>());
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let al = SortedListAlloc::new(1024).unwrap();
        assert_eq!(
            al.blocks_info(),
            vec![BlockInfo {
                size: 1024,
                occupied: false
            }]
        );
    }

    #[test]
    fn zero_rounds_to_one_quantum() {
        let al = SortedListAlloc::new(1024).unwrap();
        let p = al.allocate(0).unwrap();
        let blocks = al.blocks_info();
        assert_eq!(blocks[0].size, DESC_SIZE + MAX_ALIGN);
        assert!(blocks[0].occupied);
        al.deallocate(p).unwrap();
    }
}
