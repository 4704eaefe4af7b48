//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! A general-purpose byte allocator based on boundary tags.
//!
//! The arena is a doubly-linked chain of variable-sized blocks. Every
//! block starts with a four-word descriptor; the payload immediately
//! follows it:
//!
//! ```text
//! | size+flag | back | forward | owner | payload ... | size+flag | ...
//! ^ block                              ^ user pointer
//! ```
//!
//! The low bit of the size word encodes occupancy (`1` = occupied), the
//! remaining bits the total block size, descriptor included. The chain is
//! kept in strictly ascending address order and no two adjacent blocks are
//! ever both free: deallocation coalesces eagerly in both directions.
//!
//! ## Memory Overhead
//!
//! Every allocation, the zero-sized one included, costs one descriptor
//! (four machine words). Block sizes are kept even so the occupancy bit
//! never collides with the size; an odd request therefore consumes one
//! extra byte.
//!
//! ## Complexity
//!
//! `allocate` and `deallocate` are linear in the number of blocks;
//! splitting and coalescing are constant-time once the block is found.
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::arena::{default_upstream, RawArena};
use crate::diag::{Severity, SinkHandle};
use crate::resource::{
    free_total, render_blocks, AllocConfig, AllocError, BlockInfo, BlockIntrospection, FitMode,
    MemoryResource, WithFitMode,
};

/// Descriptor prefixed to every block.
///
/// Blocks may start at any even offset, so all accesses go through
/// [`load`] / [`store`], which tolerate misalignment.
#[repr(C)]
#[derive(Clone, Copy)]
struct TagHeader {
    /// Total block size in bytes, descriptor included; low bit = occupied.
    size_flag: usize,
    /// Block start of the lower neighbour, null at the head.
    back: *mut u8,
    /// Block start of the upper neighbour, null at the tail.
    forward: *mut u8,
    /// Arena base, written at block creation and checked on deallocation.
    owner: *const u8,
}

const DESC_SIZE: usize = mem::size_of::<TagHeader>();

/// A split never leaves a free remainder with a payload smaller than this.
const MIN_PAYLOAD: usize = 4;

/// Smallest usable arena: one descriptor plus the minimum payload.
const MIN_ARENA: usize = DESC_SIZE + MIN_PAYLOAD;

unsafe fn load(at: *mut u8) -> TagHeader {
    ptr::read_unaligned(at as *const TagHeader)
}

unsafe fn store(at: *mut u8, header: TagHeader) {
    ptr::write_unaligned(at as *mut TagHeader, header);
}

unsafe fn block_size(at: *mut u8) -> usize {
    load(at).size_flag & !1usize
}

unsafe fn is_occupied(at: *mut u8) -> bool {
    load(at).size_flag & 1 == 1
}

unsafe fn set_occupied(at: *mut u8, occupied: bool) {
    let mut header = load(at);
    header.size_flag = if occupied {
        header.size_flag | 1
    } else {
        header.size_flag & !1usize
    };
    store(at, header);
}

/// Walk the chain and record every block. The caller holds the lock.
unsafe fn collect(arena: &RawArena) -> Vec<BlockInfo> {
    let mut result = Vec::new();
    let mut cur = arena.base();
    while !cur.is_null() {
        result.push(BlockInfo {
            size: block_size(cur),
            occupied: is_occupied(cur),
        });
        cur = load(cur).forward;
    }
    result
}

struct Inner {
    arena: Option<RawArena>,
    fit_mode: FitMode,
}

/// Boundary-tag allocator.
///
/// See [the module-level documentation](self) for the arena layout.
///
/// All public operations serialize on one internal mutex, so a shared
/// reference (e.g. through an `Arc`) can be used from many threads.
pub struct BoundaryTagAlloc {
    inner: Mutex<Inner>,
    sink: SinkHandle,
}

impl BoundaryTagAlloc {
    /// The name used in diagnostic records.
    pub const TYPE_NAME: &'static str = "boundary-tags";

    /// Construct an allocator over a fresh `size`-byte arena with the
    /// default configuration.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        Self::with_config(size, AllocConfig::default())
    }

    /// Construct an allocator over a fresh `size`-byte arena.
    ///
    /// `size` must leave room for at least one descriptor and
    /// [`MIN_PAYLOAD`](self) payload bytes. An odd `size` loses its
    /// trailing byte (block sizes are kept even).
    pub fn with_config(size: usize, config: AllocConfig) -> Result<Self, AllocError> {
        let sink = SinkHandle::new(config.sink);
        let usable = size & !1usize;
        if usable < MIN_ARENA {
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
        if usable != size {
            sink.emit(
                Severity::Warning,
                format_args!(
                    "{}: trailing byte of the {}-byte arena is unusable",
                    Self::TYPE_NAME,
                    size
                ),
            );
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
                TagHeader {
                    size_flag: usable,
                    back: ptr::null_mut(),
                    forward: ptr::null_mut(),
                    owner: arena.base(),
                },
            );
        }

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
            format_args!("{}: {} bytes available", Self::TYPE_NAME, usable),
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                arena: Some(arena),
                fit_mode: config.fit_mode,
            }),
            sink,
        })
    }

    /// Allocate `size` bytes.
    ///
    /// A zero-byte request produces a degenerate block holding only a
    /// descriptor; its pointer is valid for `deallocate` but must not be
    /// written through.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut inner = self.inner.lock();
        let fit_mode = inner.fit_mode;
        let arena = match inner.arena.as_mut() {
            Some(arena) => arena,
            None => {
                self.sink.emit(
                    Severity::Error,
                    format_args!("{}: allocate on an empty allocator", Self::TYPE_NAME),
                );
                return Err(AllocError::InvalidState);
            }
        };

        self.sink.emit(
            Severity::Debug,
            format_args!("{}: allocate({})", Self::TYPE_NAME, size),
        );

        // Round up to even so the occupancy bit stays clear of the size;
        // `r & !1` is `round_even(size + DESC_SIZE)` since `r` overshoots
        // by one.
        let required = match size.checked_add(DESC_SIZE + 1) {
            Some(r) => r & !1usize,
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
        };

        unsafe {
            let selected = Self::select(arena.base(), required, fit_mode);
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

            let selected_size = block_size(selected);
            if selected_size >= required + DESC_SIZE + MIN_PAYLOAD {
                let remainder = selected_size - required;
                let header = load(selected);
                let new_at = selected.add(required);
                store(
                    new_at,
                    TagHeader {
                        size_flag: remainder,
                        back: selected,
                        forward: header.forward,
                        owner: arena.base(),
                    },
                );
                if !header.forward.is_null() {
                    let mut next = load(header.forward);
                    next.back = new_at;
                    store(header.forward, next);
                }
                store(
                    selected,
                    TagHeader {
                        size_flag: required | (header.size_flag & 1),
                        back: header.back,
                        forward: new_at,
                        owner: arena.base(),
                    },
                );
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: split {} into {} + {}",
                        Self::TYPE_NAME,
                        selected_size,
                        required,
                        remainder
                    ),
                );
            }

            set_occupied(selected, true);
            self.report_state(arena);
            Ok(NonNull::new_unchecked(selected.add(DESC_SIZE)))
        }
    }

    /// Return a block previously obtained from [`allocate`].
    ///
    /// The pointer is validated against the chain; anything that is not
    /// the payload address of a live block is rejected with
    /// [`AllocError::InvalidPointer`] and the arena is left untouched.
    ///
    /// [`allocate`]: BoundaryTagAlloc::allocate
    pub fn deallocate(&self, ptr_: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr_.as_ptr() as usize;
        let mut inner = self.inner.lock();
        let arena = match inner.arena.as_mut() {
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

        unsafe {
            let block = Self::find_block(arena.base(), addr);
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
            if load(block).owner != arena.base() as *const u8 {
                self.sink.emit(
                    Severity::Critical,
                    format_args!(
                        "{}: descriptor at {:#x} carries a foreign owner tag",
                        Self::TYPE_NAME,
                        block as usize
                    ),
                );
                return Err(AllocError::InvalidPointer { addr });
            }
            if !is_occupied(block) {
                // Coalescing may already have absorbed the neighbourhood;
                // a stale pointer is indistinguishable from a foreign one.
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

            set_occupied(block, false);

            // Forward neighbour first, then backward; the order keeps the
            // surviving descriptor at the lowest address.
            let header = load(block);
            if !header.forward.is_null() && !is_occupied(header.forward) {
                let next = load(header.forward);
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: coalescing {} with the {} bytes ahead",
                        Self::TYPE_NAME,
                        block_size(block),
                        block_size(header.forward)
                    ),
                );
                let mut merged = load(block);
                merged.size_flag = block_size(block) + block_size(header.forward);
                merged.forward = next.forward;
                store(block, merged);
                if !next.forward.is_null() {
                    let mut after = load(next.forward);
                    after.back = block;
                    store(next.forward, after);
                }
            }

            let header = load(block);
            if !header.back.is_null() && !is_occupied(header.back) {
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: coalescing {} with the {} bytes behind",
                        Self::TYPE_NAME,
                        block_size(block),
                        block_size(header.back)
                    ),
                );
                let mut prev = load(header.back);
                prev.size_flag = block_size(header.back) + block_size(block);
                prev.forward = header.forward;
                store(header.back, prev);
                if !header.forward.is_null() {
                    let mut after = load(header.forward);
                    after.back = header.back;
                    store(header.forward, after);
                }
            }

            self.report_state(arena);
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

    /// Pick a free block of at least `required` bytes under `fit_mode`.
    /// Ties go to the lowest address in every mode.
    unsafe fn select(head: *mut u8, required: usize, fit_mode: FitMode) -> *mut u8 {
        let mut selected: *mut u8 = ptr::null_mut();
        let mut cur = head;
        while !cur.is_null() {
            let size = block_size(cur);
            if !is_occupied(cur) && size >= required {
                match fit_mode {
                    FitMode::First => {
                        selected = cur;
                        break;
                    }
                    FitMode::Best => {
                        if selected.is_null() || size < block_size(selected) {
                            selected = cur;
                        }
                    }
                    FitMode::Worst => {
                        if selected.is_null() || size > block_size(selected) {
                            selected = cur;
                        }
                    }
                }
            }
            cur = load(cur).forward;
        }
        selected
    }

    /// Find the block whose payload address is exactly `addr`.
    unsafe fn find_block(head: *mut u8, addr: usize) -> *mut u8 {
        let mut cur = head;
        while !cur.is_null() {
            let payload = cur as usize + DESC_SIZE;
            if payload == addr {
                return cur;
            }
            if payload > addr {
                // The chain is address-ordered; nothing ahead can match.
                break;
            }
            cur = load(cur).forward;
        }
        ptr::null_mut()
    }

    /// Emit the post-mutation snapshot and the free-byte total.
    unsafe fn report_state(&self, arena: &RawArena) {
        if !self.sink.is_attached() {
            return;
        }
        let blocks = collect(arena);
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

impl MemoryResource for BoundaryTagAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        BoundaryTagAlloc::allocate(self, size)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        BoundaryTagAlloc::deallocate(self, ptr)
    }
}

impl WithFitMode for BoundaryTagAlloc {
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

impl BlockIntrospection for BoundaryTagAlloc {
    fn blocks_info(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock();
        match &inner.arena {
            Some(arena) => unsafe { collect(arena) },
            None => Vec::new(),
        }
    }
}

impl Clone for BoundaryTagAlloc {
    /// Deep-copy the arena.
    ///
    /// The copy is taken from the default upstream, the bytes are copied
    /// verbatim, and every intra-arena link is rewritten by the
    /// base-address delta. If the upstream cannot supply the new arena the
    /// clone comes up empty and the failure is reported to the sink.
    fn clone(&self) -> Self {
        let inner = self.inner.lock();
        let arena = inner.arena.as_ref().and_then(|src| {
            match RawArena::acquire(src.size(), default_upstream()) {
                Err(e) => {
                    self.sink.emit(
                        Severity::Critical,
                        format_args!("{}: clone failed: {}", Self::TYPE_NAME, e),
                    );
                    None
                }
                Ok(dst) => unsafe {
                    ptr::copy_nonoverlapping(src.base(), dst.base(), src.size());
                    // Patch pass: walk the source chain (its links are the
                    // intact ones) and rewrite the corresponding copies.
                    let mut cur = src.base();
                    while !cur.is_null() {
                        let offset = cur as usize - src.base() as usize;
                        let at = dst.base().add(offset);
                        let mut header = load(at);
                        if !header.back.is_null() {
                            header.back =
                                dst.base().add(header.back as usize - src.base() as usize);
                        }
                        if !header.forward.is_null() {
                            header.forward =
                                dst.base().add(header.forward as usize - src.base() as usize);
                        }
                        header.owner = dst.base();
                        store(at, header);
                        cur = load(cur).forward;
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
            }),
            sink: self.sink.clone(),
        }
    }
}

impl PartialEq for BoundaryTagAlloc {
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

impl Eq for BoundaryTagAlloc {}

impl fmt::Debug for BoundaryTagAlloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundaryTagAlloc")
            .field("arena", &inner.arena)
            .field("fit_mode", &inner.fit_mode)
            .finish()
    }
}

impl Drop for BoundaryTagAlloc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(arena) = &inner.arena {
            self.sink.emit(
                Severity::Debug,
                format_args!(
                    "{}: dropped, releasing the {}-byte arena",
                    Self::TYPE_NAME,
                    arena.size()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_unaligned() {
        let mut buf = vec![0u8; DESC_SIZE + 1];
        let at = unsafe { buf.as_mut_ptr().add(1) };
        let header = TagHeader {
            size_flag: 1001,
            back: 0x10 as *mut u8,
            forward: 0x20 as *mut u8,
            owner: 0x30 as *const u8,
        };
        unsafe {
            store(at, header);
            assert_eq!(block_size(at), 1000);
            assert!(is_occupied(at));
            set_occupied(at, false);
            assert_eq!(load(at).size_flag, 1000);
            assert_eq!(load(at).back, 0x10 as *mut u8);
            assert_eq!(load(at).forward, 0x20 as *mut u8);
        }
    }

    #[test]
    fn descriptor_is_four_words() {
        assert_eq!(DESC_SIZE, 4 * mem::size_of::<usize>());
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let al = BoundaryTagAlloc::new(1000).unwrap();
        assert_eq!(
            al.blocks_info(),
            vec![BlockInfo {
                size: 1000,
                occupied: false
            }]
        );
    }
}
