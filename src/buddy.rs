//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! A general-purpose byte allocator based on the buddy system.
//!
//! The arena is a pool of `2^K` bytes. Every block starts with a one-byte
//! descriptor packing `{occupied, order}` (1 + 7 bits); a block of order
//! `k` spans `2^k` bytes, descriptor included, and is aligned to `2^k`
//! within the pool. The buddy of the block at pool offset `o` is the block
//! at `o ^ 2^k`; two buddies merge when both are free and of equal order.
//!
//! No free list is kept: blocks are enumerated by walking the pool in
//! address order, jumping by each block's size.
//!
//! The first word of a block's payload holds a back-reference to its own
//! descriptor; the pointer handed to the caller points just past it.
//! A `2^k` block therefore serves requests of up to
//! `2^k - 1 - size_of::<usize>()` bytes.
//!
//! ## Complexity
//!
//! Splitting and merging are `O(K)`; finding a block is a pool walk,
//! `O(2^K / 2^min_order)` in the worst case.
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{default_upstream, RawArena};
use crate::diag::{Severity, SinkHandle};
use crate::resource::{
    free_total, render_blocks, AllocConfig, AllocError, BlockInfo, BlockIntrospection, FitMode,
    MemoryResource, WithFitMode,
};

const META_SIZE: usize = 1;
const PTR_SIZE: usize = mem::size_of::<usize>();

/// Smallest block order: room for the descriptor byte, the back-reference
/// word, and a handful of payload bytes.
pub const MIN_ORDER: u32 = 4;

/// Largest accepted pool order. Keeps `1 << order` comfortably inside
/// `isize` territory; real arenas are far smaller anyway.
pub const MAX_ORDER: u32 = 57;

unsafe fn read_meta(desc: *mut u8) -> (u32, bool) {
    let byte = *desc;
    ((byte >> 1) as u32, byte & 1 == 1)
}

unsafe fn write_meta(desc: *mut u8, order: u32, occupied: bool) {
    *desc = ((order as u8) << 1) | occupied as u8;
}

/// Pool order that serves a `size`-byte request: the descriptor byte and
/// the back-reference word ride along. `None` on arithmetic overflow.
fn order_for(size: usize) -> Option<u32> {
    let needed = size.checked_add(META_SIZE + PTR_SIZE)?;
    let rounded = needed.checked_next_power_of_two()?;
    Some(rounded.trailing_zeros().max(MIN_ORDER))
}

/// Walk the pool and record every block. The caller holds the lock.
unsafe fn collect(arena: &RawArena) -> Vec<BlockInfo> {
    let mut result = Vec::new();
    let mut offset = 0;
    while offset < arena.size() {
        let (order, occupied) = read_meta(arena.base().add(offset));
        result.push(BlockInfo {
            size: 1 << order,
            occupied,
        });
        offset += 1 << order;
    }
    result
}

struct Inner {
    arena: Option<RawArena>,
    fit_mode: FitMode,
}

/// Buddy-system allocator.
///
/// See [the module-level documentation](self) for the pool layout.
///
/// All public operations serialize on one internal mutex, so a shared
/// reference (e.g. through an `Arc`) can be used from many threads.
pub struct BuddyAlloc {
    inner: Mutex<Inner>,
    sink: SinkHandle,
}

impl BuddyAlloc {
    /// The name used in diagnostic records.
    pub const TYPE_NAME: &'static str = "buddy-system";

    /// Construct an allocator over a fresh `2^order`-byte pool with the
    /// default configuration.
    pub fn new(order: u32) -> Result<Self, AllocError> {
        Self::with_config(order, AllocConfig::default())
    }

    /// Construct an allocator over a fresh `2^order`-byte pool.
    ///
    /// `order` must lie in [`MIN_ORDER`]`..=`[`MAX_ORDER`].
    pub fn with_config(order: u32, config: AllocConfig) -> Result<Self, AllocError> {
        let sink = SinkHandle::new(config.sink);
        if order < MIN_ORDER || order > MAX_ORDER {
            sink.emit(
                Severity::Error,
                format_args!(
                    "{}: pool order {} is outside {}..={}",
                    Self::TYPE_NAME,
                    order,
                    MIN_ORDER,
                    MAX_ORDER
                ),
            );
            return Err(AllocError::InvalidSize {
                requested: order as usize,
                minimum: MIN_ORDER as usize,
            });
        }

        let pool_size = 1usize << order;
        let upstream = config.upstream.unwrap_or_else(default_upstream);
        let arena = RawArena::acquire(pool_size, upstream).map_err(|e| {
            sink.emit(
                Severity::Critical,
                format_args!("{}: pool acquisition failed: {}", Self::TYPE_NAME, e),
            );
            e
        })?;

        unsafe {
            write_meta(arena.base(), order, false);
        }

        sink.emit(
            Severity::Debug,
            format_args!(
                "{}: constructed over a 2^{} = {}-byte pool",
                Self::TYPE_NAME,
                order,
                pool_size
            ),
        );
        sink.emit(
            Severity::Information,
            format_args!("{}: {} bytes available", Self::TYPE_NAME, pool_size),
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
    /// The chosen block has the smallest order whose `2^k` bytes cover the
    /// request plus the descriptor byte and the back-reference word. A
    /// zero-byte request succeeds with a minimum-order block.
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
        let pool_order = arena.size().trailing_zeros();

        self.sink.emit(
            Severity::Debug,
            format_args!("{}: allocate({})", Self::TYPE_NAME, size),
        );

        let order = match order_for(size) {
            Some(order) if order <= pool_order => order,
            _ => {
                self.sink.emit(
                    Severity::Error,
                    format_args!(
                        "{}: request of {} bytes exceeds the pool",
                        Self::TYPE_NAME,
                        size
                    ),
                );
                return Err(AllocError::Exhausted { requested: size });
            }
        };

        unsafe {
            let base = arena.base();
            let selected = Self::select(arena, order, fit_mode);
            let (offset, selected_order) = match selected {
                Some(found) => found,
                None => {
                    self.sink.emit(
                        Severity::Error,
                        format_args!(
                            "{}: no free block of order >= {} ({:?} fit)",
                            Self::TYPE_NAME,
                            order,
                            fit_mode
                        ),
                    );
                    return Err(AllocError::Exhausted { requested: size });
                }
            };

            // Halve the block until it matches the requested order; each
            // halving leaves the upper half behind as the new free buddy.
            let desc = base.add(offset);
            let mut current = selected_order;
            while current > order {
                current -= 1;
                write_meta(desc, current, false);
                write_meta(base.add(offset + (1usize << current)), current, false);
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: split order {} into two of order {}",
                        Self::TYPE_NAME,
                        current + 1,
                        current
                    ),
                );
            }
            write_meta(desc, order, true);

            let payload = desc.add(META_SIZE);
            ptr::write_unaligned(payload as *mut usize, desc as usize);

            self.report_state(arena);
            Ok(NonNull::new_unchecked(payload.add(PTR_SIZE)))
        }
    }

    /// Return a block previously obtained from [`allocate`].
    ///
    /// The back-reference word is cross-checked against the position the
    /// user pointer implies, the descriptor's order and alignment are
    /// validated, and a block that is already free is reported as
    /// [`AllocError::DoubleFree`].
    ///
    /// [`allocate`]: BuddyAlloc::allocate
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
        let pool_order = arena.size().trailing_zeros();
        let base_addr = arena.base() as usize;

        self.sink.emit(
            Severity::Debug,
            format_args!("{}: deallocate({:#x})", Self::TYPE_NAME, addr),
        );

        let reject = |what: &str| {
            self.sink.emit(
                Severity::Error,
                format_args!("{}: deallocate({:#x}): {}", Self::TYPE_NAME, addr, what),
            );
            Err(AllocError::InvalidPointer { addr })
        };

        // The payload layout fixes the descriptor at a known distance
        // below the user pointer.
        if addr < base_addr + META_SIZE + PTR_SIZE || addr > base_addr + arena.size() {
            return reject("outside the pool");
        }
        let desc_addr = addr - PTR_SIZE - META_SIZE;

        unsafe {
            let stored = ptr::read_unaligned((addr - PTR_SIZE) as *const usize);
            if stored != desc_addr {
                return reject("back-reference does not match the descriptor position");
            }

            let desc = desc_addr as *mut u8;
            let (order, occupied) = read_meta(desc);
            let mut offset = desc_addr - base_addr;
            if order < MIN_ORDER
                || order > pool_order
                || offset & ((1usize << order) - 1) != 0
            {
                return reject("descriptor is not a valid block boundary");
            }
            if !occupied {
                self.sink.emit(
                    Severity::Error,
                    format_args!(
                        "{}: deallocate({:#x}): block is already free",
                        Self::TYPE_NAME,
                        addr
                    ),
                );
                return Err(AllocError::DoubleFree { addr });
            }

            write_meta(desc, order, false);

            // Climb the buddy tree while the sibling is free and intact.
            let base = arena.base();
            let mut order = order;
            while order < pool_order {
                let buddy_offset = offset ^ (1usize << order);
                let (buddy_order, buddy_occupied) = read_meta(base.add(buddy_offset));
                if buddy_occupied || buddy_order != order {
                    break;
                }
                self.sink.emit(
                    Severity::Debug,
                    format_args!(
                        "{}: merging buddies of order {} at {:#x}/{:#x}",
                        Self::TYPE_NAME,
                        order,
                        offset,
                        buddy_offset
                    ),
                );
                offset = offset.min(buddy_offset);
                order += 1;
                write_meta(base.add(offset), order, false);
            }

            self.report_state(arena);
        }
        Ok(())
    }

    /// Hand the pool over to a fresh instance, leaving this one empty.
    ///
    /// Further `allocate`/`deallocate` calls on `self` fail with
    /// [`AllocError::InvalidState`] and `blocks_info` yields nothing.
    pub fn take(&mut self) -> Self {
        let inner = self.inner.get_mut();
        let arena = inner.arena.take();
        if arena.is_some() {
            self.sink.emit(
                Severity::Debug,
                format_args!("{}: pool transferred to a new instance", Self::TYPE_NAME),
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

    /// Pick a free block of order at least `order` under `fit_mode`,
    /// returning its pool offset and order. Ties go to the lowest address
    /// in every mode.
    unsafe fn select(arena: &RawArena, order: u32, fit_mode: FitMode) -> Option<(usize, u32)> {
        let base = arena.base();
        let mut selected: Option<(usize, u32)> = None;
        let mut offset = 0;
        while offset < arena.size() {
            let (block_order, occupied) = read_meta(base.add(offset));
            if !occupied && block_order >= order {
                match fit_mode {
                    FitMode::First => return Some((offset, block_order)),
                    FitMode::Best => {
                        if selected.map_or(true, |(_, o)| block_order < o) {
                            selected = Some((offset, block_order));
                        }
                    }
                    FitMode::Worst => {
                        if selected.map_or(true, |(_, o)| block_order > o) {
                            selected = Some((offset, block_order));
                        }
                    }
                }
            }
            offset += 1usize << block_order;
        }
        selected
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

impl MemoryResource for BuddyAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        BuddyAlloc::allocate(self, size)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        BuddyAlloc::deallocate(self, ptr)
    }
}

impl WithFitMode for BuddyAlloc {
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

impl BlockIntrospection for BuddyAlloc {
    fn blocks_info(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock();
        match &inner.arena {
            Some(arena) => unsafe { collect(arena) },
            None => Vec::new(),
        }
    }
}

impl Clone for BuddyAlloc {
    /// Deep-copy the pool.
    ///
    /// The copy is taken from the source's upstream and the bytes are
    /// copied verbatim; the back-reference word of every occupied block is
    /// then rewritten for the new base address. If the upstream cannot
    /// supply the new pool the clone comes up empty and the failure is
    /// reported to the sink.
    fn clone(&self) -> Self {
        let inner = self.inner.lock();
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
                    let mut offset = 0;
                    while offset < dst.size() {
                        let desc = dst.base().add(offset);
                        let (order, occupied) = read_meta(desc);
                        if occupied {
                            let payload = desc.add(META_SIZE);
                            ptr::write_unaligned(payload as *mut usize, desc as usize);
                        }
                        offset += 1usize << order;
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

impl PartialEq for BuddyAlloc {
    /// Two allocators are equal iff they manage the same pool.
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

impl Eq for BuddyAlloc {}

impl fmt::Debug for BuddyAlloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BuddyAlloc")
            .field("arena", &inner.arena)
            .field("fit_mode", &inner.fit_mode)
            .finish()
    }
}

impl Drop for BuddyAlloc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(arena) = &inner.arena {
            self.sink.emit(
                Severity::Debug,
                format_args!(
                    "{}: dropped, releasing the {}-byte pool",
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
    fn meta_byte_packing() {
        let mut byte = 0u8;
        let desc = &mut byte as *mut u8;
        unsafe {
            write_meta(desc, 10, true);
            assert_eq!(read_meta(desc), (10, true));
            write_meta(desc, MIN_ORDER, false);
            assert_eq!(read_meta(desc), (MIN_ORDER, false));
        }
        assert_eq!(byte, (MIN_ORDER as u8) << 1);
    }

    #[test]
    fn order_selection() {
        // 100 bytes plus the descriptor byte and the back-reference word
        // need 109 bytes, i.e. order 7.
        assert_eq!(order_for(100), Some(7));
        // Tiny requests clamp to the minimum order.
        assert_eq!(order_for(0), Some(MIN_ORDER));
        assert_eq!(order_for(1), Some(MIN_ORDER));
        // The descriptor byte pushes an exact fit to the next order.
        assert_eq!(order_for(120), Some(8));
        assert_eq!(order_for(usize::MAX), None);
    }

    #[test]
    fn fresh_pool_is_one_free_block() {
        let al = BuddyAlloc::new(10).unwrap();
        assert_eq!(
            al.blocks_info(),
            vec![BlockInfo {
                size: 1024,
                occupied: false
            }]
        );
    }
}
