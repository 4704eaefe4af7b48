//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! Capability traits and common types shared by the allocators.
//!
//! Each allocator implements the same three small capabilities:
//!
//!  - [`MemoryResource`]: the `allocate`/`deallocate` contract.
//!  - [`WithFitMode`]: runtime selection of the block-fitting policy.
//!  - [`BlockIntrospection`]: a consistent snapshot of every block for
//!    inspection and testing.
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

use crate::arena::UpstreamResource;
use crate::diag::DiagnosticSink;

/// Policy used to choose among free blocks that satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FitMode {
    /// The first (lowest-address) qualifying block.
    First,
    /// The qualifying block with the least slack; ties go to the lowest
    /// address.
    Best,
    /// The largest qualifying block; ties go to the lowest address.
    Worst,
}

impl Default for FitMode {
    fn default() -> Self {
        FitMode::First
    }
}

/// A snapshot entry describing one block of an arena.
///
/// `size` counts every byte the block occupies, descriptor included, so
/// that the sizes of a full snapshot always sum to the arena size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub size: usize,
    pub occupied: bool,
}

/// Errors produced by the allocators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No free block can satisfy the request under the current fit mode.
    #[error("no free block can satisfy a request of {requested} bytes")]
    Exhausted { requested: usize },

    /// The pointer handed to `deallocate` is outside the arena or does not
    /// sit at a block boundary of this allocator.
    #[error("pointer {addr:#x} does not refer to a live block of this arena")]
    InvalidPointer { addr: usize },

    /// The target block is already free.
    #[error("block at {addr:#x} is already free")]
    DoubleFree { addr: usize },

    /// The construction parameter is outside the scheme's supported range.
    #[error("size {requested} is outside the valid range (minimum {minimum})")]
    InvalidSize { requested: usize, minimum: usize },

    /// The upstream provider could not supply the arena.
    #[error("upstream provider failed to supply {size} bytes")]
    UpstreamFailure { size: usize },

    /// The allocator's arena has been taken; only introspection and
    /// fit-mode access remain meaningful.
    #[error("allocator arena has been taken")]
    InvalidState,
}

/// Construction options accepted by every allocator.
///
/// The defaults are the process-default upstream ([`SystemResource`]), no
/// diagnostics, and first fit.
///
/// [`SystemResource`]: crate::arena::SystemResource
#[derive(Default, Clone)]
pub struct AllocConfig {
    /// Provider of the arena itself. `None` selects the system allocator.
    pub upstream: Option<Arc<dyn UpstreamResource>>,
    /// Sink for diagnostic records. `None` keeps the allocator silent.
    pub sink: Option<Arc<dyn DiagnosticSink>>,
    /// Initial fit mode.
    pub fit_mode: FitMode,
}

/// The uniform `allocate`/`deallocate` contract of a pluggable memory
/// resource.
pub trait MemoryResource {
    /// Allocate `size` bytes out of the arena.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return a block previously obtained from [`allocate`] on the same
    /// instance.
    ///
    /// Any other pointer is rejected with [`AllocError::InvalidPointer`]
    /// without mutating the arena.
    ///
    /// [`allocate`]: MemoryResource::allocate
    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError>;
}

/// Runtime-selectable fit policy.
///
/// The fit mode lives in the allocator header, which outlives the arena,
/// so the accessors never fail.
pub trait WithFitMode {
    fn fit_mode(&self) -> FitMode;

    fn set_fit_mode(&self, mode: FitMode);
}

/// Read-only enumeration of every block, free and occupied, in address
/// order.
pub trait BlockIntrospection {
    /// Take a consistent snapshot of the block layout.
    ///
    /// An allocator whose arena has been taken yields an empty snapshot.
    fn blocks_info(&self) -> Vec<BlockInfo>;
}

/// Sum of the free bytes in a snapshot, descriptor included.
pub(crate) fn free_total(blocks: &[BlockInfo]) -> usize {
    blocks
        .iter()
        .filter(|b| !b.occupied)
        .map(|b| b.size)
        .sum()
}

/// Render a snapshot the way the diagnostic records expect it, e.g.
/// `"occup 132 | avail 868"`.
pub(crate) fn render_blocks(blocks: &[BlockInfo]) -> String {
    let mut out = String::new();
    for (i, b) in blocks.iter().enumerate() {
        if i != 0 {
            out.push_str(" | ");
        }
        out.push_str(if b.occupied { "occup " } else { "avail " });
        out.push_str(&b.size.to_string());
    }
    out
}
