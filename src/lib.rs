//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! General-purpose byte suballocators over a single upstream-provided
//! arena.
//!
//! Each allocator obtains one fixed-size region from an upstream provider
//! at construction, sub-allocates requests of arbitrary size from it, and
//! releases it on drop. They share the same capability surface
//! ([`MemoryResource`], [`WithFitMode`], [`BlockIntrospection`]) and the
//! same runtime-selectable first/best/worst fit policy, but differ in
//! their bookkeeping:
//!
//! |            Name             |      Bookkeeping      | Allocate |  Coalesce   |
//! | --------------------------- | --------------------- | -------- | ----------- |
//! | [`BoundaryTagAlloc`]        | doubly-linked tags    | `O(N)`   | `O(1)`      |
//! | [`BuddyAlloc`]              | power-of-two buddies  | `O(N)`   | `O(log S)`  |
//! | [`SortedListAlloc`]         | address-ordered list  | `O(F)`   | `O(1)`      |
//!
//! (`N`: number of blocks, `F`: number of free blocks, `S`: pool size)
//!
//! Every instance owns one mutex; all operations serialize on it, so a
//! shared allocator is used from many threads through an `Arc`. An
//! optional [`DiagnosticSink`] receives a record for every state
//! transition.
//!
//! # Examples
//!
//! ```
//! use fitalloc::{BoundaryTagAlloc, BlockIntrospection, FitMode, WithFitMode};
//!
//! let al = BoundaryTagAlloc::new(1024).unwrap();
//! al.set_fit_mode(FitMode::Best);
//!
//! // Allocate and inspect
//! let p1 = al.allocate(100).unwrap();
//! let p2 = al.allocate(200).unwrap();
//! assert_eq!(al.blocks_info().iter().filter(|b| b.occupied).count(), 2);
//!
//! // Deallocate; adjacent free blocks coalesce eagerly
//! al.deallocate(p1).unwrap();
//! al.deallocate(p2).unwrap();
//! assert_eq!(al.blocks_info().len(), 1);
//! ```
pub mod arena;
pub mod boundary;
pub mod buddy;
pub mod diag;
pub mod resource;
pub mod sorted;

pub use self::arena::{SystemResource, UpstreamResource, MAX_ALIGN};
pub use self::boundary::BoundaryTagAlloc;
pub use self::buddy::BuddyAlloc;
pub use self::diag::{DiagnosticSink, LogSink, MemorySink, Severity};
pub use self::resource::{
    AllocConfig, AllocError, BlockInfo, BlockIntrospection, FitMode, MemoryResource, WithFitMode,
};
pub use self::sorted::SortedListAlloc;
