//! Block cache for a PowerPC recompiler.
//!
//! This crate owns the identity, lookup, linkage and invalidation of every
//! compiled block: the recompiler asks for a fresh [`Block`], fills it in and
//! publishes it; the dispatcher resolves the host entry for the current guest
//! state through [`BlockCache::dispatch`]; guest code writes tear overlapping
//! blocks down again through [`BlockCache::invalidate_icache`].
//!
//! Host code generation lives on the other side of the [`hooks`] traits. The
//! cache only records where emitted code is, never what it contains.

mod bitmap;
mod util;

pub mod block;
pub mod cache;
pub mod hooks;

pub use block::{Block, LinkData, PatchSite};
pub use cache::{BlockCache, BlockId};

pub use gekko;
