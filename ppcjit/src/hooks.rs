//! External collaborators the block cache drives.
//!
//! The cache runs on the CPU thread and holds no locks; everything here is
//! called synchronously from it, except [`Scheduler::schedule`], which is the
//! one entry point other threads reach (indirectly, through
//! [`BlockCache::schedule_clear`](crate::BlockCache::schedule_clear)).

use crate::{
    block::{Block, LinkData},
    cache::BlockCache,
};
use gekko::{Address, Cpu};

/// Guest MMU lookup.
pub trait Translate {
    /// Translates an effective instruction address into a physical address.
    fn translate_instr_addr(&self, addr: Address) -> Option<Address>;
}

/// The recompiler back-end: emits host code, owns the executable buffer, and
/// keeps per-address code generation hints the cache is allowed to edit.
pub trait Recompiler {
    /// Compiles and publishes a block covering `addr`. On return a matching
    /// block is expected in the registry and the fast map.
    fn compile<S, P>(&mut self, cache: &mut BlockCache<S, P>, cpu: &Cpu, addr: Address)
    where
        S: Scheduler,
        P: Profiler;

    /// Rewrites the jump at `exit`'s patch site to enter `dest`'s checked
    /// entry, or the generic dispatcher thunk when `dest` is absent.
    fn patch_exit(&mut self, exit: &LinkData, dest: Option<&Block>);

    /// Overwrites a destroyed block's entries with trap code, so reentering
    /// stale host code is caught during development.
    fn write_destroy_trap(&mut self, _block: &Block) {}

    /// Drops the FIFO-write and paired-quantize hints recorded for `addr`.
    fn discard_hints(&mut self, addr: Address);

    /// Drops every recorded code generation hint.
    fn clear_hints(&mut self);
}

/// Identifies an event registered with the [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(pub usize);

/// The CPU timing scheduler, used to defer a cache clear onto the CPU thread.
pub trait Scheduler {
    /// Registers a named event and returns the handle used to schedule it.
    fn register(&mut self, name: &'static str) -> EventHandle;

    /// Schedules a registered event to fire on the CPU thread after `delay`
    /// cycles. Callable from any thread; implementations synchronise
    /// internally.
    fn schedule(&self, handle: EventHandle, delay: u64);
}

/// Telemetry hook notified of every published code region.
pub trait Profiler {
    fn init(&mut self);
    fn shutdown(&mut self);

    /// Records an emitted code region under a display label.
    fn register(&mut self, entry: *const u8, size: u32, label: &str);
}
