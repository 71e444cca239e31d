//! The block cache: four overlapping indices over cache-owned block storage,
//! kept mutually consistent under publication, dispatch, linking and
//! invalidation.

use crate::{
    bitmap::{CHUNK_SIZE, ChunkBitmap},
    block::Block,
    hooks::{EventHandle, Profiler, Recompiler, Scheduler, Translate},
    util::boxed_array,
};
use gekko::{Address, Cpu, MachineState};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{SlotMap, new_key_type};
use std::collections::BTreeMap;
use tracing::{info, trace};

/// MSR bits that must match for two translations to be interchangeable: the
/// instruction and data address translation bits.
pub const MSR_MASK: u32 = 0x30;

/// Byte size of a range-index bucket. A typical block spans one or two
/// buckets.
pub const RANGE_BUCKET: u32 = 0x100;

/// Number of fast-map slots.
pub const FAST_MAP_LEN: usize = 1 << 16;

new_key_type! {
    /// Identifier of a block owned by a [`BlockCache`].
    pub struct BlockId;
}

/// Fast-map slot of an effective address.
#[inline(always)]
fn fast_index(addr: Address) -> usize {
    (addr.value() >> 2) as usize & (FAST_MAP_LEN - 1)
}

/// Bucket-aligned addresses intersecting the byte span `[start, end)`.
fn range_buckets(start: u64, end: u64) -> impl Iterator<Item = Address> {
    let mask = !(RANGE_BUCKET as u64 - 1);
    let first = start & mask;
    let last = end.saturating_sub(1) & mask;

    (first..=last)
        .step_by(RANGE_BUCKET as usize)
        .map(|bucket| Address(bucket as u32))
}

/// Cache of every compiled block, owned by the CPU thread.
///
/// Blocks live in a slotmap; every index below refers to them by id, so
/// destroying a block only has to chase ids, never pointers. The fast map is
/// the dispatch hot path and is never authoritative: a probe must revalidate
/// the effective address and MSR bits before trusting the slot.
pub struct BlockCache<S, P> {
    /// Owner of every block record.
    storage: SlotMap<BlockId, Block>,
    /// Authoritative multimap from physical address to the blocks compiled
    /// there. Several blocks may share a key, differing in effective address
    /// or MSR bits.
    by_physical: FxHashMap<Address, Vec<BlockId>>,
    /// Ordered bucket map from aligned physical address to the blocks
    /// touching that bucket. Drives range invalidation.
    ranges: BTreeMap<Address, FxHashSet<BlockId>>,
    /// Reverse index from exit effective address to the blocks whose emitted
    /// code exits there.
    links_to: FxHashMap<Address, Vec<BlockId>>,
    /// One valid bit per 32-byte physical chunk covered by a live block.
    valid_chunks: ChunkBitmap,
    /// Direct-mapped probe table for dispatch.
    fast_map: Box<[Option<BlockId>; FAST_MAP_LEN]>,

    scheduler: S,
    profiler: P,
    clear_event: EventHandle,
}

impl<S, P> BlockCache<S, P>
where
    S: Scheduler,
    P: Profiler,
{
    pub fn new(mut scheduler: S, mut profiler: P) -> Self {
        let clear_event = scheduler.register("clear block cache");
        profiler.init();

        Self {
            storage: SlotMap::with_key(),
            by_physical: FxHashMap::default(),
            ranges: BTreeMap::new(),
            links_to: FxHashMap::default(),
            valid_chunks: ChunkBitmap::new(),
            fast_map: boxed_array(None),
            scheduler,
            profiler,
            clear_event,
        }
    }

    /// Tears down profiler registration.
    pub fn shutdown(&mut self) {
        self.profiler.shutdown();
    }

    /// Shuts telemetry down, brings it back up and drops every block.
    pub fn reset<R: Recompiler>(&mut self, recompiler: &mut R) {
        self.profiler.shutdown();
        self.profiler.init();
        self.clear(recompiler);
    }

    /// Requests a full [`clear`](Self::clear) through the scheduler, to run
    /// on the CPU thread between dispatches. The only operation other threads
    /// may call.
    pub fn schedule_clear(&self) {
        self.scheduler.schedule(self.clear_event, 0);
    }

    /// Destroys every block and empties all indices, including the
    /// recompiler's code generation hints.
    ///
    /// Host code buffers are not reclaimed here; the recompiler bulk-resets
    /// its buffer on its own schedule.
    pub fn clear<R: Recompiler>(&mut self, recompiler: &mut R) {
        info!(blocks = self.storage.len(), "clearing block cache");

        recompiler.clear_hints();

        let ids: Vec<BlockId> = self.storage.keys().collect();
        for id in ids {
            self.destroy_block(recompiler, id);
        }

        self.storage.clear();
        self.by_physical.clear();
        self.links_to.clear();
        self.ranges.clear();
        self.valid_chunks.clear_all();
        self.fast_map.fill(None);
    }

    /// Creates an empty block record for the recompiler to populate through
    /// [`block_mut`](Self::block_mut), registered under the physical
    /// translation of `em_address` and the current masked MSR.
    ///
    /// Returns `None` when `em_address` does not translate; the recompiler is
    /// expected to have checked before compiling.
    pub fn allocate(
        &mut self,
        mmu: &impl Translate,
        cpu: &Cpu,
        em_address: Address,
    ) -> Option<BlockId> {
        let physical = mmu.translate_instr_addr(em_address)?;
        let msr_bits = cpu.msr.to_bits() & MSR_MASK;

        let id = self.storage.insert(Block::new(em_address, physical, msr_bits));
        self.by_physical.entry(physical).or_default().push(id);

        Some(id)
    }

    #[inline(always)]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.storage[id]
    }

    /// Mutable access to a block between [`allocate`](Self::allocate) and
    /// [`finalize`](Self::finalize). Published blocks must not be changed.
    #[inline(always)]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.storage[id]
    }

    /// Publishes a populated block: installs it in the fast map, marks its
    /// physical chunks valid, files it in the range index and, when `link` is
    /// set, wires it into the link graph and patches every exit that already
    /// resolves (in both directions).
    pub fn finalize<R: Recompiler>(
        &mut self,
        mmu: &impl Translate,
        recompiler: &mut R,
        id: BlockId,
        link: bool,
    ) {
        let (effective, physical, checked_entry, code_size) = {
            let block = &self.storage[id];
            debug_assert!(block.original_size > 0);
            (
                block.effective_address,
                block.physical_address,
                block.checked_entry,
                block.code_size,
            )
        };

        let slot = fast_index(effective);
        self.fast_map[slot] = Some(id);
        self.storage[id].fast_map_slot = Some(slot);

        let start = physical.value() as u64;
        let end = start + 4 * self.storage[id].original_size as u64;

        for chunk in start / CHUNK_SIZE as u64..=(end - 1) / CHUNK_SIZE as u64 {
            self.valid_chunks.set(chunk as u32);
        }

        for bucket in range_buckets(start, end) {
            self.ranges.entry(bucket).or_default().insert(id);
        }

        if link {
            let exits: Vec<Address> = self.storage[id]
                .link_data
                .iter()
                .map(|exit| exit.exit_address)
                .collect();
            for exit in exits {
                self.links_to.entry(exit).or_default().push(id);
            }

            self.link_block(mmu, recompiler, id);
        }

        self.profiler.register(
            checked_entry,
            code_size,
            &format!("jit_ppc_0x{:08X}", physical.value()),
        );
    }

    fn find(&self, mmu: &impl Translate, addr: Address, msr: u32) -> Option<BlockId> {
        let physical = if MachineState::from_bits(msr).instr_addr_translation() {
            mmu.translate_instr_addr(addr)?
        } else {
            addr
        };

        let candidates = self.by_physical.get(&physical)?;
        candidates.iter().copied().find(|&id| {
            let block = &self.storage[id];
            block.effective_address == addr && block.msr_bits == (msr & MSR_MASK)
        })
    }

    /// Looks up the block compiled at `addr` under `msr`. The address is
    /// translated only when instruction translation is enabled in `msr`;
    /// otherwise it is the physical key itself.
    pub fn get_block(&self, mmu: &impl Translate, addr: Address, msr: u32) -> Option<&Block> {
        self.find(mmu, addr, msr).map(|id| &self.storage[id])
    }

    /// Resolves the host entry for the current guest state. Probes the fast
    /// map, revalidates, and on a miss pulls the matching block in from the
    /// registry, compiling a fresh one through the recompiler if none exists.
    #[inline(always)]
    pub fn dispatch<R: Recompiler>(
        &mut self,
        mmu: &impl Translate,
        recompiler: &mut R,
        cpu: &Cpu,
    ) -> *const u8 {
        let msr_bits = cpu.msr.to_bits() & MSR_MASK;

        loop {
            if let Some(id) = self.fast_map[fast_index(cpu.pc)] {
                let block = &self.storage[id];
                if block.effective_address == cpu.pc && block.msr_bits == msr_bits {
                    return block.normal_entry;
                }
            }

            self.move_into_fast_cache(mmu, recompiler, cpu, cpu.pc, msr_bits);
        }
    }

    fn move_into_fast_cache<R: Recompiler>(
        &mut self,
        mmu: &impl Translate,
        recompiler: &mut R,
        cpu: &Cpu,
        addr: Address,
        msr: u32,
    ) {
        let Some(id) = self.find(mmu, addr, msr) else {
            recompiler.compile(self, cpu, addr);
            return;
        };

        // drop the stale slot, unless a collision already took it over
        if let Some(old) = self.storage[id].fast_map_slot
            && self.fast_map[old] == Some(id)
        {
            self.fast_map[old] = None;
        }

        let slot = fast_index(addr);
        self.fast_map[slot] = Some(id);
        self.storage[id].fast_map_slot = Some(slot);

        self.link_block(mmu, recompiler, id);
    }

    /// Destroys every block whose guest code intersects
    /// `[address, address + length)`.
    ///
    /// `forced` marks a coherence flush that is known not to have changed any
    /// bytes; the recompiler's code generation hints survive it. A plain
    /// write (`forced == false`) also drops the hints recorded inside the
    /// range.
    pub fn invalidate_icache<R: Recompiler>(
        &mut self,
        mmu: &impl Translate,
        recompiler: &mut R,
        address: Address,
        length: u32,
        forced: bool,
    ) {
        let Some(physical) = mmu.translate_instr_addr(address) else {
            return;
        };

        // the common case: a single cache line flushed by dcb*/icbi. One bit
        // probe answers "was anything ever compiled here".
        if length == CHUNK_SIZE {
            let chunk = physical.value() / CHUNK_SIZE;
            if !self.valid_chunks.test(chunk) {
                return;
            }
            self.valid_chunks.clear(chunk);
        }

        let mut destroyed = 0usize;

        let start = physical.align_down(RANGE_BUCKET);
        let end = (physical.value() as u64 + length as u64).min(u32::MAX as u64) as u32;

        let buckets: Vec<Address> = self
            .ranges
            .range(start..Address(end))
            .map(|(bucket, _)| *bucket)
            .collect();

        for bucket in buckets {
            let Some(set) = self.ranges.get(&bucket) else {
                continue;
            };

            let victims: Vec<BlockId> = set
                .iter()
                .copied()
                .filter(|&id| self.storage[id].overlaps(physical, length))
                .collect();

            for id in victims {
                self.remove_from_ranges(id);
                self.destroy_block(recompiler, id);

                let block = self.storage.remove(id).unwrap();
                if let Some(ids) = self.by_physical.get_mut(&block.physical_address) {
                    ids.retain(|&other| other != id);
                    if ids.is_empty() {
                        self.by_physical.remove(&block.physical_address);
                    }
                }

                destroyed += 1;
            }

            // reap the bucket if the walk emptied it; buckets emptied behind
            // our back by cross-bucket removal are left for a later walk
            if self.ranges.get(&bucket).is_some_and(|set| set.is_empty()) {
                self.ranges.remove(&bucket);
            }
        }

        if destroyed > 0 {
            trace!(%address, length, destroyed, "invalidated compiled blocks");
        }

        // a genuine code write also invalidates the hints recorded for it
        if !forced {
            let start = address.value() as u64;
            for addr in (start..start + length as u64).step_by(4) {
                recompiler.discard_hints(Address(addr as u32));
            }
        }
    }

    fn remove_from_ranges(&mut self, id: BlockId) {
        let block = &self.storage[id];
        let start = block.physical_address.value() as u64;
        let end = start + 4 * block.original_size as u64;

        for bucket in range_buckets(start, end) {
            if let Some(set) = self.ranges.get_mut(&bucket) {
                set.remove(&id);
            }
        }
    }

    /// Unwires a block from the fast map, the link graph and every source
    /// block jumping into it. The caller is responsible for taking it out of
    /// storage, the registry and the range index.
    fn destroy_block<R: Recompiler>(&mut self, recompiler: &mut R, id: BlockId) {
        if let Some(slot) = self.storage[id].fast_map_slot
            && self.fast_map[slot] == Some(id)
        {
            self.fast_map[slot] = None;
        }

        self.unlink_block(recompiler, id);

        // the block's own exits disappear with it
        let exits: Vec<Address> = self.storage[id]
            .link_data
            .iter()
            .map(|exit| exit.exit_address)
            .collect();
        for exit in exits {
            if let Some(sources) = self.links_to.get_mut(&exit) {
                sources.retain(|&source| source != id);
                if sources.is_empty() {
                    self.links_to.remove(&exit);
                }
            }
        }

        recompiler.write_destroy_trap(&self.storage[id]);
    }

    /// Points every inbound exit of `id` back at the dispatcher thunk. The
    /// sources keep their link graph entries; their exits still exist.
    fn unlink_block<R: Recompiler>(&mut self, recompiler: &mut R, id: BlockId) {
        let (effective, msr_bits) = {
            let block = &self.storage[id];
            (block.effective_address, block.msr_bits)
        };

        let Some(sources) = self.links_to.get(&effective) else {
            return;
        };
        let sources = sources.clone();

        for source in sources {
            if self.storage[source].msr_bits != msr_bits {
                continue;
            }

            for i in 0..self.storage[source].link_data.len() {
                if self.storage[source].link_data[i].exit_address != effective {
                    continue;
                }

                recompiler.patch_exit(&self.storage[source].link_data[i], None);
                self.storage[source].link_data[i].linked = false;
            }
        }
    }

    /// Patches every still-unlinked exit of `id` whose destination now exists.
    fn link_block_exits<R: Recompiler>(
        &mut self,
        mmu: &impl Translate,
        recompiler: &mut R,
        id: BlockId,
    ) {
        for i in 0..self.storage[id].link_data.len() {
            if self.storage[id].link_data[i].linked {
                continue;
            }

            let exit_address = self.storage[id].link_data[i].exit_address;
            let msr_bits = self.storage[id].msr_bits;

            if let Some(dest) = self.find(mmu, exit_address, msr_bits) {
                recompiler.patch_exit(&self.storage[id].link_data[i], Some(&self.storage[dest]));
                self.storage[id].link_data[i].linked = true;
            }
        }
    }

    /// Links `id`'s own exits, then retries every source block that exits to
    /// `id`'s entry, so inbound jumps newly resolvable by `id` get patched.
    fn link_block<R: Recompiler>(&mut self, mmu: &impl Translate, recompiler: &mut R, id: BlockId) {
        self.link_block_exits(mmu, recompiler, id);

        let effective = self.storage[id].effective_address;
        let msr_bits = self.storage[id].msr_bits;

        let Some(sources) = self.links_to.get(&effective) else {
            return;
        };
        let sources = sources.clone();

        for source in sources {
            if self.storage[source].msr_bits == msr_bits {
                self.link_block_exits(mmu, recompiler, source);
            }
        }
    }

    /// Iterates over every live block.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.storage.values()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The raw fast map, handed to the generated dispatch prologue for its
    /// inline fast path.
    pub fn fast_map(&self) -> &[Option<BlockId>] {
        &self.fast_map[..]
    }

    /// Raw view of the valid-chunk bitmap backing words, for debug tooling.
    pub fn valid_chunks(&self) -> &[u32] {
        self.valid_chunks.words()
    }
}
