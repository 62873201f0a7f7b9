//! The heap orchestrates allocation and deallocation: it classifies
//! requests by size, carves best-fit regions out of shared chunks,
//! coalesces freed neighbours, and hands whole reservations back to
//! the operating system.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use crate::free_tree::AvlTree;
use crate::header::FreeRegion;
use crate::header::RegionKind;
use crate::header::CHUNK_SIZE;
use crate::header::CHUNK_THRESHOLD;
use crate::header::GRANULARITY;
use crate::mapper::get_mapper;
use crate::mapper::Mapper;
use crate::region;
use crate::reservation;
use crate::reservation::SpanTable;

/// A single-threaded best-fit heap.  All state lives in the regions
/// themselves; the heap only holds the free-size tree root and the
/// book of live reservations.
pub struct Heap {
    free_tree: AvlTree<FreeRegion>,
    spans: SpanTable,
    mapper: &'static dyn Mapper,
}

// The heap owns every region reachable from its span table; the raw
// pointers inside never alias another heap's.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_mapper(None).expect("the default mapper is always defined")
    }

    /// Builds a heap on the named mapper, e.g. `Some("file")` for
    /// temp-file-backed chunks.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no such mapper is registered.
    pub fn with_mapper(name: Option<&str>) -> Result<Heap, &'static str> {
        Ok(Heap {
            free_tree: AvlTree::new(),
            spans: SpanTable::new(),
            mapper: get_mapper(name)?,
        })
    }

    /// Attempts to allocate `size` bytes at the natural maximal
    /// alignment.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<c_void>> {
        self.aligned_allocate(GRANULARITY, size)
    }

    /// Attempts to allocate `size` bytes whose address is a multiple
    /// of `align`.  Returns `None` for a zero size, a non-power-of-two
    /// alignment, or when the operating system is out of memory; the
    /// heap is unchanged on failure.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[ensures(ret.is_some() ->
              debug_allocation_map::mark_allocated(ret.as_ref().unwrap(), size).is_ok(),
              "Successful allocations do not overlap a live allocation.")]
    pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Option<NonNull<c_void>> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return None;
        }

        let align = align.max(GRANULARITY);

        // One granule is reserved for the header.
        let raw = size
            .checked_add(GRANULARITY - 1)?
            .checked_add(GRANULARITY)?
            & !(GRANULARITY - 1);
        let worst_case = raw.checked_add(align - GRANULARITY)?;

        if raw < CHUNK_THRESHOLD && worst_case <= CHUNK_SIZE {
            self.allocate_chunked(raw, align)
        } else {
            self.allocate_big(raw, align)
        }
    }

    /// Returns an allocation to the heap.  Freed regions coalesce
    /// with free neighbours immediately; a region that grows back to
    /// a whole chunk is handed to the operating system.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[requires(debug_allocation_map::mark_released(&ptr).is_ok(),
               "Released blocks must be live and previously returned by this heap.")]
    pub fn deallocate(&mut self, ptr: NonNull<c_void>) {
        unsafe {
            let rgn = region::from_payload(ptr);

            if region::kind(rgn) == RegionKind::BigAllocated {
                self.deallocate_big(rgn);
            } else {
                debug_assert_eq!(region::kind(rgn), RegionKind::Allocated);
                self.deallocate_chunked(rgn);
            }
        }
    }

    /// Number of reservations currently held from the operating
    /// system.
    pub fn outstanding_reservations(&self) -> usize {
        self.spans.len()
    }

    /// Writes every region on the free-size tree, in size order.
    pub fn dump(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        writeln!(out, "Dump")?;

        unsafe {
            for node in self.free_tree.iter() {
                let rgn = region::from_free_node(node);

                writeln!(out, "Pointer: {:p}", rgn.as_ptr())?;
                writeln!(out, "Size: {}", region::byte_size(rgn))?;
                writeln!(out, "Prev size: {}\n", (*rgn.as_ptr()).prev_byte_size())?;
            }
        }

        out.flush()
    }

    fn allocate_chunked(&mut self, raw: usize, align: usize) -> Option<NonNull<c_void>> {
        unsafe {
            let worst_case = raw + (align - GRANULARITY);
            let mut hint = None;
            let mut rgn = match self.free_tree.lower_bound(worst_case) {
                Some(node) => {
                    hint = self.free_tree.successor(node);
                    self.free_tree.erase(node);
                    region::from_free_node(node)
                }
                None => {
                    let span = reservation::reserve_span(self.mapper, CHUNK_SIZE, GRANULARITY)
                        .ok()?;

                    debug_assert_eq!(span.offset(), 0);

                    let chunk =
                        region::construct_chunk(span.commit as *mut u8, CHUNK_SIZE, 0);
                    self.spans.insert(span);
                    region::retype(chunk, RegionKind::Free)
                }
            };

            // Slack below the aligned payload splits off first.
            let payload = region::payload(rgn).as_ptr() as usize;
            let pre_slack = payload.wrapping_neg() & (align - 1);

            if pre_slack > 0 {
                let left = region::split(rgn, pre_slack);

                if region::kind(left) == RegionKind::Free {
                    self.free_tree.insert_near(hint, region::as_free_node(left));
                }
                rgn = region::next(left);
            }

            if region::byte_size(rgn) > raw {
                rgn = region::split(rgn, raw);
                let rest = region::next(rgn);

                if region::kind(rest) == RegionKind::Free {
                    self.free_tree.insert_near(hint, region::as_free_node(rest));
                }
            }

            region::retype(rgn, RegionKind::Allocated);
            Some(region::payload(rgn))
        }
    }

    fn allocate_big(&mut self, raw: usize, align: usize) -> Option<NonNull<c_void>> {
        let span = reservation::reserve_span(self.mapper, raw, align).ok()?;

        unsafe {
            let rgn = region::construct_chunk(span.commit as *mut u8, raw, span.offset());

            self.spans.insert(span);
            Some(region::payload(rgn))
        }
    }

    unsafe fn deallocate_chunked(&mut self, rgn: NonNull<crate::header::RegionHeader>) {
        let mut rgn = region::retype(rgn, RegionKind::Free);

        // Backward coalesce: the predecessor size field makes this
        // O(1) without any external index.
        let before = region::prev(rgn);
        if before != rgn && region::kind(before) != RegionKind::Allocated {
            if region::kind(before) == RegionKind::Free {
                self.free_tree.erase(region::as_free_node(before));
            }
            rgn = region::merge_with_next(before);
        }

        // Forward coalesce.
        if !region::is_last(rgn) {
            let after = region::next(rgn);

            if region::kind(after) != RegionKind::Allocated {
                if region::kind(after) == RegionKind::Free {
                    self.free_tree.erase(region::as_free_node(after));
                }
                rgn = region::merge_with_next(rgn);
            }
        }

        if region::byte_size(rgn) >= CHUNK_SIZE {
            // The region grew back to its whole chunk.
            self.release_reservation(rgn.as_ptr() as usize);
        } else {
            self.free_tree.insert(region::as_free_node(rgn));
        }
    }

    unsafe fn deallocate_big(&mut self, rgn: NonNull<crate::header::RegionHeader>) {
        let base = rgn.as_ptr() as usize - region::reservation_offset(rgn);
        let size = region::big_byte_size(rgn);

        let span = self.release_reservation(base);
        debug_assert_eq!(span.committed_size, size);
    }

    fn release_reservation(&mut self, base: usize) -> reservation::Span {
        let span = self
            .spans
            .remove(base)
            .unwrap_or_else(|| panic!("released unknown reservation base={:#x}", base));

        if let Err(errno) = reservation::release_span(self.mapper, span.base, span.len) {
            panic!(
                "failed to release reservation base={:#x} len={} errno={}",
                span.base, span.len, errno
            );
        }

        span
    }

    /// Returns `Err` when some of the heap's invariants are violated:
    /// regions must tile their chunks with consistent back-links, no
    /// two free neighbours may survive a deallocation, and a region
    /// is on the tree exactly when its kind says so.
    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    fn check_rep_or_err(&self) -> Result<(), &'static str> {
        use crate::header::RegionHeader;
        use crate::header::FREE_NODE_FOOTPRINT;
        use std::collections::HashSet;

        unsafe {
            let tree_count = self.free_tree.check_invariants();
            let tree_nodes: HashSet<usize> = self
                .free_tree
                .iter()
                .map(|node| node.as_ptr() as usize)
                .collect();

            if tree_nodes.len() != tree_count {
                return Err("tree iteration disagrees with the node count");
            }

            let mut last_size = 0;
            for node in self.free_tree.iter() {
                let size = region::byte_size(region::from_free_node(node));

                if size < last_size {
                    return Err("tree iteration is not sorted by size");
                }
                last_size = size;
            }

            let mut free_regions = 0;
            for span in self.spans.iter() {
                let first = NonNull::new(span.commit as *mut RegionHeader)
                    .ok_or("span with a null commit base")?;

                if region::kind(first) == RegionKind::BigAllocated {
                    if !region::is_last(first) {
                        return Err("big regions must be terminal");
                    }
                    if region::big_byte_size(first) != span.committed_size {
                        return Err("big region size disagrees with its span");
                    }
                    if region::reservation_offset(first) != span.offset() {
                        return Err("big region offset disagrees with its span");
                    }
                    continue;
                }

                let mut total = 0;
                let mut prev_units = 0;
                let mut prev_free = false;
                let mut current = first;

                loop {
                    let header = &*current.as_ptr();

                    if header.prev_units() != prev_units {
                        return Err("stale prev link");
                    }

                    let kind = header.kind();
                    let free = kind == RegionKind::Free || kind == RegionKind::SmallFree;

                    if free && prev_free {
                        return Err("adjacent free regions");
                    }

                    match kind {
                        RegionKind::Free => {
                            free_regions += 1;
                            if header.byte_size() < FREE_NODE_FOOTPRINT {
                                return Err("free region too small for tree linkage");
                            }
                            if !tree_nodes.contains(&(current.as_ptr() as usize)) {
                                return Err("free region missing from the tree");
                            }
                        }
                        RegionKind::SmallFree => {
                            if header.byte_size() >= FREE_NODE_FOOTPRINT {
                                return Err("small free region could hold tree linkage");
                            }
                        }
                        RegionKind::Allocated => {}
                        RegionKind::BigAllocated => {
                            return Err("big region inside a shared chunk");
                        }
                    }

                    total += header.byte_size();
                    prev_free = free;
                    prev_units = header.size_units();

                    if header.is_last() {
                        break;
                    }
                    current = region::next(current);
                }

                if total != span.committed_size {
                    return Err("regions do not tile their chunk");
                }
            }

            if free_regions != tree_count {
                return Err("tree population disagrees with the free regions");
            }
        }

        Ok(())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.retire_live_allocations();

        // Scoped acquisition: every reservation this heap still holds
        // goes back to the operating system.
        for base in self.spans.bases() {
            self.release_reservation(base);
        }
    }
}

impl Heap {
    /// Contract builds track live payloads in a process-wide map;
    /// allocations dying with their heap must be retired there, or a
    /// later heap reusing the address range would look like an
    /// overlap.
    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    fn retire_live_allocations(&self) {
        use crate::header::RegionHeader;

        unsafe {
            for span in self.spans.iter() {
                let first = match NonNull::new(span.commit as *mut RegionHeader) {
                    Some(first) => first,
                    None => continue,
                };

                if region::kind(first) == RegionKind::BigAllocated {
                    let _ = debug_allocation_map::mark_released(&region::payload(first));
                    continue;
                }

                let mut current = first;
                loop {
                    if region::kind(current) == RegionKind::Allocated {
                        let _ = debug_allocation_map::mark_released(&region::payload(current));
                    }

                    if region::is_last(current) {
                        break;
                    }
                    current = region::next(current);
                }
            }
        }
    }

    #[cfg(not(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    )))]
    fn retire_live_allocations(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    #[test]
    fn smoke_test() {
        let mut heap = Heap::new();

        let p1 = heap.allocate(4).expect("Should allocate");
        let p2 = heap
            .aligned_allocate(0x10000, 0x10000)
            .expect("Should allocate");
        let p3 = heap
            .aligned_allocate(0x20_0000, 0x20_0000)
            .expect("Should allocate");

        assert_eq!(p2.as_ptr() as usize % 0x10000, 0);
        assert_eq!(p3.as_ptr() as usize % 0x20_0000, 0);

        // The big allocation must be writable throughout.
        unsafe {
            let words = p3.as_ptr() as *mut u32;
            for i in 0..1024 {
                std::ptr::write(words.add(i), 0x5555_5555);
            }
            for i in 0..1024 {
                assert_eq!(std::ptr::read(words.add(i)), 0x5555_5555);
            }
        }

        heap.deallocate(p1);
        heap.deallocate(p2);
        heap.deallocate(p3);

        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut heap = Heap::new();

        assert_eq!(heap.allocate(0), None);
        assert_eq!(heap.aligned_allocate(0, 8), None);
        assert_eq!(heap.aligned_allocate(24, 8), None);
        assert_eq!(heap.aligned_allocate(16, usize::MAX - 4), None);

        // Failed requests leave no trace.
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn best_fit_reuses_freed_blocks() {
        let mut heap = Heap::new();

        // The pin keeps the chunk alive across the free.
        let pin = heap.allocate(64).expect("Should allocate");
        let block = heap.allocate(1024).expect("Should allocate");

        assert_eq!(heap.outstanding_reservations(), 1);

        heap.deallocate(block);

        let reused = heap.allocate(500).expect("Should allocate");

        assert_eq!(reused, block, "the freed block must be reused");
        assert_eq!(heap.outstanding_reservations(), 1);

        heap.deallocate(reused);
        heap.deallocate(pin);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn coalescing_releases_the_chunk() {
        let mut heap = Heap::new();

        let a = heap.allocate(1024).expect("Should allocate");
        let b = heap.allocate(1024).expect("Should allocate");
        let c = heap.allocate(1024).expect("Should allocate");

        // Three small blocks share one chunk.
        assert_eq!(heap.outstanding_reservations(), 1);

        // Freeing the middle block last exercises both the backward
        // and the forward coalesce in a single deallocation.
        heap.deallocate(a);
        heap.deallocate(c);
        assert_eq!(heap.outstanding_reservations(), 1);

        heap.deallocate(b);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn alignment_slack_becomes_small_free() {
        let mut heap = Heap::new();

        // The first block ends one granule short of a 32-byte
        // boundary, so the next aligned request splits off a
        // single-granule region: too small for the tree.
        let a = heap.allocate(16).expect("Should allocate");
        let b = heap.aligned_allocate(32, 64).expect("Should allocate");

        assert_eq!(b.as_ptr() as usize % 32, 0);
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 48);

        let mut dump = Vec::new();
        heap.dump(&mut dump).expect("dump should succeed");
        let dump = String::from_utf8(dump).expect("dump is text");

        assert!(
            !dump.contains("Size: 16\n"),
            "single-granule slack must stay off the tree: {}",
            dump
        );

        // The slack still coalesces once its neighbours die.
        heap.deallocate(a);
        heap.deallocate(b);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn big_allocations_bypass_the_tree() {
        let mut heap = Heap::new();

        let big = heap
            .aligned_allocate(0x20_0000, 0x20_0000)
            .expect("Should allocate");

        assert_eq!(big.as_ptr() as usize % 0x20_0000, 0);
        assert_eq!(heap.outstanding_reservations(), 1);

        let mut dump = Vec::new();
        heap.dump(&mut dump).expect("dump should succeed");
        assert_eq!(
            std::str::from_utf8(&dump).expect("dump is text"),
            "Dump\n",
            "the free tree must not see dedicated reservations"
        );

        heap.deallocate(big);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn huge_alignment_takes_the_big_path() {
        let mut heap = Heap::new();

        // Small size, but the worst-case slack cannot be carved from
        // one chunk.
        let block = heap
            .aligned_allocate(CHUNK_SIZE, 16)
            .expect("Should allocate");

        assert_eq!(block.as_ptr() as usize % CHUNK_SIZE, 0);
        assert_eq!(heap.outstanding_reservations(), 1);

        heap.deallocate(block);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    #[test]
    fn dump_lists_free_regions() {
        let mut heap = Heap::new();

        let a = heap.allocate(512).expect("Should allocate");
        let b = heap.allocate(512).expect("Should allocate");

        heap.deallocate(a);

        let mut dump = Vec::new();
        heap.dump(&mut dump).expect("dump should succeed");
        let dump = String::from_utf8(dump).expect("dump is text");

        assert!(dump.starts_with("Dump\n"));
        // The freed block and the chunk remainder are both indexed.
        assert_eq!(dump.matches("Pointer: ").count(), 2);

        heap.deallocate(b);
    }

    #[test]
    fn drop_releases_outstanding_chunks() {
        let mut heap = Heap::new();

        let _small = heap.allocate(4096).expect("Should allocate");
        let _big = heap
            .aligned_allocate(0x20_0000, 0x20_0000)
            .expect("Should allocate");

        assert_eq!(heap.outstanding_reservations(), 2);

        // Dropping with live allocations must hand everything back.
        drop(heap);
    }

    #[test]
    fn file_backed_heap_round_trip() {
        let mut heap = Heap::with_mapper(Some("file")).expect("file mapper is registered");

        let block = heap.allocate(4096).expect("Should allocate");

        unsafe {
            let bytes = block.as_ptr() as *mut u8;
            std::ptr::write(bytes, 42);
            assert_eq!(std::ptr::read(bytes), 42);
        }

        heap.deallocate(block);
        assert_eq!(heap.outstanding_reservations(), 0);
    }

    proptest! {
        // Bulk allocate, then deallocate and re-allocate in
        // random-ish order; the contract-build invariant audits the
        // chunks after every operation.
        #[test]
        fn random_order(indices in vec(0..20usize, 1..40)) {
            let mut heap = Heap::new();
            let sizes = [16usize, 48, 500, 1024, 4096, 100_000];

            let mut slots: Vec<Option<NonNull<std::ffi::c_void>>> = Vec::new();
            slots.resize(20, None);

            for index in indices.iter().cloned() {
                if let Some(block) = slots[index].take() {
                    heap.deallocate(block);
                } else {
                    let size = sizes[index % sizes.len()];
                    let block = heap.allocate(size);

                    prop_assert!(block.is_some());
                    slots[index] = block;
                }
            }

            for slot in slots.iter_mut() {
                if let Some(block) = slot.take() {
                    heap.deallocate(block);
                }
            }

            prop_assert_eq!(heap.outstanding_reservations(), 0);
        }

        // Every returned pointer satisfies the requested alignment.
        #[test]
        fn aligned_pointers(requests in vec((4..17u32, 1..8192usize), 1..20)) {
            let mut heap = Heap::new();
            let mut live = Vec::new();

            for (align_log, size) in requests.iter().cloned() {
                let align = 1usize << align_log;
                let block = heap.aligned_allocate(align, size);

                prop_assert!(block.is_some());
                let block = block.unwrap();
                prop_assert_eq!(block.as_ptr() as usize % align, 0);

                live.push(block);
            }

            // Distinct live allocations never overlap.
            let mut ranges: Vec<(usize, usize)> = Vec::new();
            for (i, (_, size)) in requests.iter().cloned().enumerate() {
                ranges.push((live[i].as_ptr() as usize, size));
            }
            ranges.sort_unstable();
            for window in ranges.windows(2) {
                prop_assert!(window[0].0 + window[0].1 <= window[1].0);
            }

            for block in live {
                heap.deallocate(block);
            }

            prop_assert_eq!(heap.outstanding_reservations(), 0);
        }
    }
}
