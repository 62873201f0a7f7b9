//! Pure operations over `RegionHeader`s: constructing chunks,
//! re-typing regions in place, splitting, merging with the next
//! neighbour, and boundary-tag navigation.
//!
//! Everything here is O(1) and works purely on the header words; the
//! free-size tree and the heap decide *when* to call these.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::free_tree::AvlNode;
use crate::header::BigRegion;
use crate::header::FreeRegion;
use crate::header::RegionHeader;
use crate::header::RegionKind;
use crate::header::FREE_NODE_FOOTPRINT;
use crate::header::GRANULARITY;

/// Installs a fresh region covering `[addr, addr + size)`.  The kind
/// is derived from the size: regions too small to host tree linkage
/// become `SmallFree`.
///
/// # Safety
///
/// `addr` must be granule-aligned and writable for `size` bytes.
unsafe fn construct(addr: *mut u8, size: usize) -> NonNull<RegionHeader> {
    debug_assert_eq!(addr as usize % GRANULARITY, 0);
    debug_assert_eq!(size % GRANULARITY, 0);

    let kind = if size < FREE_NODE_FOOTPRINT {
        RegionKind::SmallFree
    } else {
        RegionKind::Free
    };

    let region = addr as *mut RegionHeader;
    std::ptr::write(region, RegionHeader::new(kind, size / GRANULARITY));
    NonNull::new_unchecked(region)
}

/// Installs a `BigAllocated` header covering a whole fresh chunk:
/// the terminal (and only) region of its reservation.
/// `reservation_offset` is the slack between the reservation base and
/// `addr`; it is what deallocation needs to recover the base.
///
/// # Safety
///
/// `addr` must be granule-aligned and writable for `size` bytes.
pub(crate) unsafe fn construct_chunk(
    addr: *mut u8,
    size: usize,
    reservation_offset: usize,
) -> NonNull<RegionHeader> {
    debug_assert_eq!(addr as usize % GRANULARITY, 0);
    debug_assert_eq!(size % GRANULARITY, 0);

    let mut header = RegionHeader::new(RegionKind::BigAllocated, 0);
    header.set_is_last(true);
    header.set_big_byte_size(size);

    let big = addr as *mut BigRegion;
    std::ptr::write(
        big,
        BigRegion {
            header,
            reservation_offset,
        },
    );
    NonNull::new_unchecked(addr as *mut RegionHeader)
}

/// Re-types `region` in place.  The header bits other than the kind
/// survive; the caller guarantees the new kind's view fits (`Free`
/// needs the free-node footprint).
pub(crate) unsafe fn retype(
    region: NonNull<RegionHeader>,
    kind: RegionKind,
) -> NonNull<RegionHeader> {
    debug_assert!(
        kind != RegionKind::Free || (*region.as_ptr()).byte_size() >= FREE_NODE_FOOTPRINT,
        "Free region too small for tree linkage"
    );

    (*region.as_ptr()).set_kind(kind);
    region
}

pub(crate) unsafe fn kind(region: NonNull<RegionHeader>) -> RegionKind {
    (*region.as_ptr()).kind()
}

/// Byte span of the region, header granule included.
pub(crate) unsafe fn byte_size(region: NonNull<RegionHeader>) -> usize {
    (*region.as_ptr()).byte_size()
}

pub(crate) unsafe fn is_last(region: NonNull<RegionHeader>) -> bool {
    (*region.as_ptr()).is_last()
}

/// The following region, or `region` itself at the chunk boundary.
pub(crate) unsafe fn next(region: NonNull<RegionHeader>) -> NonNull<RegionHeader> {
    let header = &*region.as_ptr();

    if header.is_last() {
        return region;
    }

    let addr = (region.as_ptr() as *mut u8).add(header.byte_size());
    NonNull::new_unchecked(addr as *mut RegionHeader)
}

/// The preceding region; `prev == 0` marks the chunk start, where
/// this is `region` itself.
pub(crate) unsafe fn prev(region: NonNull<RegionHeader>) -> NonNull<RegionHeader> {
    let header = &*region.as_ptr();
    let addr = (region.as_ptr() as *mut u8).sub(header.prev_byte_size());

    NonNull::new_unchecked(addr as *mut RegionHeader)
}

/// Splits `region` into two adjacent regions of `first_size` and the
/// remainder, maintaining the `next.prev` back-links.  Returns the
/// first half; the second half is its `next`.
pub(crate) unsafe fn split(
    region: NonNull<RegionHeader>,
    first_size: usize,
) -> NonNull<RegionHeader> {
    let size = byte_size(region);

    debug_assert_eq!(first_size % GRANULARITY, 0);
    debug_assert!(first_size > 0 && first_size < size);

    let mut region = region;
    let second_size = size - first_size;

    if first_size < FREE_NODE_FOOTPRINT {
        region = retype(region, RegionKind::SmallFree);
    }

    (*region.as_ptr()).set_size_units(first_size / GRANULARITY);

    let second = construct(
        (region.as_ptr() as *mut u8).add(first_size),
        second_size,
    );
    (*second.as_ptr()).set_prev_units(first_size / GRANULARITY);
    (*second.as_ptr()).set_is_last((*region.as_ptr()).is_last());
    (*region.as_ptr()).set_is_last(false);

    if !(*second.as_ptr()).is_last() {
        (*next(second).as_ptr()).set_prev_units(second_size / GRANULARITY);
    }

    region
}

/// Absorbs the region following `region`.  The merged region is
/// promoted to `Free` when it grows past the free-node footprint,
/// and the downstream back-link is refreshed.
pub(crate) unsafe fn merge_with_next(region: NonNull<RegionHeader>) -> NonNull<RegionHeader> {
    if is_last(region) {
        return region;
    }

    let mut region = region;
    let absorbed = next(region);

    {
        let header = &mut *region.as_ptr();
        let absorbed = &*absorbed.as_ptr();

        header.set_size_units(header.size_units() + absorbed.size_units());
        header.set_is_last(absorbed.is_last());
    }

    if byte_size(region) >= FREE_NODE_FOOTPRINT {
        region = retype(region, RegionKind::Free);
    }

    if !is_last(region) {
        (*next(region).as_ptr()).set_prev_units((*region.as_ptr()).size_units());
    }

    region
}

/// Only valid for `BigAllocated` regions.
pub(crate) unsafe fn big_byte_size(region: NonNull<RegionHeader>) -> usize {
    (*region.as_ptr()).big_byte_size()
}

/// Only valid for `BigAllocated` regions.
pub(crate) unsafe fn reservation_offset(region: NonNull<RegionHeader>) -> usize {
    debug_assert_eq!(kind(region), RegionKind::BigAllocated);
    (*(region.as_ptr() as *mut BigRegion)).reservation_offset
}

/// A `Free` region's header doubles as its tree node; both views
/// share the region's address.
pub(crate) unsafe fn as_free_node(region: NonNull<RegionHeader>) -> NonNull<FreeRegion> {
    debug_assert_eq!(kind(region), RegionKind::Free);
    region.cast()
}

pub(crate) fn from_free_node(node: NonNull<FreeRegion>) -> NonNull<RegionHeader> {
    node.cast()
}

/// The bytes handed to the caller start one granule past the header.
pub(crate) unsafe fn payload(region: NonNull<RegionHeader>) -> NonNull<c_void> {
    NonNull::new_unchecked((region.as_ptr() as *mut u8).add(GRANULARITY) as *mut c_void)
}

pub(crate) unsafe fn from_payload(payload: NonNull<c_void>) -> NonNull<RegionHeader> {
    NonNull::new_unchecked((payload.as_ptr() as *mut u8).sub(GRANULARITY) as *mut RegionHeader)
}

impl AvlNode for FreeRegion {
    fn parent(&self) -> *mut FreeRegion {
        self.parent
    }

    fn set_parent(&mut self, parent: *mut FreeRegion) {
        self.parent = parent;
    }

    fn child(&self, right: bool) -> *mut FreeRegion {
        self.children[right as usize]
    }

    fn set_child(&mut self, right: bool, child: *mut FreeRegion) {
        self.children[right as usize] = child;
    }

    fn balance(&self) -> i8 {
        self.header.balance()
    }

    fn set_balance(&mut self, balance: i8) {
        self.header.set_balance(balance);
    }

    /// Regions compare by their byte span, so `lower_bound` is
    /// best-fit.
    fn key(&self) -> usize {
        self.header.byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A granule-aligned backing buffer for header surgery.
    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    impl Arena {
        fn new() -> Box<Arena> {
            Box::new(Arena([0; 4096]))
        }

        fn base(&mut self) -> *mut u8 {
            self.0.as_mut_ptr()
        }
    }

    #[test]
    fn chunk_construction() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);

            assert_eq!(kind(chunk), RegionKind::BigAllocated);
            assert_eq!(big_byte_size(chunk), 4096);
            assert_eq!(reservation_offset(chunk), 0);
            assert!(is_last(chunk));

            // Boundary fixed points: a lone region is its own
            // neighbour on both sides.
            assert_eq!(next(chunk), chunk);
            assert_eq!(prev(chunk), chunk);
        }
    }

    #[test]
    fn split_maintains_adjacency() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);
            let first = retype(chunk, RegionKind::Free);

            let first = split(first, 1024);
            assert_eq!(byte_size(first), 1024);
            assert!(!is_last(first));

            let second = next(first);
            assert_eq!(byte_size(second), 4096 - 1024);
            assert_eq!((*second.as_ptr()).prev_byte_size(), 1024);
            assert!(is_last(second));
            assert_eq!(prev(second), first);

            // Split the tail again and check the back-link refresh.
            let second = split(second, 512);
            let third = next(second);

            assert_eq!(byte_size(second), 512);
            assert_eq!(byte_size(third), 4096 - 1024 - 512);
            assert_eq!((*third.as_ptr()).prev_byte_size(), 512);
            assert!(is_last(third));
        }
    }

    #[test]
    fn undersized_split_halves_become_small_free() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);
            let region = retype(chunk, RegionKind::Free);

            // A single-granule first half cannot hold tree linkage.
            let region = split(region, GRANULARITY);

            assert_eq!(kind(region), RegionKind::SmallFree);
            assert_eq!(byte_size(region), GRANULARITY);
            assert_eq!(kind(next(region)), RegionKind::Free);

            // Same for a single-granule second half.
            let tail = split(next(region), 4096 - 2 * GRANULARITY);
            assert_eq!(kind(tail), RegionKind::Free);
            assert_eq!(kind(next(tail)), RegionKind::SmallFree);
        }
    }

    #[test]
    fn merge_restores_the_chunk() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);
            let first = split(retype(chunk, RegionKind::Free), 1024);
            let second = split(next(first), 512);

            // Merge forward twice; sizes, terminality, and kind must
            // all come back.
            let merged = merge_with_next(first);
            assert_eq!(byte_size(merged), 1024 + 512);
            assert!(!is_last(merged));
            assert_eq!((*next(merged).as_ptr()).prev_byte_size(), 1024 + 512);

            let merged = merge_with_next(merged);
            assert_eq!(byte_size(merged), 4096);
            assert_eq!(kind(merged), RegionKind::Free);
            assert!(is_last(merged));
            assert_eq!(next(merged), merged);

            let _ = second;
        }
    }

    #[test]
    fn merge_absorbs_small_free() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);
            let region = split(retype(chunk, RegionKind::Free), GRANULARITY);

            assert_eq!(kind(region), RegionKind::SmallFree);

            let merged = merge_with_next(region);

            // Absorbing the tail makes the small region large enough
            // for tree linkage again.
            assert_eq!(kind(merged), RegionKind::Free);
            assert_eq!(byte_size(merged), 4096);
        }
    }

    #[test]
    fn payload_round_trip() {
        let mut arena = Arena::new();

        unsafe {
            let chunk = construct_chunk(arena.base(), 4096, 0);
            let ptr = payload(chunk);

            assert_eq!(
                ptr.as_ptr() as usize,
                chunk.as_ptr() as usize + GRANULARITY
            );
            assert_eq!(from_payload(ptr), chunk);
        }
    }

    #[test]
    fn big_offset_round_trip() {
        let mut arena = Arena::new();

        unsafe {
            let offset = 3 * GRANULARITY;
            let chunk = construct_chunk(arena.base().add(offset), 2048, offset);

            assert_eq!(reservation_offset(chunk), offset);
            assert_eq!(
                chunk.as_ptr() as usize - reservation_offset(chunk),
                arena.base() as usize
            );
        }
    }
}
